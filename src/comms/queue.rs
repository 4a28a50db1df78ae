use super::error::{CommsError, CommsResult, EntityKind};
use super::handler::SharedHandler;
use super::message::{generate_id, require_non_empty, AgentId, Message, QueueId, SubscriptionId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Bounded capacity; `None` falls back to the configured `max_queue_size`.
    pub max_size: Option<usize>,
    pub persistent: bool,
    /// Dequeue priority-then-FIFO instead of pure FIFO.
    pub priority: bool,
}

/// A buffered queue entry. `sequence` is assigned at first enqueue and kept
/// across redeliveries so a requeued message keeps its place.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Arc<Message>,
    pub sequence: u64,
    pub attempt: u32,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    // Max-heap: higher priority wins, then the lower (older) sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

enum QueueBuffer {
    Fifo(VecDeque<QueuedMessage>),
    Priority(BinaryHeap<QueuedMessage>),
}

impl QueueBuffer {
    fn len(&self) -> usize {
        match self {
            Self::Fifo(items) => items.len(),
            Self::Priority(items) => items.len(),
        }
    }

    fn push(&mut self, entry: QueuedMessage) {
        match self {
            Self::Fifo(items) => items.push_back(entry),
            Self::Priority(items) => items.push(entry),
        }
    }

    fn push_front(&mut self, entry: QueuedMessage) {
        match self {
            Self::Fifo(items) => items.push_front(entry),
            Self::Priority(items) => items.push(entry),
        }
    }

    fn pop(&mut self) -> Option<QueuedMessage> {
        match self {
            Self::Fifo(items) => items.pop_front(),
            Self::Priority(items) => items.pop(),
        }
    }

    fn clear(&mut self) {
        match self {
            Self::Fifo(items) => items.clear(),
            Self::Priority(items) => items.clear(),
        }
    }
}

#[derive(Clone)]
struct Consumer {
    subscription_id: SubscriptionId,
    agent_id: AgentId,
    handler: SharedHandler,
    busy: bool,
}

struct WorkQueue {
    id: QueueId,
    name: String,
    max_size: usize,
    persistent: bool,
    priority: bool,
    created_at: DateTime<Utc>,
    buffer: QueueBuffer,
    consumers: Vec<Consumer>,
    cursor: usize,
    next_sequence: u64,
    enqueued_total: u64,
}

/// Read-only queue snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub id: QueueId,
    pub name: String,
    pub max_size: usize,
    pub persistent: bool,
    pub priority: bool,
    pub depth: usize,
    pub consumers: usize,
    pub enqueued_total: u64,
    pub created_at: DateTime<Utc>,
}

impl WorkQueue {
    fn info(&self) -> QueueInfo {
        QueueInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            max_size: self.max_size,
            persistent: self.persistent,
            priority: self.priority,
            depth: self.buffer.len(),
            consumers: self.consumers.len(),
            enqueued_total: self.enqueued_total,
            created_at: self.created_at,
        }
    }
}

/// A message handed to exactly one consumer. The consumer stays busy until
/// [`QueueRegistry::release`] is called for it.
#[derive(Clone)]
pub struct QueueAssignment {
    pub queue_id: QueueId,
    pub entry: QueuedMessage,
    pub subscription_id: SubscriptionId,
    pub agent_id: AgentId,
    pub handler: SharedHandler,
}

/// Point-to-point work queues with competing consumers.
#[derive(Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<QueueId, Arc<Mutex<WorkQueue>>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        name: &str,
        options: QueueOptions,
        default_max_size: usize,
    ) -> CommsResult<QueueId> {
        let max_size = options.max_size.unwrap_or(default_max_size);
        if max_size == 0 {
            return Err(CommsError::validation("queue max_size must be greater than 0"));
        }

        let queue = WorkQueue {
            id: generate_id("queue"),
            name: name.to_string(),
            max_size,
            persistent: options.persistent,
            priority: options.priority,
            created_at: Utc::now(),
            buffer: if options.priority {
                QueueBuffer::Priority(BinaryHeap::new())
            } else {
                QueueBuffer::Fifo(VecDeque::new())
            },
            consumers: Vec::new(),
            cursor: 0,
            next_sequence: 0,
            enqueued_total: 0,
        };
        let id = queue.id.clone();
        self.queues
            .write()
            .insert(id.clone(), Arc::new(Mutex::new(queue)));
        tracing::debug!(queue_id = %id, name, max_size, priority = options.priority, "queue created");
        Ok(id)
    }

    fn entry(&self, queue_id: &str) -> CommsResult<Arc<Mutex<WorkQueue>>> {
        self.queues
            .read()
            .get(queue_id)
            .cloned()
            .ok_or_else(|| CommsError::not_found(EntityKind::Queue, queue_id))
    }

    /// Attach a competing consumer.
    pub fn subscribe(
        &self,
        queue_id: &str,
        agent_id: &str,
        handler: SharedHandler,
    ) -> CommsResult<SubscriptionId> {
        require_non_empty(agent_id, "agent_id")?;
        let entry = self.entry(queue_id)?;
        let subscription_id = generate_id("queue-sub");
        entry.lock().consumers.push(Consumer {
            subscription_id: subscription_id.clone(),
            agent_id: agent_id.to_string(),
            handler,
            busy: false,
        });
        Ok(subscription_id)
    }

    /// Detach a consumer owned by `agent_id`. Unknown ids are ignored.
    pub fn unsubscribe(&self, agent_id: &str, subscription_id: &str) -> bool {
        let entries: Vec<_> = self.queues.read().values().cloned().collect();
        for entry in entries {
            let mut queue = entry.lock();
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| {
                !(consumer.subscription_id == subscription_id && consumer.agent_id == agent_id)
            });
            if queue.consumers.len() != before {
                return true;
            }
        }
        false
    }

    /// Buffer a message. Rejects with `CapacityExceeded` when full; nothing
    /// is buffered in that case. Returns the new depth.
    pub fn enqueue(&self, queue_id: &str, message: Arc<Message>) -> CommsResult<usize> {
        let entry = self.entry(queue_id)?;
        let mut queue = entry.lock();
        if queue.buffer.len() >= queue.max_size {
            return Err(CommsError::CapacityExceeded {
                queue_id: queue_id.to_string(),
                max_size: queue.max_size,
            });
        }
        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        queue.enqueued_total += 1;
        queue.buffer.push(QueuedMessage {
            message,
            sequence,
            attempt: 0,
        });
        Ok(queue.buffer.len())
    }

    /// Put an already-admitted message back for redelivery, ahead of newer
    /// entries. Capacity is not re-checked.
    pub fn requeue(&self, queue_id: &str, entry: QueuedMessage) -> CommsResult<()> {
        let queue = self.entry(queue_id)?;
        queue.lock().buffer.push_front(entry);
        Ok(())
    }

    /// Pop the next message for the next idle consumer (round-robin), marking
    /// that consumer busy. `None` when the buffer is empty or every consumer
    /// is busy.
    pub fn next_assignment(&self, queue_id: &str) -> Option<QueueAssignment> {
        let entry = self.entry(queue_id).ok()?;
        let mut queue = entry.lock();
        if queue.buffer.len() == 0 || queue.consumers.is_empty() {
            return None;
        }

        let consumer_count = queue.consumers.len();
        let start = queue.cursor % consumer_count;
        let index = (0..consumer_count)
            .map(|offset| (start + offset) % consumer_count)
            .find(|&index| !queue.consumers[index].busy)?;
        let queued = queue.buffer.pop()?;

        queue.cursor = index + 1;
        let consumer = &mut queue.consumers[index];
        consumer.busy = true;
        Some(QueueAssignment {
            queue_id: queue_id.to_string(),
            entry: queued,
            subscription_id: consumer.subscription_id.clone(),
            agent_id: consumer.agent_id.clone(),
            handler: consumer.handler.clone(),
        })
    }

    /// Mark a consumer idle again after its handler completed.
    pub fn release(&self, queue_id: &str, subscription_id: &str) {
        let Ok(entry) = self.entry(queue_id) else {
            return;
        };
        let mut queue = entry.lock();
        if let Some(consumer) = queue
            .consumers
            .iter_mut()
            .find(|consumer| consumer.subscription_id == subscription_id)
        {
            consumer.busy = false;
        }
    }

    pub fn depth(&self, queue_id: &str) -> CommsResult<usize> {
        Ok(self.entry(queue_id)?.lock().buffer.len())
    }

    pub fn get(&self, queue_id: &str) -> CommsResult<QueueInfo> {
        Ok(self.entry(queue_id)?.lock().info())
    }

    /// Snapshot of all queues, oldest first.
    pub fn list(&self) -> Vec<QueueInfo> {
        let entries: Vec<_> = self.queues.read().values().cloned().collect();
        let mut queues: Vec<QueueInfo> = entries.iter().map(|entry| entry.lock().info()).collect();
        queues.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        queues
    }

    pub fn delete(&self, queue_id: &str) -> CommsResult<QueueInfo> {
        let entry = self
            .queues
            .write()
            .remove(queue_id)
            .ok_or_else(|| CommsError::not_found(EntityKind::Queue, queue_id))?;
        let mut queue = entry.lock();
        let info = queue.info();
        queue.buffer.clear();
        queue.consumers.clear();
        Ok(info)
    }

    /// Detach every consumer owned by `agent_id`.
    pub fn remove_agent(&self, agent_id: &str) {
        let entries: Vec<_> = self.queues.read().values().cloned().collect();
        for entry in entries {
            entry
                .lock()
                .consumers
                .retain(|consumer| consumer.agent_id != agent_id);
        }
    }

    pub fn count(&self) -> usize {
        self.queues.read().len()
    }

    pub fn consumer_count(&self) -> usize {
        let entries: Vec<_> = self.queues.read().values().cloned().collect();
        entries.iter().map(|entry| entry.lock().consumers.len()).sum()
    }

    pub fn total_depth(&self) -> usize {
        let entries: Vec<_> = self.queues.read().values().cloned().collect();
        entries.iter().map(|entry| entry.lock().buffer.len()).sum()
    }

    pub fn clear(&self) {
        let entries: Vec<_> = self.queues.write().drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            let mut queue = entry.lock();
            queue.buffer.clear();
            queue.consumers.clear();
        }
    }
}
