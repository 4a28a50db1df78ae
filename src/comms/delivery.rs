//! Delivery engine: admission, routing, dispatch, acknowledgment tracking,
//! retries, per-lane ordering, inboxes, dead letters and retention.
//!
//! Every send runs the same pipeline. Admission validates the envelope and
//! resolves the route before anything observable happens, so a rejected
//! message leaves no trace. Dispatch then fans out to recipients; each
//! recipient's handlers run on their own tokio tasks, and a fault (error or
//! panic) is caught per recipient.

use super::channel::{ChannelKind, ChannelRegistry};
use super::correlator::Correlator;
use super::error::{CommsError, CommsResult, EntityKind};
use super::events::{DeliveryEvent, EventBus, EventReceiver};
use super::handler::SharedHandler;
use super::message::{AgentId, Message, MessageId, MessageStatus, MessageTarget, QueueId, SubscriptionId};
use super::metrics::{Counter, EntityGauges, MetricsCollector, MetricsSnapshot};
use super::queue::{QueueAssignment, QueueRegistry, QueuedMessage};
use super::retry::RetryPolicy;
use super::subscription::SubscriptionRegistry;
use crate::config::{CommsConfig, DeliveryStrategy};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const DIRECT_LANE: &str = "direct";
const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(30);
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Direct { lane: String },
    Queue { queue_id: QueueId, sequence: u64 },
}

/// One message on its way to one recipient.
#[derive(Debug, Clone)]
struct Delivery {
    message: Arc<Message>,
    agent_id: AgentId,
    /// Redeliveries so far; the first delivery is attempt 0.
    attempt: u32,
    route: Route,
    /// The message resolved a pending request, so the correlator consumed it.
    answered_request: bool,
}

type AckKey = (MessageId, AgentId);

impl Delivery {
    fn key(&self) -> AckKey {
        (self.message.id.clone(), self.agent_id.clone())
    }

    fn lane(&self) -> &str {
        match &self.route {
            Route::Direct { lane } => lane,
            Route::Queue { queue_id, .. } => queue_id,
        }
    }
}

struct PendingAck {
    delivery: Delivery,
    since: DateTime<Utc>,
    /// Handlers for this attempt have not returned yet.
    in_flight: bool,
}

/// Sender half of an ordering lane plus the generation of its worker.
struct Lane {
    generation: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

/// A message that could not be delivered.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message: Message,
    pub agent_id: Option<AgentId>,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// A retained message with its latest lifecycle status.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub message: Message,
    pub status: MessageStatus,
    pub admitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct RetainedMessage {
    message: Arc<Message>,
    status: MessageStatus,
    admitted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RetainedMessage {
    fn record(&self) -> MessageRecord {
        MessageRecord {
            message: Message::clone(&self.message),
            status: self.status,
            admitted_at: self.admitted_at,
            updated_at: self.updated_at,
        }
    }
}

/// Admitted messages in admission order, evicted once older than the
/// retention window.
#[derive(Default)]
struct RetentionStore {
    records: HashMap<MessageId, RetainedMessage>,
    order: VecDeque<MessageId>,
}

impl RetentionStore {
    fn insert(&mut self, message: Arc<Message>) {
        let now = Utc::now();
        let id = message.id.clone();
        self.records.insert(
            id.clone(),
            RetainedMessage {
                message,
                status: MessageStatus::Admitted,
                admitted_at: now,
                updated_at: now,
            },
        );
        self.order.push_back(id);
    }

    /// Terminal states stick: a late update for another recipient does not
    /// reopen a message that already failed, expired or was acknowledged.
    fn set_status(&mut self, message_id: &str, status: MessageStatus) {
        if let Some(record) = self.records.get_mut(message_id) {
            if !record.status.is_terminal() {
                record.status = status;
                record.updated_at = Utc::now();
            }
        }
    }

    fn get(&self, message_id: &str) -> Option<MessageRecord> {
        self.records.get(message_id).map(RetainedMessage::record)
    }

    fn recent(&self, limit: usize) -> Vec<MessageRecord> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.records.get(id))
            .take(limit)
            .map(RetainedMessage::record)
            .collect()
    }

    fn sweep(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while let Some(id) = self.order.front() {
            let stale = self
                .records
                .get(id)
                .is_none_or(|record| record.admitted_at < cutoff);
            if !stale {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                if self.records.remove(&id).is_some() {
                    evicted += 1;
                }
            }
        }
        evicted
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }
}

enum Plan {
    Recipients { agents: Vec<AgentId>, lane: String },
    Queued { queue_id: QueueId },
}

/// Owns the registries and every piece of in-flight delivery state.
pub struct DeliveryEngine {
    config: CommsConfig,
    policy: RetryPolicy,
    channels: ChannelRegistry,
    queues: QueueRegistry,
    subscriptions: SubscriptionRegistry,
    correlator: Correlator,
    metrics: MetricsCollector,
    events: EventBus,
    acks: Mutex<HashMap<AckKey, PendingAck>>,
    inboxes: Mutex<HashMap<AgentId, VecDeque<Arc<Message>>>>,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    retention: Mutex<RetentionStore>,
    lanes: Mutex<HashMap<(AgentId, String), Lane>>,
    lane_generation: AtomicU64,
    accepting: AtomicBool,
    tracker: TaskTracker,
    /// Cancels ack deadlines, retry backoffs and the sweeper.
    timers: CancellationToken,
    /// Stops lane workers once the shutdown grace period is over.
    halt: CancellationToken,
}

impl DeliveryEngine {
    pub fn new(config: CommsConfig) -> Arc<Self> {
        Arc::new(Self {
            policy: config.retry_policy(),
            metrics: MetricsCollector::new(config.metrics_enabled),
            events: EventBus::new(config.event_capacity),
            config,
            channels: ChannelRegistry::new(),
            queues: QueueRegistry::new(),
            subscriptions: SubscriptionRegistry::new(),
            correlator: Correlator::new(),
            acks: Mutex::new(HashMap::new()),
            inboxes: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(VecDeque::new()),
            retention: Mutex::new(RetentionStore::default()),
            lanes: Mutex::new(HashMap::new()),
            lane_generation: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            tracker: TaskTracker::new(),
            timers: CancellationToken::new(),
            halt: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &CommsConfig {
        &self.config
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> CommsResult<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(CommsError::NotRunning)
        }
    }

    /// Spawn the background sweeper for retention records, stale acks and
    /// abandoned requests.
    pub fn start(self: &Arc<Self>) {
        let period = self
            .config
            .message_retention()
            .min(MAX_SWEEP_PERIOD)
            .max(MIN_SWEEP_PERIOD);
        let engine = Arc::downgrade(self);
        let timers = self.timers.clone();
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = timers.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        engine.sweep();
                    }
                }
            }
        });
    }

    // ── Admission & routing ──────────────────────────────────────

    /// Admit and route a message. Returns its id once every recipient has
    /// been scheduled; handler outcomes surface as [`DeliveryEvent`]s.
    pub fn send(self: &Arc<Self>, message: Message) -> CommsResult<MessageId> {
        self.submit(message, &[])
    }

    /// Like [`send`](Self::send) for `Broadcast` targets, skipping `exclude`.
    pub fn send_excluding(
        self: &Arc<Self>,
        message: Message,
        exclude: &[AgentId],
    ) -> CommsResult<MessageId> {
        self.submit(message, exclude)
    }

    fn submit(self: &Arc<Self>, message: Message, exclude: &[AgentId]) -> CommsResult<MessageId> {
        self.ensure_accepting()?;
        message.validate(self.config.max_message_size)?;
        if message.is_expired() {
            return Err(CommsError::Timeout {
                operation: format!("admit {}", message.id),
                timeout_ms: message.ttl_ms.unwrap_or(0),
            });
        }

        let message = Arc::new(message);
        let plan = self.plan(&message, exclude)?;
        self.admit(&message);
        let answered_request = self.correlator.resolve(&message);

        match plan {
            Plan::Queued { queue_id } => self.pump_queue(&queue_id),
            Plan::Recipients { agents, .. } if agents.is_empty() => {
                if !answered_request {
                    self.dead_letter(&message, None, "no recipients", 0);
                }
            }
            Plan::Recipients { agents, lane } => {
                for agent_id in agents {
                    self.dispatch(Delivery {
                        message: Arc::clone(&message),
                        agent_id,
                        attempt: 0,
                        route: Route::Direct { lane: lane.clone() },
                        answered_request,
                    });
                }
            }
        }
        Ok(message.id.clone())
    }

    /// Resolve recipients. Only a queue target mutates state (the enqueue),
    /// and only once every check has passed.
    fn plan(&self, message: &Arc<Message>, exclude: &[AgentId]) -> CommsResult<Plan> {
        let agents = match &message.target {
            MessageTarget::Agent(agent_id) => vec![agent_id.clone()],
            MessageTarget::Agents(agent_ids) => {
                let mut seen = BTreeSet::new();
                agent_ids
                    .iter()
                    .filter(|agent_id| seen.insert(agent_id.as_str()))
                    .cloned()
                    .collect()
            }
            MessageTarget::Broadcast => self
                .subscriptions
                .known_agents()
                .into_iter()
                .filter(|agent_id| *agent_id != message.sender && !exclude.contains(agent_id))
                .collect(),
            MessageTarget::Channel(channel_id) => {
                let (kind, participants) = self.channels.recipients(channel_id, &message.sender)?;
                let filtered = kind == ChannelKind::Topic && self.config.enable_filtering;
                participants
                    .into_iter()
                    .filter(|agent_id| {
                        !filtered
                            || self
                                .subscriptions
                                .has_subscription(agent_id, &message.message_type)
                    })
                    .collect()
            }
            MessageTarget::Queue(queue_id) => {
                self.queues.enqueue(queue_id, Arc::clone(message))?;
                return Ok(Plan::Queued {
                    queue_id: queue_id.clone(),
                });
            }
        };
        Ok(Plan::Recipients {
            agents,
            lane: message.target.lane(),
        })
    }

    fn admit(&self, message: &Arc<Message>) {
        self.metrics.record(Counter::Sent);
        if self.config.enable_persistence {
            self.retention.lock().insert(Arc::clone(message));
        }
        tracing::debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            sender = %message.sender,
            target = ?message.target,
            "message admitted"
        );
    }

    fn dispatch(self: &Arc<Self>, delivery: Delivery) {
        if self.config.strategy == DeliveryStrategy::Polling {
            self.deposit(delivery);
        } else if self.config.enable_ordering {
            self.enqueue_on_lane(delivery);
        } else {
            let engine = Arc::clone(self);
            self.tracker.spawn(async move { engine.execute(delivery).await });
        }
    }

    // ── Ordering lanes ───────────────────────────────────────────

    fn enqueue_on_lane(self: &Arc<Self>, delivery: Delivery) {
        let key = (delivery.agent_id.clone(), delivery.lane().to_string());
        let mut lanes = self.lanes.lock();
        let delivery = match lanes.get(&key) {
            Some(lane) => match lane.sender.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(delivery)) => delivery,
            },
            None => delivery,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        // The receiver is alive until the worker below exits.
        let _ = sender.send(delivery);
        let generation = self.lane_generation.fetch_add(1, Ordering::Relaxed);
        lanes.insert(key.clone(), Lane { generation, sender });
        drop(lanes);
        self.spawn_lane_worker(key, generation, receiver);
    }

    fn spawn_lane_worker(
        self: &Arc<Self>,
        key: (AgentId, String),
        generation: u64,
        mut receiver: mpsc::UnboundedReceiver<Delivery>,
    ) {
        let engine = Arc::clone(self);
        let halt = self.halt.clone();
        self.tracker.spawn(async move {
            tracing::trace!(agent_id = %key.0, lane = %key.1, "lane worker started");
            loop {
                let next = tokio::select! {
                    biased;
                    () = halt.cancelled() => break,
                    next = receiver.recv() => next,
                };
                let Some(delivery) = next else { break };
                engine.execute(delivery).await;
                if engine.retire_idle_lane(&key, generation, &receiver) {
                    break;
                }
            }
            tracing::trace!(agent_id = %key.0, lane = %key.1, "lane worker stopped");
        });
    }

    /// Unregister a drained lane so its worker can exit. Senders only push
    /// while holding the `lanes` lock, so an empty receiver observed under
    /// that lock stays empty once the entry is gone.
    fn retire_idle_lane(
        &self,
        key: &(AgentId, String),
        generation: u64,
        receiver: &mpsc::UnboundedReceiver<Delivery>,
    ) -> bool {
        let mut lanes = self.lanes.lock();
        if !receiver.is_empty() {
            return false;
        }
        if lanes
            .get(key)
            .is_some_and(|lane| lane.generation == generation)
        {
            lanes.remove(key);
        }
        true
    }

    /// Drop every agent's lane for a deleted channel or queue. Deliveries
    /// already buffered still run.
    pub fn close_lanes(&self, lane: &str) {
        self.lanes.lock().retain(|(_, name), _| name != lane);
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }

    // ── Dispatch ─────────────────────────────────────────────────

    async fn execute(self: &Arc<Self>, delivery: Delivery) {
        if delivery.message.is_expired() {
            self.expire(&delivery.message, &delivery.agent_id);
            return;
        }

        let handlers = self
            .subscriptions
            .handlers_for(&delivery.agent_id, &delivery.message.message_type);
        if handlers.is_empty() {
            self.deposit(delivery);
            return;
        }

        let tracked = self.track(&delivery);
        let message = &delivery.message;
        let outcomes = join_all(handlers.into_iter().map(|(subscription_id, handler)| {
            let message = Arc::clone(message);
            async move { (subscription_id, self.invoke(handler, message).await) }
        }))
        .await;
        self.settle(delivery, tracked, outcomes);
    }

    /// Run one handler on its own task so a panic is contained to it.
    async fn invoke(&self, handler: SharedHandler, message: Arc<Message>) -> Result<(), String> {
        let task = self
            .tracker
            .spawn(async move { handler.handle(message).await });
        match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(format!("{error:#}")),
            Err(error) if error.is_panic() => Err(panic_message(error.into_panic())),
            Err(error) => Err(error.to_string()),
        }
    }

    fn settle(
        self: &Arc<Self>,
        delivery: Delivery,
        tracked: bool,
        outcomes: Vec<(SubscriptionId, Result<(), String>)>,
    ) {
        let mut faulted = false;
        for (subscription_id, outcome) in outcomes {
            let Err(error) = outcome else { continue };
            faulted = true;
            self.metrics.record(Counter::HandlerFaults);
            tracing::warn!(
                message_id = %delivery.message.id,
                agent_id = %delivery.agent_id,
                subscription_id = %subscription_id,
                attempt = delivery.attempt,
                "handler fault: {error}"
            );
            self.events.publish(DeliveryEvent::HandlerFault {
                message_id: delivery.message.id.clone(),
                agent_id: delivery.agent_id.clone(),
                subscription_id,
                error,
            });
        }

        if !faulted {
            self.record_delivered(&delivery);
            if tracked && self.mark_settled(&delivery.key()) {
                self.set_status(&delivery.message.id, MessageStatus::AwaitingAck);
                if self.config.retries_enabled() {
                    self.arm_ack_deadline(&delivery);
                }
            }
            return;
        }

        if tracked && self.acks.lock().remove(&delivery.key()).is_none() {
            // Acknowledged from inside the handler before it faulted.
            return;
        }
        if self.config.retries_enabled() {
            self.retry_or_fail(delivery, "handler fault");
        } else {
            self.fail(delivery, "handler fault");
        }
    }

    fn record_delivered(&self, delivery: &Delivery) {
        self.metrics.record(Counter::Delivered);
        self.set_status(&delivery.message.id, MessageStatus::Delivered);
        tracing::debug!(
            message_id = %delivery.message.id,
            agent_id = %delivery.agent_id,
            attempt = delivery.attempt,
            "message delivered"
        );
        self.events.publish(DeliveryEvent::Delivered {
            message_id: delivery.message.id.clone(),
            agent_id: delivery.agent_id.clone(),
            attempt: delivery.attempt,
        });
    }

    // ── Inboxes ──────────────────────────────────────────────────

    fn deposit(&self, delivery: Delivery) {
        if delivery.answered_request {
            return;
        }
        if delivery.message.is_expired() {
            self.expire(&delivery.message, &delivery.agent_id);
            return;
        }

        let evicted = {
            let mut inboxes = self.inboxes.lock();
            let inbox = inboxes.entry(delivery.agent_id.clone()).or_default();
            let evicted = if inbox.len() >= self.config.max_queue_size {
                inbox.pop_front()
            } else {
                None
            };
            inbox.push_back(Arc::clone(&delivery.message));
            evicted
        };
        if let Some(evicted) = evicted {
            self.dead_letter(&evicted, Some(&delivery.agent_id), "inbox overflow", 1);
        }
        self.record_delivered(&delivery);
    }

    /// Drain up to `max` messages from an agent's inbox, oldest first.
    /// Messages whose TTL elapsed while waiting are expired instead.
    pub fn poll_messages(&self, agent_id: &str, max: usize) -> Vec<Arc<Message>> {
        let mut drained = Vec::new();
        let mut expired = Vec::new();
        {
            let mut inboxes = self.inboxes.lock();
            if let Some(inbox) = inboxes.get_mut(agent_id) {
                while drained.len() < max {
                    let Some(message) = inbox.pop_front() else {
                        break;
                    };
                    if message.is_expired() {
                        expired.push(message);
                    } else {
                        drained.push(message);
                    }
                }
            }
        }
        for message in expired {
            self.expire(&message, agent_id);
        }
        drained
    }

    pub fn inbox_len(&self, agent_id: &str) -> usize {
        self.inboxes.lock().get(agent_id).map_or(0, VecDeque::len)
    }

    // ── Acknowledgments & retries ────────────────────────────────

    fn track(&self, delivery: &Delivery) -> bool {
        if !self.config.enable_persistence {
            return false;
        }
        self.acks.lock().insert(
            delivery.key(),
            PendingAck {
                delivery: delivery.clone(),
                since: Utc::now(),
                in_flight: true,
            },
        );
        true
    }

    /// Returns `false` when the entry was already acknowledged.
    fn mark_settled(&self, key: &AckKey) -> bool {
        let mut acks = self.acks.lock();
        let Some(pending) = acks.get_mut(key) else {
            return false;
        };
        pending.in_flight = false;
        pending.since = Utc::now();
        true
    }

    pub fn acknowledge(&self, message_id: &str, agent_id: &str) -> CommsResult<()> {
        if !self.config.enable_persistence {
            return Err(CommsError::PersistenceDisabled);
        }
        let key = (message_id.to_string(), agent_id.to_string());
        if self.acks.lock().remove(&key).is_none() {
            return Err(CommsError::not_found(EntityKind::Message, message_id));
        }

        self.metrics.record(Counter::Acknowledged);
        self.set_status(message_id, MessageStatus::Acknowledged);
        tracing::debug!(message_id, agent_id, "delivery acknowledged");
        self.events.publish(DeliveryEvent::Acknowledged {
            message_id: message_id.to_string(),
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    fn arm_ack_deadline(self: &Arc<Self>, delivery: &Delivery) {
        let engine = Arc::clone(self);
        let timers = self.timers.clone();
        let key = delivery.key();
        let attempt = delivery.attempt;
        let timeout = self.config.acknowledgment_timeout();
        self.tracker.spawn(async move {
            tokio::select! {
                () = timers.cancelled() => return,
                () = tokio::time::sleep(timeout) => {}
            }
            let overdue = {
                let mut acks = engine.acks.lock();
                if acks
                    .get(&key)
                    .is_some_and(|pending| pending.delivery.attempt == attempt)
                {
                    acks.remove(&key)
                } else {
                    None
                }
            };
            if let Some(pending) = overdue {
                engine.retry_or_fail(pending.delivery, "acknowledgment timeout");
            }
        });
    }

    fn retry_or_fail(self: &Arc<Self>, delivery: Delivery, reason: &str) {
        if !self.is_accepting() {
            return;
        }
        if !self.policy.allows_retry(delivery.attempt) {
            self.fail(delivery, reason);
            return;
        }

        let next = delivery.attempt + 1;
        let delay = self.policy.delay_for(next);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.metrics.record(Counter::Retried);
        self.set_status(&delivery.message.id, MessageStatus::Retrying);
        tracing::warn!(
            message_id = %delivery.message.id,
            agent_id = %delivery.agent_id,
            attempt = next,
            delay_ms,
            reason,
            "scheduling redelivery"
        );
        self.events.publish(DeliveryEvent::RetryScheduled {
            message_id: delivery.message.id.clone(),
            agent_id: delivery.agent_id.clone(),
            attempt: next,
            delay_ms,
        });

        let engine = Arc::clone(self);
        let timers = self.timers.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = timers.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            engine.redeliver(Delivery {
                attempt: next,
                ..delivery
            });
        });
    }

    fn redeliver(self: &Arc<Self>, delivery: Delivery) {
        if !self.is_accepting() {
            return;
        }
        if delivery.message.is_expired() {
            self.expire(&delivery.message, &delivery.agent_id);
            return;
        }
        let Route::Queue { queue_id, sequence } = delivery.route.clone() else {
            self.dispatch(delivery);
            return;
        };
        let entry = QueuedMessage {
            message: Arc::clone(&delivery.message),
            sequence,
            attempt: delivery.attempt,
        };
        match self.queues.requeue(&queue_id, entry) {
            Ok(()) => self.pump_queue(&queue_id),
            Err(_) => self.dead_letter(
                &delivery.message,
                Some(&delivery.agent_id),
                "queue deleted",
                delivery.attempt,
            ),
        }
    }

    fn fail(&self, delivery: Delivery, reason: &str) {
        let attempts = delivery.attempt + 1;
        self.metrics.record(Counter::Failed);
        self.set_status(&delivery.message.id, MessageStatus::Failed);
        tracing::warn!(
            message_id = %delivery.message.id,
            agent_id = %delivery.agent_id,
            attempts,
            reason,
            "delivery failed"
        );
        self.events.publish(DeliveryEvent::Failed {
            message_id: delivery.message.id.clone(),
            agent_id: delivery.agent_id.clone(),
            attempts,
            reason: reason.to_string(),
        });
        self.dead_letter(&delivery.message, Some(&delivery.agent_id), reason, attempts);
    }

    fn expire(&self, message: &Message, agent_id: &str) {
        self.acks
            .lock()
            .remove(&(message.id.clone(), agent_id.to_string()));
        self.metrics.record(Counter::Expired);
        self.set_status(&message.id, MessageStatus::Expired);
        self.events.publish(DeliveryEvent::Expired {
            message_id: message.id.clone(),
        });
        self.dead_letter(message, Some(agent_id), "ttl expired", 0);
    }

    // ── Queues ───────────────────────────────────────────────────

    /// Attach a competing consumer and hand it any buffered backlog.
    pub fn attach_queue_consumer(
        self: &Arc<Self>,
        queue_id: &str,
        agent_id: &str,
        handler: SharedHandler,
    ) -> CommsResult<SubscriptionId> {
        let subscription_id = self.queues.subscribe(queue_id, agent_id, handler)?;
        self.subscriptions.register_agent(agent_id)?;
        self.pump_queue(queue_id);
        Ok(subscription_id)
    }

    /// Hand buffered messages to idle consumers until one side runs out.
    fn pump_queue(self: &Arc<Self>, queue_id: &str) {
        if !self.is_accepting() {
            return;
        }
        while let Some(assignment) = self.queues.next_assignment(queue_id) {
            let engine = Arc::clone(self);
            self.tracker
                .spawn(async move { engine.run_assignment(assignment).await });
        }
    }

    async fn run_assignment(self: &Arc<Self>, assignment: QueueAssignment) {
        let QueueAssignment {
            queue_id,
            entry,
            subscription_id,
            agent_id,
            handler,
        } = assignment;
        let delivery = Delivery {
            message: entry.message,
            agent_id,
            attempt: entry.attempt,
            route: Route::Queue {
                queue_id: queue_id.clone(),
                sequence: entry.sequence,
            },
            answered_request: false,
        };

        if delivery.message.is_expired() {
            self.queues.release(&queue_id, &subscription_id);
            self.expire(&delivery.message, &delivery.agent_id);
            self.pump_queue(&queue_id);
            return;
        }

        let tracked = self.track(&delivery);
        let outcome = self.invoke(handler, Arc::clone(&delivery.message)).await;
        self.queues.release(&queue_id, &subscription_id);
        self.settle(delivery, tracked, vec![(subscription_id, outcome)]);
        self.pump_queue(&queue_id);
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Send a correlated request and wait for the first response or the
    /// timeout, whichever comes first. Never times out early.
    pub async fn request(self: &Arc<Self>, message: Message, timeout: Duration) -> CommsResult<Value> {
        let correlation_id = message
            .correlation_id
            .clone()
            .ok_or_else(|| CommsError::validation("request requires a correlation id"))?;
        let requester = message.sender.clone();
        let receiver =
            self.correlator
                .register(&correlation_id, &requester, &message.id, timeout);
        if let Err(error) = self.submit(message, &[]) {
            self.correlator.remove(&correlation_id);
            return Err(error);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) if !self.is_accepting() => Err(CommsError::NotRunning),
            Ok(Err(_)) | Err(_) => {
                self.correlator.remove(&correlation_id);
                self.metrics.record(Counter::RequestsTimedOut);
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(%correlation_id, %requester, timeout_ms, "request timed out");
                self.events.publish(DeliveryEvent::RequestTimedOut {
                    correlation_id: correlation_id.clone(),
                    requester,
                });
                Err(CommsError::Timeout {
                    operation: format!("request {correlation_id}"),
                    timeout_ms,
                })
            }
        }
    }

    // ── Dead letters & retention ─────────────────────────────────

    fn dead_letter(&self, message: &Message, agent_id: Option<&str>, reason: &str, attempts: u32) {
        {
            let mut letters = self.dead_letters.lock();
            letters.push_back(DeadLetter {
                message: message.clone(),
                agent_id: agent_id.map(str::to_string),
                reason: reason.to_string(),
                attempts,
                dead_lettered_at: Utc::now(),
            });
            while letters.len() > self.config.max_dead_letters {
                letters.pop_front();
            }
        }
        self.metrics.record(Counter::DeadLettered);
        tracing::warn!(message_id = %message.id, agent_id, reason, "message dead-lettered");
        self.events.publish(DeliveryEvent::DeadLettered {
            message_id: message.id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Newest-first page of the dead-letter log.
    pub fn dead_letters_recent(&self, offset: usize, max: usize) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .iter()
            .rev()
            .skip(offset)
            .take(max)
            .cloned()
            .collect()
    }

    fn set_status(&self, message_id: &str, status: MessageStatus) {
        if self.config.enable_persistence {
            self.retention.lock().set_status(message_id, status);
        }
    }

    pub fn get_message(&self, message_id: &str) -> CommsResult<MessageRecord> {
        if !self.config.enable_persistence {
            return Err(CommsError::PersistenceDisabled);
        }
        self.retention
            .lock()
            .get(message_id)
            .ok_or_else(|| CommsError::not_found(EntityKind::Message, message_id))
    }

    /// Retained messages, newest first.
    pub fn message_history(&self, limit: usize) -> CommsResult<Vec<MessageRecord>> {
        if !self.config.enable_persistence {
            return Err(CommsError::PersistenceDisabled);
        }
        Ok(self.retention.lock().recent(limit))
    }

    /// Evict retention records older than the retention window and drop
    /// requests whose waiter went away past its deadline. Without retries
    /// nothing else resolves a pending ack, so settled entries older than
    /// the window fail; with retries the ack deadline owns them.
    pub fn sweep(&self) -> usize {
        let mut evicted = 0;
        let cutoff = chrono::Duration::from_std(self.config.message_retention())
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        if let Some(cutoff) = cutoff {
            evicted += self.retention.lock().sweep(cutoff);
            if !self.config.retries_enabled() {
                let stale: Vec<PendingAck> = {
                    let mut acks = self.acks.lock();
                    let keys: Vec<AckKey> = acks
                        .iter()
                        .filter(|(_, pending)| !pending.in_flight && pending.since < cutoff)
                        .map(|(key, _)| key.clone())
                        .collect();
                    keys.iter().filter_map(|key| acks.remove(key)).collect()
                };
                evicted += stale.len();
                for pending in stale {
                    self.fail(pending.delivery, "acknowledgment retention expired");
                }
            }
        }

        let abandoned = self.correlator.take_overdue(tokio::time::Instant::now());
        evicted += abandoned.len();
        if evicted > 0 {
            tracing::debug!(evicted, abandoned_requests = abandoned.len(), "retention sweep");
        }
        evicted
    }

    // ── Agents, metrics, lifecycle ───────────────────────────────

    /// Forget an agent: subscriptions, memberships, consumers, inbox, lanes
    /// and unacknowledged deliveries.
    pub fn remove_agent(&self, agent_id: &str) -> bool {
        let known = self.subscriptions.unregister_agent(agent_id);
        self.channels.remove_agent(agent_id);
        self.queues.remove_agent(agent_id);
        let inbox = self.inboxes.lock().remove(agent_id);
        self.lanes.lock().retain(|(agent, _), _| agent != agent_id);
        self.acks.lock().retain(|(_, agent), _| agent != agent_id);
        known || inbox.is_some()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(EntityGauges {
            channels: self.channels.count(),
            queues: self.queues.count(),
            subscriptions: self.subscriptions.count() + self.queues.consumer_count(),
            pending_requests: self.correlator.pending_count(),
            agents: self.subscriptions.agent_count(),
            pending_acks: self.acks.lock().len(),
            queued_messages: self.queues.total_depth(),
            inbox_messages: self.inboxes.lock().values().map(VecDeque::len).sum(),
            retained_messages: self.retention.lock().len(),
            dead_letters: self.dead_letters.lock().len(),
        })
    }

    /// Stop admitting, cancel timers, let in-flight deliveries drain for up
    /// to the configured grace period, then release everything.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.timers.cancel();
        self.lanes.lock().clear();
        self.tracker.close();

        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                in_flight = self.tracker.len(),
                grace_ms = self.config.shutdown_grace_ms,
                "shutdown grace elapsed with deliveries still running"
            );
        }
        self.halt.cancel();

        let failed_requests = self.correlator.fail_all(&CommsError::NotRunning);
        self.clear();
        tracing::info!(failed_requests, "delivery engine stopped");
    }

    /// Synchronous stop used when the owner is dropped without a shutdown.
    pub fn halt(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.timers.cancel();
        self.halt.cancel();
        self.lanes.lock().clear();
        self.tracker.close();
    }

    fn clear(&self) {
        self.channels.clear();
        self.queues.clear();
        self.subscriptions.clear();
        self.acks.lock().clear();
        self.inboxes.lock().clear();
        self.lanes.lock().clear();
        self.retention.lock().clear();
        self.dead_letters.lock().clear();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::channel::ChannelOptions;
    use crate::comms::events::EventBusError;
    use crate::comms::handler::handler_fn;
    use crate::comms::message::SendOptions;
    use crate::comms::retry::BackoffStrategy;
    use crate::comms::queue::QueueOptions;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn engine(config: CommsConfig) -> Arc<DeliveryEngine> {
        let engine = DeliveryEngine::new(config);
        engine.start();
        engine
    }

    fn direct(from: &str, to: &str, message_type: &str, payload: Value) -> Message {
        Message::new(from, MessageTarget::Agent(to.into()), message_type, payload)
    }

    fn recorder(seen: &Arc<Mutex<Vec<Value>>>) -> SharedHandler {
        let seen = Arc::clone(seen);
        handler_fn(move |message| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(message.payload.clone());
                Ok(())
            }
        })
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    async fn next_event(events: &mut EventReceiver, kind: &str) -> DeliveryEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(120), events.recv()).await {
                Ok(Ok(event)) if event.kind() == kind => return event,
                Ok(Ok(_)) | Ok(Err(EventBusError::Lagged(_))) => {}
                Ok(Err(error)) => panic!("event bus failed: {error}"),
                Err(_) => panic!("no {kind} event"),
            }
        }
    }

    #[tokio::test]
    async fn direct_delivery_is_tracked_until_acknowledged() {
        let engine = engine(CommsConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        engine
            .subscriptions()
            .subscribe("worker", "task", recorder(&seen))
            .unwrap();

        let id = engine
            .send(direct("lead", "worker", "task", json!({ "n": 1 })))
            .unwrap();
        assert!(id.starts_with("msg_"));
        eventually(|| seen.lock().len() == 1).await;
        eventually(|| engine.metrics_snapshot().pending_acks == 1).await;

        engine.acknowledge(&id, "worker").unwrap();
        assert!(engine.acknowledge(&id, "worker").unwrap_err().is_not_found());
        assert_eq!(engine.get_message(&id).unwrap().status, MessageStatus::Acknowledged);

        let metrics = engine.metrics_snapshot();
        assert_eq!(metrics.messages_sent, 1);
        assert_eq!(metrics.messages_delivered, 1);
        assert_eq!(metrics.messages_acknowledged, 1);
        assert_eq!(metrics.pending_acks, 0);
    }

    #[tokio::test]
    async fn acknowledge_requires_persistence() {
        let engine = engine(CommsConfig {
            enable_persistence: false,
            ..CommsConfig::default()
        });
        assert_eq!(
            engine.acknowledge("msg_x", "worker"),
            Err(CommsError::PersistenceDisabled)
        );
        assert_eq!(
            engine.get_message("msg_x").unwrap_err(),
            CommsError::PersistenceDisabled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_delivery_is_retried_then_failed() {
        let engine = engine(CommsConfig {
            acknowledgment_timeout_ms: 100,
            retry_attempts: 2,
            backoff_strategy: BackoffStrategy::Fixed,
            retry_base_delay_ms: 10,
            max_retry_delay_ms: 10,
            ..CommsConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine
            .subscriptions()
            .subscribe(
                "worker",
                "task",
                handler_fn(move |_message| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                }),
            )
            .unwrap();
        let mut events = engine.subscribe_events();

        let id = engine.send(direct("lead", "worker", "task", json!({}))).unwrap();

        let first = next_event(&mut events, "retry_scheduled").await;
        assert!(matches!(first, DeliveryEvent::RetryScheduled { attempt: 1, delay_ms: 10, .. }));
        let second = next_event(&mut events, "retry_scheduled").await;
        assert!(matches!(second, DeliveryEvent::RetryScheduled { attempt: 2, .. }));
        let failed = next_event(&mut events, "failed").await;
        assert_eq!(
            failed,
            DeliveryEvent::Failed {
                message_id: id.clone(),
                agent_id: "worker".into(),
                attempts: 3,
                reason: "acknowledgment timeout".into(),
            }
        );

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let letters = engine.dead_letters_recent(0, 10);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].message.id, id);
        assert_eq!(engine.get_message(&id).unwrap().status, MessageStatus::Failed);
        let metrics = engine.metrics_snapshot();
        assert_eq!(metrics.messages_retried, 2);
        assert_eq!(metrics.messages_failed, 1);
        assert_eq!(metrics.pending_acks, 0);
    }

    #[tokio::test]
    async fn without_retries_stale_acks_fail_once_the_retention_window_passes() {
        let engine = engine(CommsConfig {
            enable_reliability: false,
            message_retention_ms: 20,
            ..CommsConfig::default()
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        engine
            .subscriptions()
            .subscribe("worker", "task", recorder(&seen))
            .unwrap();
        let mut events = engine.subscribe_events();

        let id = engine.send(direct("lead", "worker", "task", json!({}))).unwrap();
        let failed = next_event(&mut events, "failed").await;
        assert_eq!(
            failed,
            DeliveryEvent::Failed {
                message_id: id.clone(),
                agent_id: "worker".into(),
                attempts: 1,
                reason: "acknowledgment retention expired".into(),
            }
        );
        assert!(engine.acknowledge(&id, "worker").unwrap_err().is_not_found());
        let metrics = engine.metrics_snapshot();
        assert_eq!(metrics.pending_acks, 0);
        assert_eq!(metrics.messages_retried, 0);
        assert_eq!(engine.dead_letters_recent(0, 5)[0].message.id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn faulted_handler_is_redelivered() {
        let engine = engine(CommsConfig {
            retry_base_delay_ms: 5,
            ..CommsConfig::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine
            .subscriptions()
            .subscribe(
                "worker",
                "task",
                handler_fn(move |_message| {
                    let call = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call == 0 {
                            anyhow::bail!("transient failure");
                        }
                        Ok(())
                    }
                }),
            )
            .unwrap();
        let mut events = engine.subscribe_events();

        engine.send(direct("lead", "worker", "task", json!({}))).unwrap();

        let fault = next_event(&mut events, "handler_fault").await;
        assert!(matches!(fault, DeliveryEvent::HandlerFault { ref error, .. } if error.contains("transient")));
        let delivered = next_event(&mut events, "delivered").await;
        assert!(matches!(delivered, DeliveryEvent::Delivered { attempt: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.metrics_snapshot().handler_faults, 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_affect_other_recipients() {
        let engine = engine(CommsConfig {
            enable_reliability: false,
            ..CommsConfig::default()
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        engine
            .subscriptions()
            .subscribe(
                "flaky",
                "alert",
                handler_fn(|message| async move {
                    assert!(message.payload.is_null(), "boom");
                    Ok(())
                }),
            )
            .unwrap();
        engine
            .subscriptions()
            .subscribe("steady", "alert", recorder(&seen))
            .unwrap();
        let mut events = engine.subscribe_events();

        engine
            .send(Message::new(
                "lead",
                MessageTarget::Agents(vec!["flaky".into(), "steady".into()]),
                "alert",
                json!({ "level": 3 }),
            ))
            .unwrap();

        eventually(|| seen.lock().len() == 1).await;
        let fault = next_event(&mut events, "handler_fault").await;
        assert!(matches!(fault, DeliveryEvent::HandlerFault { ref agent_id, ref error, .. }
            if agent_id == "flaky" && error.contains("boom")));
        let failed = next_event(&mut events, "failed").await;
        assert!(matches!(failed, DeliveryEvent::Failed { attempts: 1, .. }));

        // The engine keeps working afterwards.
        engine
            .send(direct("lead", "steady", "alert", json!({ "level": 4 })))
            .unwrap();
        eventually(|| seen.lock().len() == 2).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn deliveries_on_one_lane_keep_admission_order() {
        let engine = engine(CommsConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine
            .subscriptions()
            .subscribe(
                "worker",
                "step",
                handler_fn(move |message| {
                    let sink = Arc::clone(&sink);
                    async move {
                        let n = message.payload["n"].as_u64().unwrap_or_default();
                        tokio::time::sleep(Duration::from_millis(3 - n % 3)).await;
                        sink.lock().push(n);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        for n in 0..30u64 {
            engine
                .send(direct("lead", "worker", "step", json!({ "n": n })))
                .unwrap();
        }
        eventually(|| seen.lock().len() == 30).await;
        assert_eq!(*seen.lock(), (0..30).collect::<Vec<u64>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn idle_lanes_are_retired_and_respawned_on_demand() {
        let engine = engine(CommsConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..50 {
            engine
                .subscriptions()
                .subscribe(&format!("agent-{n}"), "ping", recorder(&seen))
                .unwrap();
        }

        for n in 0..50 {
            engine
                .send(direct("lead", &format!("agent-{n}"), "ping", json!({ "n": n })))
                .unwrap();
        }
        eventually(|| seen.lock().len() == 50).await;
        eventually(|| engine.lane_count() == 0).await;

        engine
            .send(direct("lead", "agent-7", "ping", json!({ "n": 50 })))
            .unwrap();
        eventually(|| seen.lock().len() == 51).await;
        eventually(|| engine.lane_count() == 0).await;
    }

    #[tokio::test]
    async fn closing_lanes_lets_buffered_deliveries_finish() {
        let engine = engine(CommsConfig::default());
        let channel_id = engine
            .channels()
            .create("ops", ChannelKind::Broadcast, ChannelOptions::default());
        engine.channels().join(&channel_id, "worker").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine
            .subscriptions()
            .subscribe(
                "worker",
                "step",
                handler_fn(move |message| {
                    let sink = Arc::clone(&sink);
                    async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        sink.lock().push(message.payload.clone());
                        Ok(())
                    }
                }),
            )
            .unwrap();

        for n in 0..5 {
            engine
                .send(Message::new(
                    "lead",
                    MessageTarget::Channel(channel_id.clone()),
                    "step",
                    json!({ "n": n }),
                ))
                .unwrap();
        }
        engine.close_lanes(&channel_id);
        assert_eq!(engine.lane_count(), 0);
        eventually(|| seen.lock().len() == 5).await;
    }

    #[tokio::test]
    async fn polling_strategy_fills_inboxes() {
        let engine = engine(CommsConfig {
            strategy: DeliveryStrategy::Polling,
            ..CommsConfig::default()
        });
        for n in 0..5 {
            engine
                .send(direct("lead", "worker", "task", json!({ "n": n })))
                .unwrap();
        }
        assert_eq!(engine.inbox_len("worker"), 5);

        let first: Vec<Value> = engine
            .poll_messages("worker", 3)
            .iter()
            .map(|message| message.payload["n"].clone())
            .collect();
        assert_eq!(first, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(engine.poll_messages("worker", 10).len(), 2);
        assert!(engine.poll_messages("worker", 10).is_empty());
        assert!(engine.poll_messages("nobody", 10).is_empty());
    }

    #[tokio::test]
    async fn unhandled_direct_delivery_lands_in_inbox_and_overflow_dead_letters() {
        let engine = engine(CommsConfig {
            max_queue_size: 2,
            ..CommsConfig::default()
        });
        for n in 0..3 {
            engine
                .send(direct("lead", "idle", "note", json!({ "n": n })))
                .unwrap();
        }
        eventually(|| engine.metrics_snapshot().messages_delivered == 3).await;

        let polled = engine.poll_messages("idle", 10);
        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].payload["n"], 1);
        let letters = engine.dead_letters_recent(0, 10);
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, "inbox overflow");
        assert_eq!(letters[0].message.payload["n"], 0);
    }

    #[tokio::test]
    async fn expired_ttl_is_rejected_at_admission_and_dropped_later() {
        let engine = engine(CommsConfig::default());
        let stale = direct("lead", "worker", "task", json!({}))
            .with_options(&SendOptions::default().ttl(Duration::ZERO));
        assert!(engine.send(stale).unwrap_err().is_timeout());
        assert_eq!(engine.metrics_snapshot().messages_sent, 0);

        let queue_id = engine
            .queues()
            .create("jobs", QueueOptions::default(), 100)
            .unwrap();
        let short = Message::new("lead", MessageTarget::Queue(queue_id.clone()), "job", json!({}))
            .with_options(&SendOptions::default().ttl(Duration::from_millis(20)));
        engine.send(short).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        engine
            .attach_queue_consumer(&queue_id, "worker", recorder(&seen))
            .unwrap();
        eventually(|| engine.metrics_snapshot().messages_expired == 1).await;
        assert!(seen.lock().is_empty());
        assert_eq!(engine.dead_letters_recent(0, 1)[0].reason, "ttl expired");
    }

    #[tokio::test]
    async fn unroutable_channel_post_is_dead_lettered() {
        let engine = engine(CommsConfig::default());
        let channel_id = engine.channels().create(
            "ops",
            ChannelKind::Broadcast,
            ChannelOptions::default(),
        );
        engine.channels().join(&channel_id, "lead").unwrap();
        engine
            .send(Message::new(
                "lead",
                MessageTarget::Channel(channel_id),
                "status",
                json!({}),
            ))
            .unwrap();
        assert_eq!(engine.dead_letters_recent(0, 5)[0].reason, "no recipients");
    }

    #[tokio::test]
    async fn history_is_newest_first_and_paged_dead_letters_are_bounded() {
        let engine = engine(CommsConfig {
            max_dead_letters: 3,
            strategy: DeliveryStrategy::Polling,
            ..CommsConfig::default()
        });
        let ids: Vec<_> = (0..5)
            .map(|n| {
                engine
                    .send(Message::new("lead", MessageTarget::Broadcast, "ping", json!(n)))
                    .unwrap()
            })
            .collect();

        let history = engine.message_history(2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message.id, ids[4]);
        assert_eq!(history[1].message.id, ids[3]);

        // Nobody is known, so every broadcast was unroutable.
        let letters = engine.dead_letters_recent(0, 10);
        assert_eq!(letters.len(), 3);
        assert_eq!(letters[0].message.id, ids[4]);
        assert_eq!(engine.dead_letters_recent(2, 10)[0].message.id, ids[2]);
        assert_eq!(engine.metrics_snapshot().messages_dead_lettered, 5);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_requests_and_rejects_new_sends() {
        let engine = engine(CommsConfig {
            shutdown_grace_ms: 50,
            ..CommsConfig::default()
        });
        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let request = direct("lead", "nobody", "ask", json!({}))
                    .with_options(&SendOptions::default().correlation_id("corr_test"));
                engine.request(request, Duration::from_secs(60)).await
            })
        };
        eventually(|| engine.correlator().pending_count() == 1).await;

        engine.shutdown().await;
        assert_eq!(waiter.await.unwrap(), Err(CommsError::NotRunning));
        assert_eq!(
            engine.send(direct("lead", "worker", "task", json!({}))),
            Err(CommsError::NotRunning)
        );
        assert_eq!(engine.metrics_snapshot().channels, 0);
    }

    #[test]
    fn retention_sweep_evicts_old_records_in_order() {
        let mut store = RetentionStore::default();
        let message = Arc::new(direct("a", "b", "t", json!({})));
        store.insert(Arc::clone(&message));
        store.set_status(&message.id, MessageStatus::Failed);
        store.set_status(&message.id, MessageStatus::Delivered);
        assert_eq!(store.get(&message.id).unwrap().status, MessageStatus::Failed);

        assert_eq!(store.sweep(Utc::now() - chrono::Duration::hours(1)), 0);
        assert_eq!(store.sweep(Utc::now() + chrono::Duration::seconds(1)), 1);
        assert_eq!(store.len(), 0);
    }
}
