use super::message::{AgentId, MessageId, SubscriptionId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Delivery lifecycle signals. Fire-and-forget senders have no caller to
/// notify, so exhausted retries and handler faults surface here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeliveryEvent {
    Delivered {
        message_id: MessageId,
        agent_id: AgentId,
        attempt: u32,
    },
    Acknowledged {
        message_id: MessageId,
        agent_id: AgentId,
    },
    HandlerFault {
        message_id: MessageId,
        agent_id: AgentId,
        subscription_id: SubscriptionId,
        error: String,
    },
    RetryScheduled {
        message_id: MessageId,
        agent_id: AgentId,
        attempt: u32,
        delay_ms: u64,
    },
    Failed {
        message_id: MessageId,
        agent_id: AgentId,
        attempts: u32,
        reason: String,
    },
    Expired {
        message_id: MessageId,
    },
    DeadLettered {
        message_id: MessageId,
        reason: String,
    },
    RequestTimedOut {
        correlation_id: String,
        requester: AgentId,
    },
}

impl DeliveryEvent {
    /// Stable snake_case name, used as the trace `event_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Acknowledged { .. } => "acknowledged",
            Self::HandlerFault { .. } => "handler_fault",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::Failed { .. } => "failed",
            Self::Expired { .. } => "expired",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::RequestTimedOut { .. } => "request_timed_out",
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Delivered { message_id, .. }
            | Self::Acknowledged { message_id, .. }
            | Self::HandlerFault { message_id, .. }
            | Self::RetryScheduled { message_id, .. }
            | Self::Failed { message_id, .. }
            | Self::Expired { message_id }
            | Self::DeadLettered { message_id, .. } => Some(message_id),
            Self::RequestTimedOut { .. } => None,
        }
    }

    /// Whether the event reports something going wrong.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::HandlerFault { .. }
                | Self::Failed { .. }
                | Self::Expired { .. }
                | Self::DeadLettered { .. }
                | Self::RequestTimedOut { .. }
        )
    }
}

/// In-memory fan-out of delivery events backed by a tokio broadcast channel.
/// Slow receivers lag and lose the oldest events rather than blocking delivery.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeliveryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: DeliveryEvent) {
        // No receivers is the common case; nothing to report.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiver for delivery events.
pub struct EventReceiver {
    receiver: broadcast::Receiver<DeliveryEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<DeliveryEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                tracing::warn!("Delivery event receiver lagged by {n} events");
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<DeliveryEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                tracing::warn!("Delivery event receiver lagged by {n} events");
                EventBusError::Lagged(n)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("event bus is closed")]
    Closed,
    #[error("no events available")]
    Empty,
    #[error("receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
