use super::error::{CommsError, CommsResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

pub type AgentId = String;
pub type MessageId = String;
pub type ChannelId = String;
pub type QueueId = String;
pub type SubscriptionId = String;

/// Generate an opaque identifier with a stable prefix, e.g. `msg_3f2a...`.
pub(crate) fn generate_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Delivery priority. Ordering follows urgency: `Low < Normal < High < Urgent`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Where a message is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageTarget {
    Agent(AgentId),
    Agents(Vec<AgentId>),
    Broadcast,
    Channel(ChannelId),
    Queue(QueueId),
}

impl MessageTarget {
    /// Ordering lane suffix: deliveries sharing a recipient and a lane run in
    /// admission order.
    pub(crate) fn lane(&self) -> String {
        match self {
            Self::Channel(id) | Self::Queue(id) => id.clone(),
            Self::Agent(_) | Self::Agents(_) | Self::Broadcast => "direct".to_string(),
        }
    }
}

/// Lifecycle state of an admitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Admitted,
    Delivered,
    AwaitingAck,
    Acknowledged,
    Retrying,
    Expired,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Expired | Self::Failed)
    }
}

/// Canonical message representation. Immutable once admitted; handlers
/// receive it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub message_type: String,
    pub sender: AgentId,
    pub target: MessageTarget,
    pub payload: Value,
    pub priority: MessagePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender: impl Into<AgentId>,
        target: MessageTarget,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: generate_id("msg"),
            message_type: message_type.into(),
            sender: sender.into(),
            target,
            payload,
            priority: MessagePriority::Normal,
            correlation_id: None,
            ttl_ms: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_options(mut self, options: &SendOptions) -> Self {
        self.priority = options.priority;
        if options.correlation_id.is_some() {
            self.correlation_id.clone_from(&options.correlation_id);
        }
        self.ttl_ms = options
            .ttl
            .map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }

    /// `true` once the TTL measured from `created_at` has elapsed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl_ms) = self.ttl_ms else {
            return false;
        };
        let age_ms = now
            .signed_duration_since(self.created_at)
            .num_milliseconds()
            .max(0);
        u64::try_from(age_ms).unwrap_or(0) >= ttl_ms
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Size of the serialized payload in bytes.
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.payload).map_or(usize::MAX, |bytes| bytes.len())
    }

    /// Admission check: envelope fields present and payload within `max_size`.
    pub fn validate(&self, max_size: usize) -> CommsResult<()> {
        require_non_empty(&self.id, "id")?;
        require_non_empty(&self.message_type, "type")?;
        require_non_empty(&self.sender, "sender")?;
        match &self.target {
            MessageTarget::Agent(id) | MessageTarget::Channel(id) | MessageTarget::Queue(id) => {
                require_non_empty(id, "target")?;
            }
            MessageTarget::Agents(ids) => {
                if ids.is_empty() {
                    return Err(CommsError::validation("recipient list must not be empty"));
                }
                for id in ids {
                    require_non_empty(id, "recipient")?;
                }
            }
            MessageTarget::Broadcast => {}
        }
        if let Some(correlation_id) = &self.correlation_id {
            require_non_empty(correlation_id, "correlation_id")?;
        }

        let size = self.payload_size();
        if size > max_size {
            return Err(CommsError::MessageTooLarge {
                message_id: self.id.clone(),
                size,
                max: max_size,
            });
        }
        Ok(())
    }
}

pub(crate) fn require_non_empty(value: &str, field: &str) -> CommsResult<()> {
    if value.trim().is_empty() {
        return Err(CommsError::validation(format!(
            "field `{field}` must not be empty"
        )));
    }
    Ok(())
}

/// Per-send envelope options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub priority: MessagePriority,
    pub correlation_id: Option<String>,
    pub ttl: Option<Duration>,
}

impl SendOptions {
    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}
