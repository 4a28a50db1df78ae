use thiserror::Error;

/// Kind of registry entity referenced by a [`CommsError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Channel,
    Queue,
    Message,
    Subscription,
    Agent,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Channel => "channel",
            Self::Queue => "queue",
            Self::Message => "message",
            Self::Subscription => "subscription",
            Self::Agent => "agent",
        };
        f.write_str(label)
    }
}

/// Errors surfaced synchronously by the communication layer.
///
/// Every variant is reported before any side effect takes place, except
/// `Timeout`, which is reported at the boundary of the waiting call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommsError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },
    #[error("message `{message_id}` is {size} bytes, exceeding the {max} byte limit")]
    MessageTooLarge {
        message_id: String,
        size: usize,
        max: usize,
    },
    #[error("{kind} `{id}` not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("queue `{queue_id}` is full ({max_size} messages)")]
    CapacityExceeded { queue_id: String, max_size: usize },
    #[error("channel `{channel_id}` is full ({max_participants} participants)")]
    ChannelFull {
        channel_id: String,
        max_participants: usize,
    },
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("acknowledgment tracking requires persistence to be enabled")]
    PersistenceDisabled,
    #[error("message broker is not running")]
    NotRunning,
}

impl CommsError {
    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// `true` for both oversized payloads and malformed arguments.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::MessageTooLarge { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type CommsResult<T> = Result<T, CommsError>;
