//! In-process inter-agent communication: channels, work queues, typed
//! subscriptions, reliable delivery and request/response correlation.
//!
//! [`MessageBroker`] is the entry point. It is constructed explicitly and
//! shared by reference (usually behind an `Arc`); there is no global instance.

pub mod broker;
pub mod channel;
pub mod correlator;
pub mod delivery;
pub mod error;
pub mod events;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod subscription;

pub use broker::{BrokerState, MessageBroker};
pub use channel::{Channel, ChannelKind, ChannelOptions, DEFAULT_CHANNELS};
pub use delivery::{DeadLetter, MessageRecord};
pub use error::{CommsError, CommsResult, EntityKind};
pub use events::{DeliveryEvent, EventBus, EventBusError, EventReceiver};
pub use handler::{handler_fn, MessageHandler, SharedHandler};
pub use message::{
    AgentId, ChannelId, Message, MessageId, MessagePriority, MessageStatus, MessageTarget,
    QueueId, SendOptions, SubscriptionId,
};
pub use metrics::MetricsSnapshot;
pub use queue::{QueueInfo, QueueOptions};
pub use retry::{BackoffStrategy, RetryPolicy};
