use super::channel::{Channel, ChannelKind, ChannelOptions, DEFAULT_CHANNELS};
use super::correlator::Correlator;
use super::delivery::{DeadLetter, DeliveryEngine, MessageRecord};
use super::error::{CommsError, CommsResult};
use super::events::EventReceiver;
use super::handler::SharedHandler;
use super::message::{
    require_non_empty, AgentId, ChannelId, Message, MessageId, MessageTarget, QueueId, SendOptions,
    SubscriptionId,
};
use super::metrics::MetricsSnapshot;
use super::queue::{QueueInfo, QueueOptions};
use crate::config::CommsConfig;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const QUEUE_SUBSCRIPTION_PREFIX: &str = "queue-sub_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    Created,
    Running,
    Stopped,
}

/// Single entry point for agents. Holds no state of its own beyond the
/// lifecycle flag; every call is forwarded to the delivery engine and its
/// registries, and their errors are returned unchanged.
pub struct MessageBroker {
    engine: Arc<DeliveryEngine>,
    state: Mutex<BrokerState>,
}

impl MessageBroker {
    pub fn new(config: CommsConfig) -> Self {
        Self {
            engine: DeliveryEngine::new(config),
            state: Mutex::new(BrokerState::Created),
        }
    }

    pub fn state(&self) -> BrokerState {
        *self.state.lock()
    }

    pub fn config(&self) -> &CommsConfig {
        self.engine.config()
    }

    fn ensure_running(&self) -> CommsResult<()> {
        match self.state() {
            BrokerState::Running => Ok(()),
            BrokerState::Created | BrokerState::Stopped => Err(CommsError::NotRunning),
        }
    }

    /// Create the default channels and start background maintenance.
    /// Calling it again while running is a no-op; a stopped broker stays stopped.
    pub fn initialize(&self) -> CommsResult<()> {
        let mut state = self.state.lock();
        match *state {
            BrokerState::Running => return Ok(()),
            BrokerState::Stopped => return Err(CommsError::NotRunning),
            BrokerState::Created => {}
        }

        for (name, kind) in DEFAULT_CHANNELS {
            self.engine.channels().create(
                name,
                *kind,
                ChannelOptions {
                    persistent: true,
                    reliable: true,
                    max_participants: None,
                },
            );
        }
        self.engine.start();
        *state = BrokerState::Running;

        let config = self.engine.config();
        tracing::info!(
            strategy = config.strategy.as_str(),
            persistence = config.enable_persistence,
            reliability = config.enable_reliability,
            ordering = config.enable_ordering,
            "message broker initialized"
        );
        Ok(())
    }

    /// Stop accepting work, drain in-flight deliveries for up to the
    /// configured grace period and release all state. Idempotent.
    pub async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), BrokerState::Stopped);
        if previous == BrokerState::Stopped {
            return;
        }
        tracing::info!("message broker shutting down");
        self.engine.shutdown().await;
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Admit a fully built message.
    pub fn send(&self, message: Message) -> CommsResult<MessageId> {
        self.ensure_running()?;
        self.engine.send(message)
    }

    /// Direct message to one agent.
    pub fn send_message(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        payload: Value,
    ) -> CommsResult<MessageId> {
        self.send_message_with(from, to, message_type, payload, &SendOptions::default())
    }

    pub fn send_message_with(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        payload: Value,
        options: &SendOptions,
    ) -> CommsResult<MessageId> {
        self.send(
            Message::new(from, MessageTarget::Agent(to.to_string()), message_type, payload)
                .with_options(options),
        )
    }

    /// Send a request and wait for the correlated response payload.
    pub async fn send_request(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> CommsResult<Value> {
        self.ensure_running()?;
        let request = Message::new(from, MessageTarget::Agent(to.to_string()), message_type, payload)
            .with_options(
                &SendOptions::default().correlation_id(Correlator::new_correlation_id()),
            );
        self.engine.request(request, timeout).await
    }

    /// Reply to a request: `<type>.response`, same correlation id, addressed
    /// to the requester.
    pub fn respond(&self, request: &Message, from: &str, payload: Value) -> CommsResult<MessageId> {
        let correlation_id = request
            .correlation_id
            .clone()
            .ok_or_else(|| CommsError::validation("cannot respond to a message without a correlation id"))?;
        let reply = Message::new(
            from,
            MessageTarget::Agent(request.sender.clone()),
            format!("{}.response", request.message_type),
            payload,
        )
        .with_options(
            &SendOptions::default()
                .priority(request.priority)
                .correlation_id(correlation_id),
        );
        self.send(reply)
    }

    /// Deliver to every known agent except the sender and `exclude`.
    pub fn broadcast(
        &self,
        from: &str,
        message_type: &str,
        payload: Value,
        exclude: &[AgentId],
    ) -> CommsResult<MessageId> {
        self.ensure_running()?;
        self.engine.send_excluding(
            Message::new(from, MessageTarget::Broadcast, message_type, payload),
            exclude,
        )
    }

    pub fn multicast(
        &self,
        from: &str,
        to: &[AgentId],
        message_type: &str,
        payload: Value,
    ) -> CommsResult<MessageId> {
        self.send(Message::new(
            from,
            MessageTarget::Agents(to.to_vec()),
            message_type,
            payload,
        ))
    }

    // ── Subscriptions & agents ───────────────────────────────────

    pub fn subscribe(
        &self,
        agent_id: &str,
        message_type: &str,
        handler: SharedHandler,
    ) -> CommsResult<SubscriptionId> {
        self.ensure_running()?;
        self.engine
            .subscriptions()
            .subscribe(agent_id, message_type, handler)
    }

    /// Remove a type or queue subscription owned by `agent_id`. Unknown ids
    /// and ids owned by someone else are ignored.
    pub fn unsubscribe(&self, agent_id: &str, subscription_id: &str) -> CommsResult<bool> {
        self.ensure_running()?;
        if subscription_id.starts_with(QUEUE_SUBSCRIPTION_PREFIX) {
            return Ok(self.engine.queues().unsubscribe(agent_id, subscription_id));
        }
        Ok(self
            .engine
            .subscriptions()
            .unsubscribe(agent_id, subscription_id))
    }

    pub fn register_agent(&self, agent_id: &str) -> CommsResult<()> {
        self.ensure_running()?;
        self.engine.subscriptions().register_agent(agent_id)
    }

    pub fn unregister_agent(&self, agent_id: &str) -> CommsResult<bool> {
        self.ensure_running()?;
        Ok(self.engine.remove_agent(agent_id))
    }

    pub fn known_agents(&self) -> CommsResult<Vec<AgentId>> {
        self.ensure_running()?;
        Ok(self.engine.subscriptions().known_agents())
    }

    // ── Queues ───────────────────────────────────────────────────

    pub fn create_queue(&self, name: &str, options: QueueOptions) -> CommsResult<QueueId> {
        self.ensure_running()?;
        self.engine
            .queues()
            .create(name, options, self.engine.config().max_queue_size)
    }

    pub fn subscribe_to_queue(
        &self,
        queue_id: &str,
        agent_id: &str,
        handler: SharedHandler,
    ) -> CommsResult<SubscriptionId> {
        self.ensure_running()?;
        self.engine.attach_queue_consumer(queue_id, agent_id, handler)
    }

    pub fn unsubscribe_from_queue(&self, agent_id: &str, subscription_id: &str) -> CommsResult<bool> {
        self.ensure_running()?;
        Ok(self.engine.queues().unsubscribe(agent_id, subscription_id))
    }

    /// Enqueue a message for exactly one consumer of `queue_id`.
    pub fn send_to_queue(
        &self,
        queue_id: &str,
        from: &str,
        message_type: &str,
        payload: Value,
    ) -> CommsResult<MessageId> {
        self.send(Message::new(
            from,
            MessageTarget::Queue(queue_id.to_string()),
            message_type,
            payload,
        ))
    }

    pub fn list_queues(&self) -> CommsResult<Vec<QueueInfo>> {
        self.ensure_running()?;
        Ok(self.engine.queues().list())
    }

    pub fn queue_depth(&self, queue_id: &str) -> CommsResult<usize> {
        self.ensure_running()?;
        self.engine.queues().depth(queue_id)
    }

    pub fn delete_queue(&self, queue_id: &str) -> CommsResult<QueueInfo> {
        self.ensure_running()?;
        let queue = self.engine.queues().delete(queue_id)?;
        self.engine.close_lanes(queue_id);
        Ok(queue)
    }

    // ── Channels ─────────────────────────────────────────────────

    pub fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        options: ChannelOptions,
    ) -> CommsResult<ChannelId> {
        self.ensure_running()?;
        Ok(self.engine.channels().create(name, kind, options))
    }

    /// Join a channel. Joining twice is a no-op.
    pub fn join_channel(&self, channel_id: &str, agent_id: &str) -> CommsResult<()> {
        self.ensure_running()?;
        require_non_empty(agent_id, "agent_id")?;
        self.engine.channels().join(channel_id, agent_id)?;
        self.engine.subscriptions().register_agent(agent_id)
    }

    /// Leave a channel. Leaving as a non-member is a no-op.
    pub fn leave_channel(&self, channel_id: &str, agent_id: &str) -> CommsResult<()> {
        self.ensure_running()?;
        self.engine.channels().leave(channel_id, agent_id)?;
        Ok(())
    }

    /// Fan out to every participant except the sender.
    pub fn send_to_channel(
        &self,
        channel_id: &str,
        from: &str,
        message_type: &str,
        payload: Value,
    ) -> CommsResult<MessageId> {
        self.send(Message::new(
            from,
            MessageTarget::Channel(channel_id.to_string()),
            message_type,
            payload,
        ))
    }

    pub fn list_channels(&self) -> CommsResult<Vec<Channel>> {
        self.ensure_running()?;
        Ok(self.engine.channels().list())
    }

    pub fn get_channel(&self, channel_id: &str) -> CommsResult<Channel> {
        self.ensure_running()?;
        self.engine.channels().get(channel_id)
    }

    /// Id of the first channel named `name`, e.g. one of the defaults.
    pub fn find_channel(&self, name: &str) -> CommsResult<Option<ChannelId>> {
        self.ensure_running()?;
        Ok(self.engine.channels().find_by_name(name).into_iter().next())
    }

    pub fn delete_channel(&self, channel_id: &str) -> CommsResult<Channel> {
        self.ensure_running()?;
        let channel = self.engine.channels().delete(channel_id)?;
        self.engine.close_lanes(channel_id);
        Ok(channel)
    }

    // ── Delivery state ───────────────────────────────────────────

    pub fn acknowledge_message(&self, message_id: &str, agent_id: &str) -> CommsResult<()> {
        self.ensure_running()?;
        self.engine.acknowledge(message_id, agent_id)
    }

    pub fn poll_messages(&self, agent_id: &str, max: usize) -> CommsResult<Vec<Arc<Message>>> {
        self.ensure_running()?;
        Ok(self.engine.poll_messages(agent_id, max))
    }

    pub fn subscribe_events(&self) -> CommsResult<EventReceiver> {
        self.ensure_running()?;
        Ok(self.engine.subscribe_events())
    }

    pub fn dead_letters_recent(&self, offset: usize, max: usize) -> CommsResult<Vec<DeadLetter>> {
        self.ensure_running()?;
        Ok(self.engine.dead_letters_recent(offset, max))
    }

    pub fn get_message(&self, message_id: &str) -> CommsResult<MessageRecord> {
        self.ensure_running()?;
        self.engine.get_message(message_id)
    }

    pub fn message_history(&self, limit: usize) -> CommsResult<Vec<MessageRecord>> {
        self.ensure_running()?;
        self.engine.message_history(limit)
    }

    /// Point-in-time metrics. Available in every lifecycle state.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.engine.metrics_snapshot()
    }
}

impl Drop for MessageBroker {
    fn drop(&mut self) {
        if *self.state.get_mut() != BrokerState::Stopped {
            self.engine.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::handler::handler_fn;
    use serde_json::json;

    fn running() -> MessageBroker {
        let broker = MessageBroker::new(CommsConfig::default());
        broker.initialize().unwrap();
        broker
    }

    #[tokio::test]
    async fn operations_require_running_state() {
        let broker = MessageBroker::new(CommsConfig::default());
        assert_eq!(broker.state(), BrokerState::Created);
        assert_eq!(
            broker.send_message("a", "b", "t", json!({})),
            Err(CommsError::NotRunning)
        );
        assert_eq!(broker.get_metrics().channels, 0);

        broker.initialize().unwrap();
        broker.initialize().unwrap();
        assert_eq!(broker.get_metrics().channels, 3);

        broker.shutdown().await;
        broker.shutdown().await;
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert_eq!(broker.initialize(), Err(CommsError::NotRunning));
        assert_eq!(broker.list_channels().unwrap_err(), CommsError::NotRunning);
        assert_eq!(broker.get_metrics().channels, 0);
    }

    #[tokio::test]
    async fn default_channels_exist_after_initialize() {
        let broker = running();
        let names: Vec<String> = broker
            .list_channels()
            .unwrap()
            .into_iter()
            .map(|channel| channel.name)
            .collect();
        for (name, _) in DEFAULT_CHANNELS {
            assert!(names.iter().any(|n| n == name), "missing {name}");
        }
        let system = broker.find_channel("system-broadcast").unwrap().unwrap();
        assert_eq!(broker.get_channel(&system).unwrap().kind, ChannelKind::Broadcast);
    }

    #[tokio::test]
    async fn unsubscribe_routes_queue_ids_to_the_queue_registry() {
        let broker = running();
        let queue_id = broker.create_queue("jobs", QueueOptions::default()).unwrap();
        let noop = handler_fn(|_message| async { Ok(()) });
        let queue_sub = broker
            .subscribe_to_queue(&queue_id, "worker", noop.clone())
            .unwrap();
        let type_sub = broker.subscribe("worker", "task", noop).unwrap();
        assert_eq!(broker.get_metrics().subscriptions, 2);

        assert!(!broker.unsubscribe("intruder", &queue_sub).unwrap());
        assert!(broker.unsubscribe("worker", &queue_sub).unwrap());
        assert!(broker.unsubscribe("worker", &type_sub).unwrap());
        assert!(!broker.unsubscribe("worker", &type_sub).unwrap());
        assert_eq!(broker.get_metrics().subscriptions, 0);
    }

    #[tokio::test]
    async fn respond_requires_a_correlation_id() {
        let broker = running();
        let plain = Message::new("a", MessageTarget::Agent("b".into()), "ask", json!({}));
        assert!(broker.respond(&plain, "b", json!({})).unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn unregister_agent_drops_memberships_and_subscriptions() {
        let broker = running();
        let channel = broker
            .create_channel("ops", ChannelKind::Topic, ChannelOptions::default())
            .unwrap();
        broker.join_channel(&channel, "worker").unwrap();
        broker
            .subscribe("worker", "task", handler_fn(|_message| async { Ok(()) }))
            .unwrap();
        assert_eq!(broker.known_agents().unwrap(), vec!["worker".to_string()]);

        assert!(broker.unregister_agent("worker").unwrap());
        assert!(broker.get_channel(&channel).unwrap().participants.is_empty());
        assert!(broker.known_agents().unwrap().is_empty());
        assert_eq!(broker.get_metrics().subscriptions, 0);
        assert!(!broker.unregister_agent("worker").unwrap());
    }
}
