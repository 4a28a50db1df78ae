use super::error::CommsResult;
use super::handler::SharedHandler;
use super::message::{generate_id, require_non_empty, AgentId, SubscriptionId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

/// A registered `(agent, message type) -> handler` binding.
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub agent_id: AgentId,
    pub message_type: String,
    pub handler: SharedHandler,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("message_type", &self.message_type)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct SubscriptionState {
    by_id: HashMap<SubscriptionId, Subscription>,
    /// Subscription ids per `(agent, type)` in registration order.
    by_binding: HashMap<(AgentId, String), Vec<SubscriptionId>>,
    /// Agent directory used as the broadcast audience.
    agents: BTreeSet<AgentId>,
}

/// Owns type subscriptions and the directory of known agents.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: RwLock<SubscriptionState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        agent_id: &str,
        message_type: &str,
        handler: SharedHandler,
    ) -> CommsResult<SubscriptionId> {
        require_non_empty(agent_id, "agent_id")?;
        require_non_empty(message_type, "type")?;

        let subscription = Subscription {
            id: generate_id("sub"),
            agent_id: agent_id.to_string(),
            message_type: message_type.to_string(),
            handler,
            created_at: Utc::now(),
        };
        let id = subscription.id.clone();

        let mut state = self.state.write();
        state.agents.insert(agent_id.to_string());
        state
            .by_binding
            .entry((agent_id.to_string(), message_type.to_string()))
            .or_default()
            .push(id.clone());
        state.by_id.insert(id.clone(), subscription);
        Ok(id)
    }

    /// Remove a subscription owned by `agent_id`. Unknown ids and ids owned
    /// by another agent are ignored; returns whether anything was removed.
    pub fn unsubscribe(&self, agent_id: &str, subscription_id: &str) -> bool {
        let mut state = self.state.write();
        let owned = state
            .by_id
            .get(subscription_id)
            .is_some_and(|subscription| subscription.agent_id == agent_id);
        if !owned {
            return false;
        }

        let Some(subscription) = state.by_id.remove(subscription_id) else {
            return false;
        };
        let key = (subscription.agent_id, subscription.message_type);
        let mut remove_key = false;
        if let Some(ids) = state.by_binding.get_mut(&key) {
            ids.retain(|id| id != subscription_id);
            remove_key = ids.is_empty();
        }
        if remove_key {
            state.by_binding.remove(&key);
        }
        true
    }

    /// Handlers bound to exactly `(agent_id, message_type)`, in registration order.
    pub fn handlers_for(
        &self,
        agent_id: &str,
        message_type: &str,
    ) -> Vec<(SubscriptionId, SharedHandler)> {
        let state = self.state.read();
        state
            .by_binding
            .get(&(agent_id.to_string(), message_type.to_string()))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| {
                        state
                            .by_id
                            .get(id)
                            .map(|subscription| (id.clone(), subscription.handler.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_subscription(&self, agent_id: &str, message_type: &str) -> bool {
        self.state
            .read()
            .by_binding
            .contains_key(&(agent_id.to_string(), message_type.to_string()))
    }

    pub fn get(&self, subscription_id: &str) -> Option<Subscription> {
        self.state.read().by_id.get(subscription_id).cloned()
    }

    pub fn register_agent(&self, agent_id: &str) -> CommsResult<()> {
        require_non_empty(agent_id, "agent_id")?;
        self.state.write().agents.insert(agent_id.to_string());
        Ok(())
    }

    /// Forget an agent and drop every subscription it owns.
    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        let mut state = self.state.write();
        let removed = state.agents.remove(agent_id);
        state
            .by_id
            .retain(|_, subscription| subscription.agent_id != agent_id);
        state.by_binding.retain(|(agent, _), _| agent != agent_id);
        removed
    }

    pub fn is_known_agent(&self, agent_id: &str) -> bool {
        self.state.read().agents.contains(agent_id)
    }

    /// Known agents, sorted.
    pub fn known_agents(&self) -> Vec<AgentId> {
        self.state.read().agents.iter().cloned().collect()
    }

    pub fn agent_count(&self) -> usize {
        self.state.read().agents.len()
    }

    pub fn count(&self) -> usize {
        self.state.read().by_id.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.by_id.clear();
        state.by_binding.clear();
        state.agents.clear();
    }
}
