use super::error::{CommsError, CommsResult, EntityKind};
use super::message::{generate_id, AgentId, ChannelId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Channels created by `initialize` and never implicitly destroyed.
pub const DEFAULT_CHANNELS: &[(&str, ChannelKind)] = &[
    ("system-broadcast", ChannelKind::Broadcast),
    ("agent-coordination", ChannelKind::Topic),
    ("task-distribution", ChannelKind::Topic),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Every participant except the sender receives every message.
    Broadcast,
    /// Participants only receive message types they subscribed to
    /// (when filtering is enabled).
    Topic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub persistent: bool,
    pub reliable: bool,
    pub max_participants: Option<usize>,
}

/// Named fan-out destination with a joinable participant set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelKind,
    pub participants: BTreeSet<AgentId>,
    pub persistent: bool,
    pub reliable: bool,
    pub max_participants: Option<usize>,
    pub created_at: DateTime<Utc>,
}

/// Channel registry. Each channel sits behind its own lock so joins and
/// fan-outs on independent channels never contend.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<Mutex<Channel>>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel. Names are labels; every call yields a fresh id.
    pub fn create(&self, name: &str, kind: ChannelKind, options: ChannelOptions) -> ChannelId {
        let channel = Channel {
            id: generate_id("channel"),
            name: name.to_string(),
            kind,
            participants: BTreeSet::new(),
            persistent: options.persistent,
            reliable: options.reliable,
            max_participants: options.max_participants,
            created_at: Utc::now(),
        };
        let id = channel.id.clone();
        self.channels
            .write()
            .insert(id.clone(), Arc::new(Mutex::new(channel)));
        tracing::debug!(channel_id = %id, name, ?kind, "channel created");
        id
    }

    fn entry(&self, channel_id: &str) -> CommsResult<Arc<Mutex<Channel>>> {
        self.channels
            .read()
            .get(channel_id)
            .cloned()
            .ok_or_else(|| CommsError::not_found(EntityKind::Channel, channel_id))
    }

    /// Add `agent_id` to the participant set. Returns `false` when the agent
    /// had already joined.
    pub fn join(&self, channel_id: &str, agent_id: &str) -> CommsResult<bool> {
        let entry = self.entry(channel_id)?;
        let mut channel = entry.lock();
        if channel.participants.contains(agent_id) {
            return Ok(false);
        }
        if let Some(max_participants) = channel.max_participants {
            if channel.participants.len() >= max_participants {
                return Err(CommsError::ChannelFull {
                    channel_id: channel_id.to_string(),
                    max_participants,
                });
            }
        }
        channel.participants.insert(agent_id.to_string());
        Ok(true)
    }

    /// Remove `agent_id`. Leaving as a non-member is a no-op returning `false`.
    pub fn leave(&self, channel_id: &str, agent_id: &str) -> CommsResult<bool> {
        let entry = self.entry(channel_id)?;
        let removed = entry.lock().participants.remove(agent_id);
        Ok(removed)
    }

    pub fn get(&self, channel_id: &str) -> CommsResult<Channel> {
        Ok(self.entry(channel_id)?.lock().clone())
    }

    /// Snapshot of all channels, oldest first.
    pub fn list(&self) -> Vec<Channel> {
        let entries: Vec<_> = self.channels.read().values().cloned().collect();
        let mut channels: Vec<Channel> = entries.iter().map(|entry| entry.lock().clone()).collect();
        channels.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        channels
    }

    pub fn find_by_name(&self, name: &str) -> Vec<ChannelId> {
        self.list()
            .into_iter()
            .filter(|channel| channel.name == name)
            .map(|channel| channel.id)
            .collect()
    }

    pub fn delete(&self, channel_id: &str) -> CommsResult<Channel> {
        let entry = self
            .channels
            .write()
            .remove(channel_id)
            .ok_or_else(|| CommsError::not_found(EntityKind::Channel, channel_id))?;
        let channel = entry.lock().clone();
        tracing::debug!(channel_id, "channel deleted");
        Ok(channel)
    }

    /// Fan-out audience for a post: kind plus every participant except the sender.
    pub fn recipients(&self, channel_id: &str, sender: &str) -> CommsResult<(ChannelKind, Vec<AgentId>)> {
        let entry = self.entry(channel_id)?;
        let channel = entry.lock();
        let recipients = channel
            .participants
            .iter()
            .filter(|participant| participant.as_str() != sender)
            .cloned()
            .collect();
        Ok((channel.kind, recipients))
    }

    /// Drop `agent_id` from every channel it joined.
    pub fn remove_agent(&self, agent_id: &str) {
        let entries: Vec<_> = self.channels.read().values().cloned().collect();
        for entry in entries {
            entry.lock().participants.remove(agent_id);
        }
    }

    pub fn count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn clear(&self) {
        self.channels.write().clear();
    }
}
