//! Channel membership table.
//!
//! Application-level groups of connection ids used by room-based routing.
//! A channel exists only while it has members.

use crate::backend::ConnectionId;
use std::collections::{HashMap, HashSet};

/// Channel name → member connection ids.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: HashMap<String, HashSet<ConnectionId>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member, creating the channel if needed.
    ///
    /// Returns false if the id was already a member. Liveness of the id is
    /// checked by the caller against the connection registry.
    pub fn join(&mut self, id: &ConnectionId, channel: &str) -> bool {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id.clone())
    }

    /// Remove a member; the channel is dropped once empty.
    ///
    /// Returns false when nothing changed.
    pub fn leave(&mut self, id: &ConnectionId, channel: &str) -> bool {
        let Some(members) = self.channels.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(id);
        if members.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Remove an id from every channel it belongs to.
    pub fn leave_all(&mut self, id: &ConnectionId) -> usize {
        let mut left = 0;
        self.channels.retain(|_, members| {
            if members.remove(id) {
                left += 1;
            }
            !members.is_empty()
        });
        left
    }

    /// Members of a channel; empty when the channel does not exist.
    pub fn members_of(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Number of non-empty channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
