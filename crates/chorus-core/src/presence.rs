//! Presence tracking for Chorus.
//!
//! A user is online while at least one of their connections is live. The
//! tracker for a user is only ever mutated inside that user's critical section
//! in the [`ConnectionRegistry`](crate::registry::ConnectionRegistry), so each
//! transition is observed exactly once.

use crate::ids::{ConnectionId, UserId};
use crate::message::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Online state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    /// At least one live connection.
    Online,
    /// No live connections.
    Offline,
}

/// Emitted once per actual Online/Offline transition of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// User whose state changed.
    pub user_id: UserId,
    /// The new state.
    pub state: PresenceState,
    /// When the transition happened (ms since epoch).
    pub timestamp: u64,
}

impl PresenceEvent {
    fn new(user_id: UserId, state: PresenceState) -> Self {
        Self {
            user_id,
            state,
            timestamp: now_millis(),
        }
    }
}

/// Presence state machine for a single user.
#[derive(Debug)]
pub struct PresenceTracker {
    user_id: UserId,
    connections: HashSet<ConnectionId>,
}

impl PresenceTracker {
    /// Create a tracker for an offline user.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            connections: HashSet::new(),
        }
    }

    /// The tracked user.
    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PresenceState {
        if self.connections.is_empty() {
            PresenceState::Offline
        } else {
            PresenceState::Online
        }
    }

    /// Whether the user has a live connection.
    #[must_use]
    pub fn is_online(&self) -> bool {
        !self.connections.is_empty()
    }

    /// Live connections of the user.
    #[must_use]
    pub fn connections(&self) -> &HashSet<ConnectionId> {
        &self.connections
    }

    /// Record a new live connection.
    ///
    /// Returns the `Online` event if this was the user's first connection.
    pub fn add(&mut self, connection_id: ConnectionId) -> Option<PresenceEvent> {
        let was_online = self.is_online();
        if !self.connections.insert(connection_id) || was_online {
            return None;
        }
        debug!(user = %self.user_id, "Presence: user online");
        Some(PresenceEvent::new(self.user_id.clone(), PresenceState::Online))
    }

    /// Remove a connection.
    ///
    /// Returns the `Offline` event if it was the user's last connection.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<PresenceEvent> {
        if !self.connections.remove(connection_id) || self.is_online() {
            return None;
        }
        debug!(user = %self.user_id, "Presence: user offline");
        Some(PresenceEvent::new(self.user_id.clone(), PresenceState::Offline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_connection_goes_online() {
        let mut tracker = PresenceTracker::new("alice".into());
        assert_eq!(tracker.state(), PresenceState::Offline);

        let event = tracker.add("conn-1".into()).unwrap();
        assert_eq!(event.state, PresenceState::Online);
        assert_eq!(event.user_id.as_str(), "alice");
        assert!(tracker.is_online());

        // Second connection: no transition.
        assert!(tracker.add("conn-2".into()).is_none());
        // Re-adding an existing connection: no transition.
        assert!(tracker.add("conn-1".into()).is_none());
        assert_eq!(tracker.connections().len(), 2);
    }

    #[test]
    fn test_last_connection_goes_offline() {
        let mut tracker = PresenceTracker::new("alice".into());
        tracker.add("conn-1".into());
        tracker.add("conn-2".into());

        assert!(tracker.remove(&"conn-1".into()).is_none());
        assert_eq!(tracker.state(), PresenceState::Online);

        let event = tracker.remove(&"conn-2".into()).unwrap();
        assert_eq!(event.state, PresenceState::Offline);
        assert!(!tracker.is_online());

        // Removing an unknown connection while offline is not a transition.
        assert!(tracker.remove(&"conn-2".into()).is_none());
    }

    #[test]
    fn test_presence_event_serialization() {
        let mut tracker = PresenceTracker::new("bob".into());
        let event = tracker.add("conn-1".into()).unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["user_id"], "bob");
        assert_eq!(json["state"], "online");
    }
}
