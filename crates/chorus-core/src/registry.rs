//! Connection registry.
//!
//! Maps connection ids to the users that own them. Each user has a slot
//! guarded by its own mutex; connect and disconnect for the same user are
//! serialized through it while unrelated users proceed in parallel. Presence
//! transitions are computed and published inside that critical section.

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::ids::{ConnectionId, GroupId, UserId};
use crate::message::now_millis;
use crate::presence::{PresenceEvent, PresenceTracker};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// A live connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Owning user.
    pub user_id: UserId,
    /// When the connection was registered (ms since epoch).
    pub connected_at: u64,
    /// Groups the connection has joined.
    pub groups: HashSet<GroupId>,
}

/// What a disconnect removed.
#[derive(Debug, Clone)]
pub struct DisconnectedConnection {
    /// The removed connection.
    pub info: ConnectionInfo,
    /// The `Offline` event, if this was the user's last connection.
    pub presence: Option<PresenceEvent>,
}

struct UserSlot {
    tracker: PresenceTracker,
    /// Set once the slot has been removed from the map; holders must retry.
    retired: bool,
}

/// Registry of live connections.
///
/// [`PresenceEvent`] handlers run with the user's slot locked and must not
/// call back into the registry for that same user.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionInfo>,
    users: DashMap<UserId, Arc<Mutex<UserSlot>>>,
    last_seen: DashMap<UserId, u64>,
    events: Arc<EventBus>,
}

fn lock(slot: &Mutex<UserSlot>) -> MutexGuard<'_, UserSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionRegistry {
    /// Create a registry that publishes presence events on `events`.
    #[must_use]
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            last_seen: DashMap::new(),
            events,
        }
    }

    fn slot(&self, user_id: &UserId) -> Arc<Mutex<UserSlot>> {
        let slot = self.users.entry(user_id.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(UserSlot {
                tracker: PresenceTracker::new(user_id.clone()),
                retired: false,
            }))
        });
        Arc::clone(slot.value())
    }

    /// Drop an empty slot from the map. Must be called with the slot locked.
    fn retire_if_empty(&self, user_id: &UserId, slot: &Arc<Mutex<UserSlot>>, guard: &mut UserSlot) {
        if guard.tracker.is_online() {
            return;
        }
        guard.retired = true;
        self.users
            .remove_if(user_id, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Register a new connection for a user.
    ///
    /// Returns the `Online` event if this is the user's first connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateConnection`] if the id is already registered.
    pub fn connect(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> Result<Option<PresenceEvent>> {
        loop {
            let slot = self.slot(&user_id);
            let mut guard = lock(&slot);
            if guard.retired {
                continue;
            }

            match self.connections.entry(connection_id.clone()) {
                Entry::Occupied(_) => {
                    self.retire_if_empty(&user_id, &slot, &mut guard);
                    return Err(Error::DuplicateConnection(connection_id));
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(ConnectionInfo {
                        id: connection_id.clone(),
                        user_id: user_id.clone(),
                        connected_at: now_millis(),
                        groups: HashSet::new(),
                    });
                }
            }

            let transition = guard.tracker.add(connection_id.clone());
            self.last_seen.insert(user_id.clone(), now_millis());
            if let Some(event) = &transition {
                self.events.publish(event);
            }

            info!(connection = %connection_id, user = %user_id, "Connection registered");
            return Ok(transition);
        }
    }

    /// Remove a connection.
    ///
    /// `on_remove` runs while the connection's entry is still held.
    /// Returns `None` if the connection was not registered; calling this twice
    /// is harmless.
    pub(crate) fn disconnect(
        &self,
        connection_id: &ConnectionId,
        on_remove: impl FnOnce(&ConnectionInfo),
    ) -> Option<DisconnectedConnection> {
        loop {
            let user_id = self.connections.get(connection_id)?.user_id.clone();
            let Some(slot) = self.users.get(&user_id).map(|s| Arc::clone(s.value())) else {
                // Removed concurrently; re-check the connection.
                continue;
            };

            let mut guard = lock(&slot);
            if guard.retired {
                continue;
            }

            let info = match self.connections.entry(connection_id.clone()) {
                Entry::Occupied(entry) if entry.get().user_id == user_id => {
                    on_remove(entry.get());
                    entry.remove()
                }
                // The id was re-registered by another user meanwhile.
                Entry::Occupied(_) => continue,
                Entry::Vacant(_) => return None,
            };

            let presence = guard.tracker.remove(connection_id);
            if let Some(event) = &presence {
                self.last_seen.insert(user_id.clone(), event.timestamp);
                self.events.publish(event);
            }
            self.retire_if_empty(&user_id, &slot, &mut guard);

            info!(connection = %connection_id, user = %user_id, "Connection removed");
            return Some(DisconnectedConnection { info, presence });
        }
    }

    /// Live connections of a user.
    #[must_use]
    pub fn connections_for(&self, user_id: &UserId) -> HashSet<ConnectionId> {
        let Some(slot) = self.users.get(user_id).map(|s| Arc::clone(s.value())) else {
            return HashSet::new();
        };
        let guard = lock(&slot);
        guard.tracker.connections().clone()
    }

    /// Whether a user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        !self.connections_for(user_id).is_empty()
    }

    /// Owner of a live connection.
    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.connections
            .get(connection_id)
            .map(|info| info.user_id.clone())
    }

    /// Snapshot of a live connection.
    #[must_use]
    pub fn connection(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(connection_id).map(|info| info.clone())
    }

    /// Last time a user connected or went offline (ms since epoch).
    #[must_use]
    pub fn last_seen(&self, user_id: &UserId) -> Option<u64> {
        self.last_seen.get(user_id).map(|t| *t)
    }

    /// Run `f` on a live connection owned by `user_id`, holding its entry.
    ///
    /// A concurrent disconnect of the same connection waits until `f` returns.
    pub(crate) fn with_connection<R>(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
        f: impl FnOnce(&mut ConnectionInfo) -> Result<R>,
    ) -> Result<R> {
        let mut info = self
            .connections
            .get_mut(connection_id)
            .filter(|info| info.user_id == *user_id)
            .ok_or_else(|| Error::UnknownConnection(connection_id.clone()))?;
        f(&mut info)
    }

    /// Like [`with_connection`](Self::with_connection) without an owner check.
    /// Returns `None` if the connection is not live.
    pub(crate) fn with_any_connection<R>(
        &self,
        connection_id: &ConnectionId,
        f: impl FnOnce(&mut ConnectionInfo) -> R,
    ) -> Option<R> {
        let mut info = self.connections.get_mut(connection_id)?;
        Some(f(&mut info))
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connection_count: self.connections.len(),
            online_users: self.users.len(),
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("users", &self.users.len())
            .finish()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Number of users with at least one live connection.
    pub online_users: usize,
}
