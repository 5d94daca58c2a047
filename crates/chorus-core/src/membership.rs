//! Group membership.
//!
//! Tracks which live connections have joined which groups. A group's entry
//! in the map is its critical section: joins, leaves, disconnect cleanup and
//! message fan-out for one group are serialized on it, while other groups
//! proceed independently.

use crate::auth::Authorizer;
use crate::error::{Error, Result};
use crate::ids::{ConnectionId, GroupId, UserId};
use crate::message::Sequence;
use crate::registry::{ConnectionRegistry, DisconnectedConnection};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Default maximum number of groups a single connection may join.
pub const DEFAULT_MAX_GROUPS_PER_CONNECTION: usize = 100;

/// State of a single group.
#[derive(Debug, Default)]
pub struct GroupState {
    subscribers: HashSet<ConnectionId>,
    last_sequence: Sequence,
    read_marks: HashMap<UserId, Sequence>,
}

impl GroupState {
    /// Connections currently joined.
    #[must_use]
    pub fn subscribers(&self) -> &HashSet<ConnectionId> {
        &self.subscribers
    }

    /// Sequence number of the last routed message, `0` if none.
    #[must_use]
    pub fn last_sequence(&self) -> Sequence {
        self.last_sequence
    }

    /// Highest sequence number `user_id` has read, `0` if none.
    #[must_use]
    pub fn read_mark(&self, user_id: &UserId) -> Sequence {
        self.read_marks.get(user_id).copied().unwrap_or(0)
    }

    /// Move a user's read mark forward. Returns `false` if it would not move.
    pub(crate) fn advance_read_mark(&mut self, user_id: &UserId, sequence: Sequence) -> bool {
        let mark = self.read_marks.entry(user_id.clone()).or_insert(0);
        if sequence <= *mark {
            return false;
        }
        *mark = sequence;
        true
    }

    pub(crate) fn next_sequence(&mut self) -> Sequence {
        self.last_sequence += 1;
        self.last_sequence
    }
}

/// Subscriber sets of all groups.
pub struct GroupMembership {
    groups: DashMap<GroupId, GroupState>,
    registry: Arc<ConnectionRegistry>,
    authorizer: Arc<dyn Authorizer>,
    max_groups_per_connection: usize,
}

impl GroupMembership {
    /// Create the membership table.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        authorizer: Arc<dyn Authorizer>,
        max_groups_per_connection: usize,
    ) -> Self {
        Self {
            groups: DashMap::new(),
            registry,
            authorizer,
            max_groups_per_connection,
        }
    }

    /// The registry this table validates connections against.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Join a connection to a group.
    ///
    /// Returns `false` if the connection had already joined.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidGroup`] for a malformed group id.
    /// - [`Error::NotAuthorized`] if `user_id` is not a member of the group.
    /// - [`Error::UnknownConnection`] if the connection is not live or is owned
    ///   by another user.
    /// - [`Error::MaxGroupsReached`] if the connection is at its limit.
    pub async fn join(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
        connection_id: &ConnectionId,
    ) -> Result<bool> {
        group_id.validate().map_err(Error::InvalidGroup)?;

        if !self.authorizer.is_member(group_id, user_id).await? {
            return Err(Error::NotAuthorized {
                group: group_id.clone(),
                user: user_id.clone(),
            });
        }

        self.subscribe(group_id, user_id, connection_id)
    }

    /// Join without consulting the authorizer; the caller has done so.
    pub(crate) fn subscribe(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
        connection_id: &ConnectionId,
    ) -> Result<bool> {
        self.registry.with_connection(connection_id, user_id, |info| {
            if info.groups.contains(group_id) {
                return Ok(false);
            }
            if info.groups.len() >= self.max_groups_per_connection {
                return Err(Error::MaxGroupsReached(self.max_groups_per_connection));
            }

            let mut group = self.groups.entry(group_id.clone()).or_default();
            group.subscribers.insert(connection_id.clone());
            info.groups.insert(group_id.clone());

            debug!(
                group = %group_id,
                connection = %connection_id,
                subscribers = group.subscribers.len(),
                "Joined group"
            );
            Ok(true)
        })
    }

    /// Remove a connection from a group.
    ///
    /// Returns `true` if the connection had joined. Leaving twice is harmless.
    pub fn leave(&self, group_id: &GroupId, connection_id: &ConnectionId) -> bool {
        let left = self
            .registry
            .with_any_connection(connection_id, |info| {
                info.groups.remove(group_id);
                self.remove_subscriber(group_id, connection_id)
            })
            .unwrap_or_else(|| self.remove_subscriber(group_id, connection_id));

        if left {
            debug!(group = %group_id, connection = %connection_id, "Left group");
        }
        left
    }

    fn remove_subscriber(&self, group_id: &GroupId, connection_id: &ConnectionId) -> bool {
        self.groups
            .get_mut(group_id)
            .map(|mut group| group.subscribers.remove(connection_id))
            .unwrap_or(false)
    }

    /// Disconnect a connection and remove it from every group it joined.
    ///
    /// Returns `None` if the connection was not live.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Option<DisconnectedConnection> {
        let removed = self.registry.disconnect(connection_id, |info| {
            for group_id in &info.groups {
                self.remove_subscriber(group_id, connection_id);
            }
        })?;
        debug!(
            connection = %connection_id,
            groups = removed.info.groups.len(),
            "Removed connection from all groups"
        );
        Some(removed)
    }

    /// Remove every connection of `user_id` from a group, after the user's
    /// membership was revoked.
    ///
    /// Returns the number of connections removed.
    pub fn evict_user(&self, group_id: &GroupId, user_id: &UserId) -> usize {
        self.registry
            .connections_for(user_id)
            .iter()
            .filter(|connection_id| self.leave(group_id, connection_id))
            .count()
    }

    /// Live connections joined to a group.
    #[must_use]
    pub fn subscribers_of(&self, group_id: &GroupId) -> HashSet<ConnectionId> {
        self.groups
            .get(group_id)
            .map(|group| group.subscribers.clone())
            .unwrap_or_default()
    }

    /// Whether a connection has joined a group.
    #[must_use]
    pub fn is_subscribed(&self, group_id: &GroupId, connection_id: &ConnectionId) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|group| group.subscribers.contains(connection_id))
    }

    /// Sequence number of the last message routed to a group.
    #[must_use]
    pub fn last_sequence(&self, group_id: &GroupId) -> Sequence {
        self.groups
            .get(group_id)
            .map_or(0, |group| group.last_sequence)
    }

    /// Highest sequence number of a group that a user has marked read.
    #[must_use]
    pub fn last_read(&self, group_id: &GroupId, user_id: &UserId) -> Sequence {
        self.groups
            .get(group_id)
            .map_or(0, |group| group.read_mark(user_id))
    }

    /// Run `f` inside a group's critical section, creating the group if needed.
    pub(crate) fn with_group<R>(&self, group_id: &GroupId, f: impl FnOnce(&mut GroupState) -> R) -> R {
        let mut group = self.groups.entry(group_id.clone()).or_default();
        f(&mut group)
    }

    /// Run `f` inside an existing group's critical section.
    pub(crate) fn with_existing_group_mut<R>(
        &self,
        group_id: &GroupId,
        f: impl FnOnce(&mut GroupState) -> R,
    ) -> Option<R> {
        self.groups.get_mut(group_id).map(|mut group| f(&mut group))
    }

    /// Run `f` on an existing group, holding its entry for reading.
    pub(crate) fn with_existing_group<R>(
        &self,
        group_id: &GroupId,
        f: impl FnOnce(&GroupState) -> R,
    ) -> Option<R> {
        self.groups.get(group_id).map(|group| f(&group))
    }

    /// Membership statistics.
    #[must_use]
    pub fn stats(&self) -> MembershipStats {
        MembershipStats {
            group_count: self.groups.len(),
            total_subscriptions: self.groups.iter().map(|g| g.subscribers.len()).sum(),
        }
    }
}

impl std::fmt::Debug for GroupMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupMembership")
            .field("groups", &self.groups.len())
            .field("max_groups_per_connection", &self.max_groups_per_connection)
            .finish()
    }
}

/// Membership statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipStats {
    /// Number of known groups.
    pub group_count: usize,
    /// Sum of all subscriber set sizes.
    pub total_subscriptions: usize,
}
