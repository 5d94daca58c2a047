//! Group authorization source.

use crate::error::AuthorizationError;
use crate::ids::{GroupId, UserId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

/// Answers who may take part in a group.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `user` is an authorized member of `group`.
    async fn is_member(&self, group: &GroupId, user: &UserId) -> Result<bool, AuthorizationError>;

    /// Every group `user` is a member of.
    async fn groups_of(&self, user: &UserId) -> Result<Vec<GroupId>, AuthorizationError>;
}

/// In-memory membership table.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    members: DashMap<GroupId, HashSet<UserId>>,
}

impl StaticAuthorizer {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group with its members.
    #[must_use]
    pub fn with_group<I, U>(self, group: impl Into<GroupId>, members: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<UserId>,
    {
        let group = group.into();
        for user in members {
            self.grant(group.clone(), user.into());
        }
        self
    }

    /// Make `user` a member of `group`.
    ///
    /// Returns `true` if the user was not a member already.
    pub fn grant(&self, group: GroupId, user: UserId) -> bool {
        debug!(group = %group, user = %user, "Membership granted");
        self.members.entry(group).or_default().insert(user)
    }

    /// Remove `user` from `group`.
    ///
    /// Returns `true` if the user was a member.
    pub fn revoke(&self, group: &GroupId, user: &UserId) -> bool {
        let removed = self
            .members
            .get_mut(group)
            .map(|mut members| members.remove(user))
            .unwrap_or(false);
        if removed {
            debug!(group = %group, user = %user, "Membership revoked");
        }
        removed
    }

    /// Members of a group.
    #[must_use]
    pub fn members_of(&self, group: &GroupId) -> Vec<UserId> {
        self.members
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn is_member(&self, group: &GroupId, user: &UserId) -> Result<bool, AuthorizationError> {
        Ok(self
            .members
            .get(group)
            .is_some_and(|members| members.contains(user)))
    }

    async fn groups_of(&self, user: &UserId) -> Result<Vec<GroupId>, AuthorizationError> {
        let mut groups: Vec<GroupId> = self
            .members
            .iter()
            .filter(|entry| entry.value().contains(user))
            .map(|entry| entry.key().clone())
            .collect();
        groups.sort();
        Ok(groups)
    }
}
