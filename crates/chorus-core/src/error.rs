//! Error types for the messaging core.

use crate::ids::{ConnectionId, GroupId, UserId};
use crate::message::MessageKind;
use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced to callers of the core.
///
/// Every variant aborts the operation that produced it without mutating
/// registry or membership state.
#[derive(Debug, Error)]
pub enum Error {
    /// The user is not an authorized member of the group.
    #[error("User {user} is not a member of group {group}")]
    NotAuthorized {
        /// Group the operation targeted.
        group: GroupId,
        /// User that attempted it.
        user: UserId,
    },

    /// The connection id is already registered.
    #[error("Connection already registered: {0}")]
    DuplicateConnection(ConnectionId),

    /// The connection is not live, or is owned by a different user.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection has not joined the group.
    #[error("Connection {connection} has not joined group {group}")]
    NotSubscribed {
        /// Group the operation targeted.
        group: GroupId,
        /// Connection that attempted it.
        connection: ConnectionId,
    },

    /// Malformed group id.
    #[error("Invalid group id: {0}")]
    InvalidGroup(&'static str),

    /// The connection already joined the maximum number of groups.
    #[error("Maximum groups per connection reached ({0})")]
    MaxGroupsReached(usize),

    /// Message content exceeds the configured limit.
    #[error("Message content of {size} bytes exceeds the limit of {limit} bytes")]
    ContentTooLarge {
        /// Content size in bytes.
        size: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The group has not reached this sequence number.
    #[error("Group {group} has no message with sequence {sequence}")]
    UnknownSequence {
        /// Group the operation targeted.
        group: GroupId,
        /// Sequence number that was asked for.
        sequence: u64,
    },

    /// Clients may not send messages of this kind.
    #[error("Message kind {0:?} is reserved for the server")]
    ReservedKind(MessageKind),

    /// The authorization source could not answer.
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    /// The message store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of an [`Authorizer`](crate::auth::Authorizer) backend.
#[derive(Debug, Error)]
#[error("Authorization source failed: {0}")]
pub struct AuthorizationError(pub String);

impl AuthorizationError {
    /// Create a new authorization error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Result alias for core operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
