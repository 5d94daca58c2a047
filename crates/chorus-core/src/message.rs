//! Chat message types.

use crate::ids::{ConnectionId, GroupId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unique message identifier.
pub type MessageId = u64;

/// Per-group sequence number. The first message of a group gets `1`.
pub type Sequence = u64;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    // Millisecond timestamp in the upper bits, counter in the lower 20.
    let timestamp = now_millis();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    (timestamp << 20) | (counter & 0xF_FFFF)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// What the content of a message represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Content is an image reference.
    Image,
    /// Content is a file reference.
    File,
    /// Generated by the server, not a user.
    System,
}

/// A message addressed to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Target group.
    pub group: GroupId,
    /// Sending user.
    pub sender: UserId,
    /// Connection the message arrived on, if any.
    pub source: Option<ConnectionId>,
    /// Content kind.
    pub kind: MessageKind,
    /// Message content.
    pub content: String,
    /// Timestamp when the message was created (ms since epoch).
    pub timestamp: u64,
    /// Per-group sequence number, assigned by the router. Zero until routed.
    pub sequence: Sequence,
}

impl Message {
    /// Create a new, unsequenced text message.
    #[must_use]
    pub fn new(group: impl Into<GroupId>, sender: impl Into<UserId>, content: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            group: group.into(),
            sender: sender.into(),
            source: None,
            kind: MessageKind::Text,
            content: content.into(),
            timestamp: now_millis(),
            sequence: 0,
        }
    }

    /// Set the connection the message arrived on.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<ConnectionId>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the content kind.
    #[must_use]
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub(crate) fn sequenced(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    /// Get the content size in bytes.
    #[must_use]
    pub fn content_size(&self) -> usize {
        self.content.len()
    }
}

/// Outcome of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageReceipt {
    /// Identifier of the routed message.
    pub id: MessageId,
    /// Sequence number assigned within the group.
    pub sequence: Sequence,
    /// Connections the message was handed to.
    pub delivered: usize,
    /// Connections whose delivery failed.
    pub failed: usize,
}
