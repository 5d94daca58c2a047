//! Message persistence.
//!
//! The core only records messages and serves replay; the storage schema is
//! left to the implementation.

use crate::ids::GroupId;
use crate::message::{Message, Sequence};
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::trace;

/// Errors from a [`MessageStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("Message store unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure.
    #[error("Message store error: {0}")]
    Other(String),
}

/// Where routed messages are recorded and replayed from.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Record a routed message.
    async fn record_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Messages of `group` with a sequence greater than `since`, oldest first,
    /// at most `limit` of them.
    async fn fetch_missed(
        &self,
        group: &GroupId,
        since: Sequence,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
}

/// In-memory [`MessageStore`] keeping the most recent messages per group.
#[derive(Debug)]
pub struct MemoryStore {
    groups: DashMap<GroupId, Vec<Message>>,
    retention: usize,
}

impl MemoryStore {
    /// Default number of messages kept per group.
    pub const DEFAULT_RETENTION: usize = 1000;

    /// Create a store with the default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(Self::DEFAULT_RETENTION)
    }

    /// Create a store keeping at most `retention` messages per group.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            groups: DashMap::new(),
            retention: retention.max(1),
        }
    }

    /// Number of messages held for a group.
    #[must_use]
    pub fn len(&self, group: &GroupId) -> usize {
        self.groups.get(group).map_or(0, |m| m.len())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn record_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut messages = self.groups.entry(message.group.clone()).or_default();
        // Recording happens after fan-out, so concurrent sends may arrive out of order.
        let pos = messages.partition_point(|m| m.sequence < message.sequence);
        if messages.get(pos).is_some_and(|m| m.sequence == message.sequence) {
            return Err(StoreError::Other(format!(
                "sequence {} already recorded for group {}",
                message.sequence, message.group
            )));
        }
        messages.insert(pos, message.clone());

        if messages.len() > self.retention {
            let excess = messages.len() - self.retention;
            messages.drain(..excess);
        }

        trace!(group = %message.group, sequence = message.sequence, "Message recorded");
        Ok(())
    }

    async fn fetch_missed(
        &self,
        group: &GroupId,
        since: Sequence,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let Some(messages) = self.groups.get(group) else {
            return Ok(Vec::new());
        };
        let start = messages.partition_point(|m| m.sequence <= since);
        Ok(messages[start..].iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(seq: Sequence) -> Message {
        Message::new("g1", "alice", format!("m{seq}")).sequenced(seq)
    }

    #[tokio::test]
    async fn test_fetch_missed_returns_newer_messages_in_order() {
        let store = MemoryStore::new();
        for seq in [1, 3, 2, 4] {
            store.record_message(&message(seq)).await.unwrap();
        }

        let missed = store.fetch_missed(&"g1".into(), 2, 10).await.unwrap();
        let seqs: Vec<_> = missed.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![3, 4]);

        let limited = store.fetch_missed(&"g1".into(), 0, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].sequence, 1);

        assert!(store.fetch_missed(&"g2".into(), 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_sequence_rejected() {
        let store = MemoryStore::new();
        store.record_message(&message(1)).await.unwrap();
        assert!(store.record_message(&message(1)).await.is_err());
        assert_eq!(store.len(&"g1".into()), 1);
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let store = MemoryStore::with_retention(3);
        for seq in 1..=5 {
            store.record_message(&message(seq)).await.unwrap();
        }
        let kept = store.fetch_missed(&"g1".into(), 0, 10).await.unwrap();
        let seqs: Vec<_> = kept.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }
}
