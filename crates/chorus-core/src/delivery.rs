//! Outbound delivery to the transport layer.

use crate::ids::{ConnectionId, GroupId, UserId};
use crate::message::{Message, Sequence};
use crate::presence::PresenceEvent;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Something the core hands to a connection.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A sequenced group message.
    Message(Arc<Message>),
    /// A user went online or offline.
    Presence {
        /// Group the notification is scoped to.
        group: GroupId,
        /// The transition.
        event: PresenceEvent,
    },
    /// A user started or stopped typing in a group.
    Typing {
        /// Group being typed in.
        group: GroupId,
        /// User typing.
        user: UserId,
        /// `true` on start, `false` on stop.
        active: bool,
    },
    /// A user has read a group up to a sequence number.
    Read {
        /// Group being read.
        group: GroupId,
        /// Reader.
        user: UserId,
        /// Last sequence number read.
        sequence: Sequence,
    },
}

/// Per-connection delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The connection is gone.
    #[error("Connection closed")]
    Closed,

    /// The connection's outbound queue is full.
    #[error("Outbound queue full")]
    Backpressure,
}

/// Transport callback used by the core to reach a connection.
///
/// Called while a per-group critical section is held, so implementations
/// must not block.
pub trait DeliverySink: Send + Sync {
    /// Hand `delivery` to `connection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot accept the delivery now.
    fn deliver(&self, connection: &ConnectionId, delivery: &Delivery) -> Result<(), DeliveryError>;
}

/// A [`DeliverySink`] backed by one bounded channel per connection.
#[derive(Debug)]
pub struct ChannelSink {
    outbound: DashMap<ConnectionId, mpsc::Sender<Delivery>>,
    capacity: usize,
}

impl ChannelSink {
    /// Create a sink whose per-connection queues hold `capacity` deliveries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            outbound: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Open a queue for a connection, replacing any previous one.
    pub fn register(&self, connection: ConnectionId) -> mpsc::Receiver<Delivery> {
        let (tx, rx) = mpsc::channel(self.capacity);
        debug!(connection = %connection, capacity = self.capacity, "Outbound queue opened");
        self.outbound.insert(connection, tx);
        rx
    }

    /// Close a connection's queue.
    ///
    /// Returns `true` if the connection had one.
    pub fn unregister(&self, connection: &ConnectionId) -> bool {
        self.outbound.remove(connection).is_some()
    }

    /// Number of open queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outbound.len()
    }

    /// Whether no queue is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }
}

impl DeliverySink for ChannelSink {
    fn deliver(&self, connection: &ConnectionId, delivery: &Delivery) -> Result<(), DeliveryError> {
        let tx = self.outbound.get(connection).ok_or(DeliveryError::Closed)?;
        tx.try_send(delivery.clone()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Backpressure,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing() -> Delivery {
        Delivery::Typing {
            group: "g1".into(),
            user: "alice".into(),
            active: true,
        }
    }

    #[test]
    fn test_channel_sink_delivers() {
        let sink = ChannelSink::new(4);
        let mut rx = sink.register("conn-1".into());

        sink.deliver(&"conn-1".into(), &typing()).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Delivery::Typing { active: true, .. })));
    }

    #[test]
    fn test_channel_sink_unknown_connection() {
        let sink = ChannelSink::new(4);
        assert_eq!(
            sink.deliver(&"nobody".into(), &typing()),
            Err(DeliveryError::Closed)
        );
    }

    #[test]
    fn test_channel_sink_backpressure_and_close() {
        let sink = ChannelSink::new(1);
        let rx = sink.register("conn-1".into());

        sink.deliver(&"conn-1".into(), &typing()).unwrap();
        assert_eq!(
            sink.deliver(&"conn-1".into(), &typing()),
            Err(DeliveryError::Backpressure)
        );

        drop(rx);
        assert_eq!(
            sink.deliver(&"conn-1".into(), &typing()),
            Err(DeliveryError::Closed)
        );

        assert!(sink.unregister(&"conn-1".into()));
        assert!(sink.is_empty());
    }
}
