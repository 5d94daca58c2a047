//! Message router for Chorus.
//!
//! Sequence assignment and fan-out for a group happen inside that group's
//! critical section, so every subscriber observes the group's messages in
//! sequence order. Recording to the store happens after the section is left.

use crate::auth::Authorizer;
use crate::delivery::{Delivery, DeliverySink};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::ids::{ConnectionId, GroupId, UserId};
use crate::membership::GroupMembership;
use crate::message::{Message, MessageId, MessageReceipt, Sequence};
use crate::presence::PresenceEvent;
use crate::store::MessageStore;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum message content size in bytes.
    pub max_content_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_content_size: 64 * 1024,
        }
    }
}

/// Published on the event bus after every fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRouted {
    /// Target group.
    pub group: GroupId,
    /// Routed message.
    pub message_id: MessageId,
    /// Assigned sequence number.
    pub sequence: Sequence,
    /// Content size in bytes.
    pub size: usize,
    /// Connections the message was handed to.
    pub delivered: usize,
    /// Connections whose delivery failed.
    pub failed: usize,
}

/// Routes messages, typing indicators and presence notifications to groups.
pub struct MessageRouter {
    membership: Arc<GroupMembership>,
    authorizer: Arc<dyn Authorizer>,
    sink: Arc<dyn DeliverySink>,
    store: Arc<dyn MessageStore>,
    events: Arc<EventBus>,
    config: RouterConfig,
}

impl MessageRouter {
    /// Create a router.
    #[must_use]
    pub fn new(
        membership: Arc<GroupMembership>,
        authorizer: Arc<dyn Authorizer>,
        sink: Arc<dyn DeliverySink>,
        store: Arc<dyn MessageStore>,
        events: Arc<EventBus>,
        config: RouterConfig,
    ) -> Self {
        Self {
            membership,
            authorizer,
            sink,
            store,
            events,
            config,
        }
    }

    /// Send a text message to a group.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn send(
        &self,
        group_id: &GroupId,
        sender: &UserId,
        content: impl Into<String>,
    ) -> Result<MessageReceipt> {
        self.publish(Message::new(group_id.clone(), sender.clone(), content))
            .await
    }

    /// Sequence a message and fan it out to the group's current subscribers.
    ///
    /// Per-connection delivery failures are counted in the receipt, never
    /// returned. A store failure is logged and does not fail the send.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidGroup`] for a malformed group id.
    /// - [`Error::ContentTooLarge`] if the content exceeds the limit.
    /// - [`Error::NotAuthorized`] if the sender is not a member; no sequence
    ///   number is consumed.
    pub async fn publish(&self, message: Message) -> Result<MessageReceipt> {
        message.group.validate().map_err(Error::InvalidGroup)?;

        let size = message.content_size();
        if size > self.config.max_content_size {
            return Err(Error::ContentTooLarge {
                size,
                limit: self.config.max_content_size,
            });
        }

        if !self
            .authorizer
            .is_member(&message.group, &message.sender)
            .await?
        {
            return Err(Error::NotAuthorized {
                group: message.group,
                user: message.sender,
            });
        }

        let group_id = message.group.clone();
        let (message, delivered, failed) = self.membership.with_group(&group_id, |group| {
            let message = Arc::new(message.sequenced(group.next_sequence()));
            let delivery = Delivery::Message(Arc::clone(&message));
            let (delivered, failed) = self.fan_out(&group_id, group.subscribers().iter(), &delivery);
            (message, delivered, failed)
        });

        debug!(
            group = %group_id,
            sequence = message.sequence,
            delivered,
            failed,
            "Message routed"
        );

        self.events.publish(&MessageRouted {
            group: group_id.clone(),
            message_id: message.id,
            sequence: message.sequence,
            size,
            delivered,
            failed,
        });

        if let Err(e) = self.store.record_message(&message).await {
            warn!(
                group = %group_id,
                sequence = message.sequence,
                error = %e,
                "Failed to record message"
            );
        }

        Ok(MessageReceipt {
            id: message.id,
            sequence: message.sequence,
            delivered,
            failed,
        })
    }

    /// Tell every other subscriber of a group that `user_id` started or
    /// stopped typing.
    ///
    /// Returns the number of connections notified.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSubscribed`] if `from` has not joined the group.
    pub fn broadcast_typing(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
        from: &ConnectionId,
        active: bool,
    ) -> Result<usize> {
        let not_subscribed = || Error::NotSubscribed {
            group: group_id.clone(),
            connection: from.clone(),
        };

        self.membership
            .with_existing_group(group_id, |group| {
                if !group.subscribers().contains(from) {
                    return Err(not_subscribed());
                }
                let delivery = Delivery::Typing {
                    group: group_id.clone(),
                    user: user_id.clone(),
                    active,
                };
                let targets = group.subscribers().iter().filter(|c| *c != from);
                Ok(self.fan_out(group_id, targets, &delivery).0)
            })
            .unwrap_or_else(|| Err(not_subscribed()))
    }

    /// Tell every other subscriber of a group that `user_id` has read up to
    /// `sequence`.
    ///
    /// Read marks only move forward; a receipt at or below the user's current
    /// mark is accepted and not relayed. Returns the number of connections
    /// notified.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSubscribed`] if `from` has not joined the group.
    /// - [`Error::UnknownSequence`] if no message with `sequence` was routed.
    pub fn broadcast_read(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
        from: &ConnectionId,
        sequence: Sequence,
    ) -> Result<usize> {
        let not_subscribed = || Error::NotSubscribed {
            group: group_id.clone(),
            connection: from.clone(),
        };

        self.membership
            .with_existing_group_mut(group_id, |group| {
                if !group.subscribers().contains(from) {
                    return Err(not_subscribed());
                }
                if sequence == 0 || sequence > group.last_sequence() {
                    return Err(Error::UnknownSequence {
                        group: group_id.clone(),
                        sequence,
                    });
                }
                if !group.advance_read_mark(user_id, sequence) {
                    return Ok(0);
                }
                let delivery = Delivery::Read {
                    group: group_id.clone(),
                    user: user_id.clone(),
                    sequence,
                };
                let targets = group.subscribers().iter().filter(|c| *c != from);
                Ok(self.fan_out(group_id, targets, &delivery).0)
            })
            .unwrap_or_else(|| Err(not_subscribed()))
    }

    /// Notify the subscribers of `groups` about a presence transition. The
    /// user's own connections are skipped.
    ///
    /// Returns the number of connections notified.
    pub fn broadcast_presence(&self, event: &PresenceEvent, groups: &[GroupId]) -> usize {
        // Resolved before entering any group section.
        let own = self.membership.registry().connections_for(&event.user_id);

        groups
            .iter()
            .filter_map(|group_id| {
                self.membership.with_existing_group(group_id, |group| {
                    let delivery = Delivery::Presence {
                        group: group_id.clone(),
                        event: event.clone(),
                    };
                    let targets = group.subscribers().iter().filter(|c| !own.contains(*c));
                    self.fan_out(group_id, targets, &delivery).0
                })
            })
            .sum()
    }

    fn fan_out<'a>(
        &self,
        group_id: &GroupId,
        targets: impl Iterator<Item = &'a ConnectionId>,
        delivery: &Delivery,
    ) -> (usize, usize) {
        let mut delivered = 0;
        let mut failed = 0;
        for connection_id in targets {
            match self.sink.deliver(connection_id, delivery) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(
                        group = %group_id,
                        connection = %connection_id,
                        error = %e,
                        "Delivery failed"
                    );
                    failed += 1;
                }
            }
        }
        trace!(group = %group_id, delivered, failed, "Fan-out complete");
        (delivered, failed)
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
