//! Transport-facing entry point.
//!
//! The transport layer reports connection lifecycle and client requests to
//! the [`Hub`]; the hub answers through the [`DeliverySink`] it was built with.
//! Only `on_connect` takes a user id. Every later call resolves the user from
//! the connection.

use crate::auth::Authorizer;
use crate::delivery::DeliverySink;
use crate::error::{Error, Result};
use crate::events::{EventBus, HandlerError};
use crate::ids::{ConnectionId, GroupId, UserId};
use crate::membership::{GroupMembership, DEFAULT_MAX_GROUPS_PER_CONNECTION};
use crate::message::{Message, MessageKind, MessageReceipt, Sequence};
use crate::presence::PresenceEvent;
use crate::registry::{ConnectionRegistry, DisconnectedConnection};
use crate::router::{MessageRouter, RouterConfig};
use crate::store::MessageStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Router settings.
    pub router: RouterConfig,
    /// Maximum groups a single connection may join.
    pub max_groups_per_connection: usize,
    /// Join every group the user belongs to when a connection opens.
    pub auto_join: bool,
    /// Maximum messages returned by one history request.
    pub history_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            max_groups_per_connection: DEFAULT_MAX_GROUPS_PER_CONNECTION,
            auto_join: true,
            history_limit: 100,
        }
    }
}

/// The messaging core, assembled.
pub struct Hub {
    events: Arc<EventBus>,
    registry: Arc<ConnectionRegistry>,
    membership: Arc<GroupMembership>,
    router: MessageRouter,
    authorizer: Arc<dyn Authorizer>,
    store: Arc<dyn MessageStore>,
    config: HubConfig,
}

impl Hub {
    /// Create a hub with the default configuration.
    #[must_use]
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        store: Arc<dyn MessageStore>,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        Self::with_config(authorizer, store, sink, HubConfig::default())
    }

    /// Create a hub with a custom configuration.
    #[must_use]
    pub fn with_config(
        authorizer: Arc<dyn Authorizer>,
        store: Arc<dyn MessageStore>,
        sink: Arc<dyn DeliverySink>,
        config: HubConfig,
    ) -> Self {
        info!("Creating hub with config: {:?}", config);
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&events)));
        let membership = Arc::new(GroupMembership::new(
            Arc::clone(&registry),
            Arc::clone(&authorizer),
            config.max_groups_per_connection,
        ));
        let router = MessageRouter::new(
            Arc::clone(&membership),
            Arc::clone(&authorizer),
            sink,
            Arc::clone(&store),
            Arc::clone(&events),
            config.router.clone(),
        );

        Self {
            events,
            registry,
            membership,
            router,
            authorizer,
            store,
            config,
        }
    }

    /// Event bus carrying [`PresenceEvent`] and
    /// [`MessageRouted`](crate::router::MessageRouted).
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The membership table.
    #[must_use]
    pub fn membership(&self) -> &Arc<GroupMembership> {
        &self.membership
    }

    /// The message router.
    #[must_use]
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    fn user_of(&self, connection_id: &ConnectionId) -> Result<UserId> {
        self.registry
            .user_of(connection_id)
            .ok_or_else(|| Error::UnknownConnection(connection_id.clone()))
    }

    /// A transport connection opened for an authenticated user.
    ///
    /// Returns the groups joined automatically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateConnection`] if the id is already registered.
    pub async fn on_connect(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
    ) -> Result<Vec<GroupId>> {
        self.registry.connect(connection_id.clone(), user_id.clone())?;

        if !self.config.auto_join {
            return Ok(Vec::new());
        }

        let groups = match self.authorizer.groups_of(&user_id).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Could not list groups for auto-join");
                return Ok(Vec::new());
            }
        };

        let mut joined = Vec::with_capacity(groups.len());
        for group_id in groups {
            match self.membership.subscribe(&group_id, &user_id, &connection_id) {
                Ok(_) => joined.push(group_id),
                // Disconnected while we were listing groups.
                Err(Error::UnknownConnection(_)) => break,
                Err(e) => {
                    warn!(group = %group_id, connection = %connection_id, error = %e, "Auto-join failed");
                }
            }
        }

        debug!(connection = %connection_id, groups = joined.len(), "Auto-joined groups");
        Ok(joined)
    }

    /// A transport connection closed, explicitly or by timeout.
    ///
    /// Returns `None` if it was already gone.
    pub fn on_disconnect(&self, connection_id: &ConnectionId) -> Option<DisconnectedConnection> {
        self.membership.disconnect(connection_id)
    }

    /// A client sent a text message to a group.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownConnection`] plus everything
    /// [`MessageRouter::publish`] returns.
    pub async fn on_client_message(
        &self,
        connection_id: &ConnectionId,
        group_id: &GroupId,
        content: impl Into<String>,
    ) -> Result<MessageReceipt> {
        self.on_client_message_of_kind(connection_id, group_id, MessageKind::Text, content)
            .await
    }

    /// A client sent a message of a specific kind to a group.
    ///
    /// # Errors
    ///
    /// Same as [`on_client_message`](Self::on_client_message), plus
    /// [`Error::ReservedKind`] for [`MessageKind::System`].
    pub async fn on_client_message_of_kind(
        &self,
        connection_id: &ConnectionId,
        group_id: &GroupId,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Result<MessageReceipt> {
        if kind == MessageKind::System {
            return Err(Error::ReservedKind(kind));
        }
        let user_id = self.user_of(connection_id)?;
        let message = Message::new(group_id.clone(), user_id, content)
            .with_source(connection_id.clone())
            .with_kind(kind);
        self.router.publish(message).await
    }

    /// A client asked to join a group.
    ///
    /// # Errors
    ///
    /// See [`GroupMembership::join`].
    pub async fn on_join(&self, connection_id: &ConnectionId, group_id: &GroupId) -> Result<bool> {
        let user_id = self.user_of(connection_id)?;
        self.membership.join(group_id, &user_id, connection_id).await
    }

    /// A client asked to leave a group.
    pub fn on_leave(&self, connection_id: &ConnectionId, group_id: &GroupId) -> bool {
        self.membership.leave(group_id, connection_id)
    }

    /// A client has read a group up to `sequence`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownConnection`], [`Error::NotSubscribed`] or
    /// [`Error::UnknownSequence`].
    pub fn on_read(
        &self,
        connection_id: &ConnectionId,
        group_id: &GroupId,
        sequence: Sequence,
    ) -> Result<usize> {
        let user_id = self.user_of(connection_id)?;
        self.router
            .broadcast_read(group_id, &user_id, connection_id, sequence)
    }

    /// A client started or stopped typing.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownConnection`] or [`Error::NotSubscribed`].
    pub fn on_typing(
        &self,
        connection_id: &ConnectionId,
        group_id: &GroupId,
        active: bool,
    ) -> Result<usize> {
        let user_id = self.user_of(connection_id)?;
        self.router
            .broadcast_typing(group_id, &user_id, connection_id, active)
    }

    /// Messages of a group after `since`, for a client filling a gap.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownConnection`], [`Error::NotAuthorized`] or
    /// [`Error::Store`].
    pub async fn history(
        &self,
        connection_id: &ConnectionId,
        group_id: &GroupId,
        since: Sequence,
    ) -> Result<Vec<Message>> {
        let user_id = self.user_of(connection_id)?;
        if !self.authorizer.is_member(group_id, &user_id).await? {
            return Err(Error::NotAuthorized {
                group: group_id.clone(),
                user: user_id,
            });
        }
        let messages = self
            .store
            .fetch_missed(group_id, since, self.config.history_limit)
            .await?;
        Ok(messages)
    }

    /// A user's membership in a group was revoked at the authorization source.
    ///
    /// Returns the number of connections removed from the group.
    pub fn membership_revoked(&self, group_id: &GroupId, user_id: &UserId) -> usize {
        let evicted = self.membership.evict_user(group_id, user_id);
        info!(group = %group_id, user = %user_id, evicted, "Membership revoked");
        evicted
    }

    /// Forward presence transitions to the groups of the user, off the
    /// publishing thread.
    ///
    /// The task ends once the hub is dropped.
    pub fn spawn_presence_fanout(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PresenceEvent>();
        self.events.subscribe(move |event: &PresenceEvent| {
            tx.send(event.clone())
                .map_err(|_| HandlerError::new("presence fan-out stopped"))
        });

        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                match hub.authorizer.groups_of(&event.user_id).await {
                    Ok(groups) => {
                        let notified = hub.router.broadcast_presence(&event, &groups);
                        debug!(
                            user = %event.user_id,
                            state = ?event.state,
                            notified,
                            "Presence broadcast"
                        );
                    }
                    Err(e) => {
                        warn!(user = %event.user_id, error = %e, "Could not list groups for presence");
                    }
                }
            }
            debug!("Presence fan-out stopped");
        })
    }

    /// Hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let registry = self.registry.stats();
        let membership = self.membership.stats();
        HubStats {
            connection_count: registry.connection_count,
            online_users: registry.online_users,
            group_count: membership.group_count,
            total_subscriptions: membership.total_subscriptions,
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("registry", &self.registry)
            .field("membership", &self.membership)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Live connections.
    pub connection_count: usize,
    /// Users with at least one live connection.
    pub online_users: usize,
    /// Known groups.
    pub group_count: usize,
    /// Total group subscriptions.
    pub total_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthorizer;
    use crate::delivery::{ChannelSink, Delivery};
    use crate::presence::PresenceState;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn hub(auto_join: bool) -> (Arc<Hub>, Arc<ChannelSink>, Arc<StaticAuthorizer>) {
        let auth = Arc::new(
            StaticAuthorizer::new()
                .with_group("g1", ["alice", "bob"])
                .with_group("g2", ["alice", "bob"]),
        );
        let sink = Arc::new(ChannelSink::new(32));
        let config = HubConfig {
            auto_join,
            ..HubConfig::default()
        };
        let hub = Hub::with_config(auth.clone(), Arc::new(MemoryStore::new()), sink.clone(), config);
        (Arc::new(hub), sink, auth)
    }

    #[tokio::test]
    async fn test_auto_join_on_connect() {
        let (hub, _sink, _) = hub(true);
        let joined = hub.on_connect("conn-1".into(), "alice".into()).await.unwrap();
        assert_eq!(joined, vec![GroupId::from("g1"), GroupId::from("g2")]);
        assert!(hub.membership().is_subscribed(&"g2".into(), &"conn-1".into()));
        assert_eq!(hub.stats().total_subscriptions, 2);
    }

    #[tokio::test]
    async fn test_client_message_uses_connection_owner() {
        let (hub, sink, _) = hub(false);
        let mut rx = sink.register("conn-1".into());
        hub.on_connect("conn-1".into(), "alice".into()).await.unwrap();
        hub.on_join(&"conn-1".into(), &"g1".into()).await.unwrap();

        let receipt = hub
            .on_client_message_of_kind(&"conn-1".into(), &"g1".into(), MessageKind::Image, "cat.png")
            .await
            .unwrap();
        assert_eq!(receipt.sequence, 1);

        match rx.try_recv() {
            Ok(Delivery::Message(message)) => {
                assert_eq!(message.sender.as_str(), "alice");
                assert_eq!(message.source, Some(ConnectionId::from("conn-1")));
                assert_eq!(message.kind, MessageKind::Image);
            }
            other => panic!("expected a message, got {:?}", other),
        }

        let err = hub
            .on_client_message(&"ghost".into(), &"g1".into(), "boo")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownConnection(_)));
    }

    #[tokio::test]
    async fn test_clients_cannot_send_system_messages() {
        let (hub, sink, _) = hub(false);
        let mut rx = sink.register("conn-1".into());
        hub.on_connect("conn-1".into(), "alice".into()).await.unwrap();
        hub.on_join(&"conn-1".into(), &"g1".into()).await.unwrap();

        let err = hub
            .on_client_message_of_kind(
                &"conn-1".into(),
                &"g1".into(),
                MessageKind::System,
                "server is shutting down",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReservedKind(MessageKind::System)));
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.membership().last_sequence(&"g1".into()), 0);
    }

    #[tokio::test]
    async fn test_history_replays_missed_messages() {
        let (hub, _sink, _) = hub(true);
        hub.on_connect("conn-1".into(), "alice".into()).await.unwrap();
        for text in ["one", "two", "three"] {
            hub.on_client_message(&"conn-1".into(), &"g1".into(), text).await.unwrap();
        }

        let missed = hub.history(&"conn-1".into(), &"g1".into(), 1).await.unwrap();
        let contents: Vec<_> = missed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn test_membership_revoked_evicts() {
        let (hub, _sink, auth) = hub(true);
        hub.on_connect("conn-1".into(), "bob".into()).await.unwrap();

        auth.revoke(&"g1".into(), &"bob".into());
        assert_eq!(hub.membership_revoked(&"g1".into(), &"bob".into()), 1);
        assert!(!hub.membership().is_subscribed(&"g1".into(), &"conn-1".into()));

        let err = hub.on_join(&"conn-1".into(), &"g1".into()).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthorized { .. }));
    }

    #[tokio::test]
    async fn test_presence_fanout_notifies_group_members() {
        let (hub, sink, _) = hub(true);
        let _fanout = hub.spawn_presence_fanout();

        let mut rx_bob = sink.register("conn-b".into());
        hub.on_connect("conn-b".into(), "bob".into()).await.unwrap();

        hub.on_connect("conn-a".into(), "alice".into()).await.unwrap();
        hub.on_disconnect(&"conn-a".into());

        let mut states = Vec::new();
        while states.len() < 4 {
            let delivery = tokio::time::timeout(Duration::from_secs(1), rx_bob.recv())
                .await
                .expect("presence delivery")
                .expect("queue open");
            if let Delivery::Presence { event, .. } = delivery {
                assert_eq!(event.user_id.as_str(), "alice");
                states.push(event.state);
            }
        }
        // One notification per shared group, per transition.
        assert_eq!(
            states,
            vec![
                PresenceState::Online,
                PresenceState::Online,
                PresenceState::Offline,
                PresenceState::Offline
            ]
        );
    }
}
