//! # chorus-core
//!
//! Presence-aware group messaging core for the Chorus chat server.
//!
//! This crate provides the building blocks, independent of any transport:
//!
//! - **ConnectionRegistry** - Connection to user mapping
//! - **GroupMembership** - Which connections have joined which groups
//! - **PresenceTracker** - Online/offline state per user
//! - **MessageRouter** - Sequenced fan-out of messages to groups
//! - **EventBus** - Synchronous typed pub/sub inside the process
//! - **Hub** - The entry point a transport drives
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│     Hub     │────▶│  Registry   │──▶ Presence
//! └─────────────┘     └─────────────┘     └─────────────┘       │
//!        ▲                   │                                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐  ┌──────────┐
//!        └────────────│   Router    │────▶│ Membership  │  │ EventBus │
//!       DeliverySink  └─────────────┘     └─────────────┘  └──────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use chorus_core::{ChannelSink, Delivery, Hub, MemoryStore, StaticAuthorizer};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), chorus_core::Error> {
//! let auth = Arc::new(StaticAuthorizer::new().with_group("lobby", ["alice"]));
//! let sink = Arc::new(ChannelSink::new(16));
//! let hub = Hub::new(auth, Arc::new(MemoryStore::new()), sink.clone());
//!
//! let mut rx = sink.register("conn-1".into());
//! hub.on_connect("conn-1".into(), "alice".into()).await?;
//! let receipt = hub.on_client_message(&"conn-1".into(), &"lobby".into(), "hello").await?;
//! assert_eq!(receipt.sequence, 1);
//! assert!(matches!(rx.try_recv(), Ok(Delivery::Message(_))));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod delivery;
pub mod error;
pub mod events;
pub mod hub;
pub mod ids;
pub mod membership;
pub mod message;
pub mod presence;
pub mod registry;
pub mod router;
pub mod store;

pub use auth::{Authorizer, StaticAuthorizer};
pub use delivery::{ChannelSink, Delivery, DeliveryError, DeliverySink};
pub use error::{AuthorizationError, Error, Result};
pub use events::{EventBus, HandlerError, HandlerResult, PublishReport, SubscriptionId};
pub use hub::{Hub, HubConfig, HubStats};
pub use ids::{ConnectionId, GroupId, UserId};
pub use membership::GroupMembership;
pub use message::{Message, MessageId, MessageKind, MessageReceipt, Sequence};
pub use presence::{PresenceEvent, PresenceState, PresenceTracker};
pub use registry::{ConnectionInfo, ConnectionRegistry, DisconnectedConnection};
pub use router::{MessageRouted, MessageRouter, RouterConfig};
pub use store::{MemoryStore, MessageStore, StoreError};
