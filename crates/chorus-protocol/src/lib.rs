//! # chorus-protocol
//!
//! Wire protocol definitions for the Chorus chat server.
//!
//! This crate defines the binary protocol used between chat clients and
//! the server: frame types, the length-prefixed codec, and versioning.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake
//! - `Join` / `Leave` - Group membership
//! - `Send` / `Sent` / `Message` - Group messages
//! - `Presence` / `Typing` - Ephemeral notifications
//! - `History` - Replay of missed messages
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use chorus_protocol::{Frame, codec};
//!
//! let frame = Frame::send(1, "lobby", "Hello, world!");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, FrameCodec, ProtocolError};
pub use frames::{codes, ContentKind, Frame, FrameType, PresenceStatus};
pub use version::{Version, PROTOCOL_VERSION};
