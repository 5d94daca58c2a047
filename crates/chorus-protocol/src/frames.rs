//! Frame types for the Chorus protocol.
//!
//! Frames are the unit of communication between chat clients and the server.
//! Each frame is serialized using MessagePack.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Join = 0x03,
    Leave = 0x04,
    Send = 0x05,
    Sent = 0x06,
    Message = 0x07,
    Presence = 0x08,
    Typing = 0x09,
    History = 0x0A,
    Ack = 0x0B,
    Error = 0x0C,
    Ping = 0x0D,
    Pong = 0x0E,
    Read = 0x0F,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Join),
            0x04 => Ok(FrameType::Leave),
            0x05 => Ok(FrameType::Send),
            0x06 => Ok(FrameType::Sent),
            0x07 => Ok(FrameType::Message),
            0x08 => Ok(FrameType::Presence),
            0x09 => Ok(FrameType::Typing),
            0x0A => Ok(FrameType::History),
            0x0B => Ok(FrameType::Ack),
            0x0C => Ok(FrameType::Error),
            0x0D => Ok(FrameType::Ping),
            0x0E => Ok(FrameType::Pong),
            0x0F => Ok(FrameType::Read),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Online state carried by presence frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PresenceStatus {
    /// The user has no live connection.
    Offline = 0,
    /// The user has at least one live connection.
    Online = 1,
}

impl From<PresenceStatus> for u8 {
    fn from(ps: PresenceStatus) -> u8 {
        ps as u8
    }
}

impl TryFrom<u8> for PresenceStatus {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceStatus::Offline),
            1 => Ok(PresenceStatus::Online),
            _ => Err("Invalid presence status"),
        }
    }
}

/// Content kinds on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Text,
    Image,
    File,
    System,
}

/// A protocol frame.
///
/// Requests from the client carry an `id` echoed by the matching
/// `Ack`, `Sent` or `Error` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial handshake. Must be the first client frame.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol major version.
        version: u8,
        /// User the connection acts for.
        user: String,
        /// Opaque credential for an authenticating proxy in front of the
        /// server. The server itself does not read it.
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Join a group.
    #[serde(rename = "join")]
    Join { id: u64, group: String },

    /// Leave a group.
    #[serde(rename = "leave")]
    Leave { id: u64, group: String },

    /// Send a message to a group.
    #[serde(rename = "send")]
    Send {
        id: u64,
        group: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ContentKind>,
    },

    /// A `Send` was accepted and sequenced.
    #[serde(rename = "sent")]
    Sent {
        id: u64,
        message_id: u64,
        sequence: u64,
    },

    /// A message delivered to a group subscriber.
    #[serde(rename = "message")]
    Message {
        message_id: u64,
        group: String,
        sender: String,
        sequence: u64,
        kind: ContentKind,
        content: String,
        /// Milliseconds since the Unix epoch.
        timestamp: u64,
    },

    /// A group member went online or offline.
    #[serde(rename = "presence")]
    Presence {
        group: String,
        user: String,
        state: PresenceStatus,
        timestamp: u64,
    },

    /// Typing indicator. Sent by clients without `user`; the server fills it in.
    #[serde(rename = "typing")]
    Typing {
        group: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        active: bool,
    },

    /// Read receipt: everything in `group` up to `sequence` has been read.
    /// Sent by clients without `user`; the server fills it in.
    #[serde(rename = "read")]
    Read {
        group: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        sequence: u64,
    },

    /// Request the messages of a group after `since`.
    ///
    /// Answered by `Message` frames followed by an `Ack`.
    #[serde(rename = "history")]
    History { id: u64, group: String, since: u64 },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// Malformed or unexpected frame.
    pub const BAD_FRAME: u16 = 1000;
    /// First frame was not `Connect`.
    pub const HANDSHAKE_REQUIRED: u16 = 1001;
    /// Incompatible protocol version.
    pub const UNSUPPORTED_VERSION: u16 = 1002;
    /// Connection id already registered.
    pub const DUPLICATE_CONNECTION: u16 = 1003;
    /// Server connection limit reached.
    pub const TOO_MANY_CONNECTIONS: u16 = 1004;
    /// User is not a member of the group.
    pub const NOT_AUTHORIZED: u16 = 2000;
    /// Group id failed validation.
    pub const INVALID_GROUP: u16 = 2001;
    /// Connection has not joined the group.
    pub const NOT_SUBSCRIBED: u16 = 2002;
    /// Per-connection group limit reached.
    pub const TOO_MANY_GROUPS: u16 = 2003;
    /// Message content exceeds the size limit.
    pub const CONTENT_TOO_LARGE: u16 = 2004;
    /// Authorization or storage backend failed.
    pub const UNAVAILABLE: u16 = 3000;
    /// Anything else.
    pub const INTERNAL: u16 = 3001;
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Join { .. } => FrameType::Join,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Send { .. } => FrameType::Send,
            Frame::Sent { .. } => FrameType::Sent,
            Frame::Message { .. } => FrameType::Message,
            Frame::Presence { .. } => FrameType::Presence,
            Frame::Typing { .. } => FrameType::Typing,
            Frame::Read { .. } => FrameType::Read,
            Frame::History { .. } => FrameType::History,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Request id of a client request, if the frame carries one.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Join { id, .. }
            | Frame::Leave { id, .. }
            | Frame::Send { id, .. }
            | Frame::History { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, user: impl Into<String>, token: Option<String>) -> Self {
        Frame::Connect {
            version,
            user: user.into(),
            token,
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(id: u64, group: impl Into<String>) -> Self {
        Frame::Join {
            id,
            group: group.into(),
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(id: u64, group: impl Into<String>) -> Self {
        Frame::Leave {
            id,
            group: group.into(),
        }
    }

    /// Create a new text Send frame.
    #[must_use]
    pub fn send(id: u64, group: impl Into<String>, content: impl Into<String>) -> Self {
        Frame::Send {
            id,
            group: group.into(),
            content: content.into(),
            kind: None,
        }
    }

    /// Create a new Sent frame.
    #[must_use]
    pub fn sent(id: u64, message_id: u64, sequence: u64) -> Self {
        Frame::Sent {
            id,
            message_id,
            sequence,
        }
    }

    /// Create a new client Typing frame.
    #[must_use]
    pub fn typing(group: impl Into<String>, active: bool) -> Self {
        Frame::Typing {
            group: group.into(),
            user: None,
            active,
        }
    }

    /// Create a new client Read frame.
    #[must_use]
    pub fn read(group: impl Into<String>, sequence: u64) -> Self {
        Frame::Read {
            group: group.into(),
            user: None,
            sequence,
        }
    }

    /// Create a new History frame.
    #[must_use]
    pub fn history(id: u64, group: impl Into<String>, since: u64) -> Self {
        Frame::History {
            id,
            group: group.into(),
            since,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Ping frame with timestamp.
    #[must_use]
    pub fn ping_with_timestamp(timestamp: u64) -> Self {
        Frame::Ping {
            timestamp: Some(timestamp),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        assert_eq!(Frame::join(1, "lobby").frame_type(), FrameType::Join);
        assert_eq!(Frame::send(2, "lobby", "hi").frame_type(), FrameType::Send);
        assert_eq!(FrameType::try_from(0x0A), Ok(FrameType::History));
        assert_eq!(Frame::read("lobby", 3).frame_type(), FrameType::Read);
        assert_eq!(FrameType::try_from(0x0F), Ok(FrameType::Read));
        assert!(FrameType::try_from(0x10).is_err());
    }

    #[test]
    fn test_request_id() {
        assert_eq!(Frame::send(7, "lobby", "hi").request_id(), Some(7));
        assert_eq!(Frame::history(8, "lobby", 0).request_id(), Some(8));
        assert_eq!(Frame::typing("lobby", true).request_id(), None);
        assert_eq!(Frame::read("lobby", 4).request_id(), None);
    }

    #[test]
    fn test_presence_status_conversion() {
        assert_eq!(PresenceStatus::try_from(0), Ok(PresenceStatus::Offline));
        assert_eq!(PresenceStatus::try_from(1), Ok(PresenceStatus::Online));
        assert!(PresenceStatus::try_from(2).is_err());
    }
}
