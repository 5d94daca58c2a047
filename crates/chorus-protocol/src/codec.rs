//! Codec for encoding and decoding Chorus frames.
//!
//! This module provides MessagePack-based serialization with length-prefixed framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Default maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Trailing bytes after a complete frame.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to bytes with the default size limit.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    FrameCodec::default().encode(frame)
}

/// Decode one whole frame from bytes with the default size limit.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    FrameCodec::default().decode(data)
}

/// Codec with a configurable frame size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec that rejects payloads above `max_frame_size` bytes.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// The payload size limit.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        Ok(())
    }

    /// Encode a frame to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or encoding fails.
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode a frame into an existing buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or encoding fails.
    pub fn encode_into(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = rmp_serde::to_vec_named(frame)?;
        self.check_size(payload.len())?;

        buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(())
    }

    /// Decode a buffer holding exactly one frame, as in a WebSocket message.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is incomplete, too large, has trailing
    /// bytes, or is invalid.
    pub fn decode(&self, data: &[u8]) -> Result<Frame, ProtocolError> {
        if data.len() < LENGTH_PREFIX_SIZE {
            return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
        }

        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        self.check_size(length)?;

        let total_size = LENGTH_PREFIX_SIZE + length;
        if data.len() < total_size {
            return Err(ProtocolError::Incomplete(total_size - data.len()));
        }
        if data.len() > total_size {
            return Err(ProtocolError::Invalid(format!(
                "{} trailing bytes",
                data.len() - total_size
            )));
        }

        let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
        Ok(frame)
    }

    /// Try to decode a frame from a stream buffer, advancing it if successful.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol error.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or invalid.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        self.check_size(length)?;

        let total_size = LENGTH_PREFIX_SIZE + length;
        if buf.len() < total_size {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        let payload = buf.split_to(length);
        let frame = rmp_serde::from_slice(&payload)?;

        Ok(Some(frame))
    }
}
