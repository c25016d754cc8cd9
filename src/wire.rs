//! # Wire Frame Codec
//!
//! A single frame shape is used on every TCP link in the system — data
//! messages between nodes and coordinator-pushed control messages alike:
//!
//! ```text
//! u16 topic_len (BE) | topic | u16 type_len (BE) | type | u32 payload_len (BE) | payload
//! ```
//!
//! Decoding is streaming: [`FrameDecoder`] accumulates bytes from the
//! socket and yields complete frames, leaving partial trailing bytes in
//! place for the next read. A frame whose length fields imply more bytes
//! than are buffered simply waits for more input; a malformed frame
//! (empty topic, over-cap length) is a [`WireError`] and the connection
//! carrying it is closed by the caller.

use thiserror::Error;

/// Message type name that marks a frame as a coordinator control frame.
pub const TARGETS_UPDATE_TYPE: &str = "TopicTargetsUpdate";

/// Upper bound on a single payload. Frames claiming more are rejected
/// before any allocation happens.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Fixed header overhead: two u16 length fields plus one u32.
pub const FRAME_OVERHEAD: usize = 2 + 2 + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame has zero-length topic")]
    EmptyTopic,
    #[error("frame payload of {0} bytes exceeds cap of {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(u32),
    #[error("topic bytes are not valid UTF-8")]
    TopicNotUtf8,
    #[error("message type bytes are not valid UTF-8")]
    TypeNotUtf8,
}

/// One decoded frame: topic, fully-qualified message type name, and the
/// opaque payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub topic: String,
    pub msg_type: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(topic: impl Into<String>, msg_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            msg_type: msg_type.into(),
            payload,
        }
    }

    /// True for frames carrying a coordinator targets delta.
    pub fn is_targets_update(&self) -> bool {
        self.msg_type == TARGETS_UPDATE_TYPE
    }

    /// Serialize this frame into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(FRAME_OVERHEAD + self.topic.len() + self.msg_type.len() + self.payload.len());
        buf.extend_from_slice(&(self.topic.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.topic.as_bytes());
        buf.extend_from_slice(&(self.msg_type.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.msg_type.as_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Incremental decoder over a growing byte buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode the next complete frame. `Ok(None)` means more bytes
    /// are needed; consumed bytes are removed from the buffer only when a
    /// whole frame was available.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, WireError> {
        let buf = &self.buf;
        if buf.len() < 2 {
            return Ok(None);
        }
        let topic_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if topic_len == 0 {
            return Err(WireError::EmptyTopic);
        }

        let mut at = 2;
        if buf.len() < at + topic_len + 2 {
            return Ok(None);
        }
        let topic_bytes = &buf[at..at + topic_len];
        at += topic_len;

        let type_len = u16::from_be_bytes([buf[at], buf[at + 1]]) as usize;
        at += 2;
        if buf.len() < at + type_len + 4 {
            return Ok(None);
        }
        let type_bytes = &buf[at..at + type_len];
        at += type_len;

        let payload_len = u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(payload_len));
        }
        at += 4;
        if buf.len() < at + payload_len as usize {
            return Ok(None);
        }

        let topic = std::str::from_utf8(topic_bytes)
            .map_err(|_| WireError::TopicNotUtf8)?
            .to_owned();
        let msg_type = std::str::from_utf8(type_bytes)
            .map_err(|_| WireError::TypeNotUtf8)?
            .to_owned();
        let payload = buf[at..at + payload_len as usize].to_vec();
        at += payload_len as usize;

        self.buf.drain(..at);
        Ok(Some(Frame {
            topic,
            msg_type,
            payload,
        }))
    }
}
