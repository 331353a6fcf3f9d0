use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sockrelay_transport::Message;

use crate::error::{FrameError, Result};
use crate::packet::{JobResult, WorkPacket};

/// WebSocket op-code of an application frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    /// UTF-8 text frame. Used for all payloads this system originates.
    #[default]
    Text,
    /// Binary frame.
    Binary,
}

/// An application frame: op-code plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The op-code the payload travelled with.
    pub kind: FrameKind,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Build a frame from a received message.
    pub fn from_message(message: Message) -> Result<Self> {
        match message {
            Message::Text(text) => Ok(Self::new(FrameKind::Text, text.into_bytes())),
            Message::Binary(data) => Ok(Self::new(FrameKind::Binary, data)),
            _ => Err(FrameError::UnexpectedControl),
        }
    }

    /// Convert into a message ready for sending with the same op-code.
    pub fn into_message(self) -> Result<Message> {
        match self.kind {
            FrameKind::Text => {
                let text = String::from_utf8(self.payload.to_vec())
                    .map_err(|_| FrameError::InvalidUtf8)?;
                Ok(Message::Text(text))
            }
            FrameKind::Binary => Ok(Message::Binary(self.payload.to_vec())),
        }
    }
}

/// Encode a work packet as a frame of the given kind.
pub fn encode_packet(packet: &WorkPacket, kind: FrameKind) -> Result<Frame> {
    encode_json(packet, kind)
}

/// Decode a work packet from a frame of either kind.
pub fn decode_packet(frame: &Frame) -> Result<WorkPacket> {
    decode_json(frame)
}

/// Encode a job result as a frame of the given kind.
pub fn encode_result(result: &JobResult, kind: FrameKind) -> Result<Frame> {
    encode_json(result, kind)
}

/// Decode a job result from a frame of either kind.
pub fn decode_result(frame: &Frame) -> Result<JobResult> {
    decode_json(frame)
}

fn encode_json<T: Serialize>(value: &T, kind: FrameKind) -> Result<Frame> {
    let payload = serde_json::to_vec(value).map_err(FrameError::Encode)?;
    Ok(Frame::new(kind, payload))
}

fn decode_json<T: DeserializeOwned>(frame: &Frame) -> Result<T> {
    serde_json::from_slice(frame.payload.as_ref()).map_err(FrameError::Decode)
}
