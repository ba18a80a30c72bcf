//! Pluggable wire codec.

use bytes::Bytes;
use thiserror::Error;

use crate::message::Message;

/// A single frame as it travels over a stream transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for WireFrame {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for WireFrame {
    fn from(value: Bytes) -> Self {
        Self::Binary(value)
    }
}

#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(String),
    #[error("Failed to decode frame: {0}")]
    Decode(String),
}

/// Converts messages to and from wire frames.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, message: &Message) -> Result<WireFrame, CodecError>;
    fn decode(&self, frame: &WireFrame) -> Result<Message, CodecError>;
}

/// JSON codec: encodes as text frames, decodes text or binary frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<WireFrame, CodecError> {
        serde_json::to_string(message)
            .map(WireFrame::Text)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, frame: &WireFrame) -> Result<Message, CodecError> {
        serde_json::from_slice(frame.as_bytes()).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
