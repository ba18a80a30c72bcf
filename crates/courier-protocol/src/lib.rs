//! Courier - Protocol Types
//!
//! Transport-agnostic message types shared by every channel binding.
//! This crate is the single source of truth for the message shape,
//! the wire codec contract, the connection lifecycle states, and the
//! error taxonomy surfaced to callers.

pub mod codec;
pub mod direction;
pub mod error;
pub mod message;
pub mod state;

pub use codec::{Codec, CodecError, JsonCodec, WireFrame};
pub use direction::{Direction, Envelope};
pub use error::{ErrorCode, Result, TransportError};
pub use message::{CORRELATION_HEADER, CorrelationId, Message, MessageKind};
pub use state::ConnectionState;
