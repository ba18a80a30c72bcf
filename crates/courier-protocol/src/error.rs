//! Transport error taxonomy and stable error codes.

use thiserror::Error;

use crate::message::{CorrelationId, Message, MessageKind};

/// Stable, string-named error codes surfaced in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    TransmissionFailure,
    ClosedConnection,
    TimeoutReached,
    SocketError,
    ChannelError,
    InvalidMessage,
    ApplicationError,
    DuplicateCorrelationId,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransmissionFailure => "TransmissionFailure",
            Self::ClosedConnection => "ClosedConnection",
            Self::TimeoutReached => "TimeoutReached",
            Self::SocketError => "SocketError",
            Self::ChannelError => "ChannelError",
            Self::InvalidMessage => "InvalidMessage",
            Self::ApplicationError => "ApplicationError",
            Self::DuplicateCorrelationId => "DuplicateCorrelationId",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let code = match name {
            "TransmissionFailure" => Self::TransmissionFailure,
            "ClosedConnection" => Self::ClosedConnection,
            "TimeoutReached" => Self::TimeoutReached,
            "SocketError" => Self::SocketError,
            "ChannelError" => Self::ChannelError,
            "InvalidMessage" => Self::InvalidMessage,
            "ApplicationError" => Self::ApplicationError,
            "DuplicateCorrelationId" => Self::DuplicateCorrelationId,
            _ => return None,
        };
        Some(code)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by bindings, the dispatcher, and the transport facade.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The send primitive itself failed.
    #[error("Transmission failed: {0}")]
    TransmissionFailure(String),

    /// The channel disconnected while a request was outstanding.
    #[error("Message {kind} was not sent. Connection is closed")]
    ClosedConnection { kind: MessageKind },

    /// The handshake did not complete in time.
    #[error("Handshake timeout has been reached")]
    TimeoutReached,

    /// Abnormal socket termination.
    #[error("Socket error (code {code:?}): {reason}")]
    SocketError { code: Option<u16>, reason: String },

    /// Abnormal termination of a non-socket channel.
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// An inbound item could not be decoded or classified.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The peer replied, but the reply represents a domain-level failure.
    #[error("Application error in reply of kind {}", .0.kind)]
    ApplicationError(Box<Message>),

    /// A caller-supplied correlation id is already awaiting a reply.
    #[error("Correlation id {0} is already pending")]
    DuplicateCorrelationId(CorrelationId),
}

impl TransportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TransmissionFailure(_) => ErrorCode::TransmissionFailure,
            Self::ClosedConnection { .. } => ErrorCode::ClosedConnection,
            Self::TimeoutReached => ErrorCode::TimeoutReached,
            Self::SocketError { .. } => ErrorCode::SocketError,
            Self::ChannelError(_) => ErrorCode::ChannelError,
            Self::InvalidMessage(_) => ErrorCode::InvalidMessage,
            Self::ApplicationError(_) => ErrorCode::ApplicationError,
            Self::DuplicateCorrelationId(_) => ErrorCode::DuplicateCorrelationId,
        }
    }

    pub fn transmission(message: impl Into<String>) -> Self {
        Self::TransmissionFailure(message.into())
    }

    pub fn closed(kind: MessageKind) -> Self {
        Self::ClosedConnection { kind }
    }

    pub fn socket(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::SocketError {
            code,
            reason: reason.into(),
        }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::ChannelError(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidMessage(message.into())
    }

    /// The reply carried by an `ApplicationError`, if any.
    pub fn reply(&self) -> Option<&Message> {
        match self {
            Self::ApplicationError(message) => Some(message),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
