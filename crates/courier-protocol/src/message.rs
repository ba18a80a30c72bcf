//! Message envelope and correlation identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical payload type of a message. Opaque to the transport core; used
/// only for routing decisions made by callers and for diagnostics.
pub type MessageKind = u32;

/// HTTP header carrying the correlation id of a request-per-call exchange.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Identifier attached to a request and echoed by its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh UUID v4 identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single unit exchanged over a channel, in either direction.
///
/// Outbound requests may leave `correlation_id` empty and have one
/// generated at send time. Inbound messages without an id can only ever
/// be classified as events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "clientMsgId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(rename = "payloadType")]
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper constructors
// ─────────────────────────────────────────────────────────────────────────────

impl Message {
    pub fn new(kind: MessageKind, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: None,
            kind,
            payload,
        }
    }

    pub fn with_id(
        id: impl Into<CorrelationId>,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id: Some(id.into()),
            kind,
            payload,
        }
    }

    /// Build a reply to this message: same correlation id, new kind and payload.
    pub fn reply(&self, kind: MessageKind, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            kind,
            payload,
        }
    }

    pub fn id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// Whether this message carries the given correlation id.
    pub fn answers(&self, id: &CorrelationId) -> bool {
        self.correlation_id.as_ref() == Some(id)
    }
}
