//! Directional tagging for cross-context message buses.
//!
//! When a host and an embedded client share one underlying bus, each side
//! tags what it sends with its own direction and only accepts envelopes
//! tagged with the opposite one. Without this, every message would echo
//! back into its sender.

use serde::{Deserialize, Serialize};

/// Logical direction of an envelope on a shared bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by an embedded client towards its host.
    #[serde(rename = "message-to-host")]
    ToHost,
    /// Sent by the host towards an embedded client.
    #[serde(rename = "message-from-host")]
    FromHost,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Self::ToHost => Self::FromHost,
            Self::FromHost => Self::ToHost,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToHost => "message-to-host",
            Self::FromHost => "message-from-host",
        }
    }
}

/// The unit carried by a shared bus: a direction tag plus untyped data.
///
/// `data` stays untyped so a receiving binding can report undecodable
/// items instead of failing the whole bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub direction: Direction,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(direction: Direction, data: serde_json::Value) -> Self {
        Self { direction, data }
    }
}
