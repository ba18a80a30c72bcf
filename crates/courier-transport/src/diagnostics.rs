//! Diagnostics boundary.
//!
//! The core reports what it does through an injected [`Diagnostics`]
//! collaborator: informational lines, outbound requests, matched responses,
//! unsolicited events, and errors. Where those records end up is up to the
//! collaborator. [`TracingDiagnostics`] forwards them to `tracing`;
//! [`MemoryDiagnostics`] additionally keeps a bounded history that the
//! transport facade exposes through `get_logs`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use courier_protocol::Message;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

/// Collaborator receiving structured diagnostic calls from a binding.
pub trait Diagnostics: Send + Sync + 'static {
    fn info(&self, prefix: &str, text: &str);
    fn request(&self, prefix: &str, name: &str, message: &Message);
    fn response(&self, prefix: &str, name: &str, message: &Message);
    fn event(&self, prefix: &str, name: &str, message: &Message);
    fn error(&self, prefix: &str, text: &str);

    /// Retained history, oldest first. Collaborators that keep nothing
    /// return an empty list.
    fn logs(&self) -> Vec<LogEntry> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Request,
    Response,
    Event,
    Error,
}

/// One retained diagnostic record.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracing
// ─────────────────────────────────────────────────────────────────────────────

/// Forwards every call to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

fn id_of(message: &Message) -> &str {
    message.id().map(|id| id.as_str()).unwrap_or("-")
}

impl Diagnostics for TracingDiagnostics {
    fn info(&self, prefix: &str, text: &str) {
        info!("[{prefix}] {text}");
    }

    fn request(&self, prefix: &str, name: &str, message: &Message) {
        debug!(id = id_of(message), kind = message.kind, "[{prefix}] -> {name}");
    }

    fn response(&self, prefix: &str, name: &str, message: &Message) {
        debug!(id = id_of(message), kind = message.kind, "[{prefix}] <- {name}");
    }

    fn event(&self, prefix: &str, name: &str, message: &Message) {
        debug!(id = id_of(message), kind = message.kind, "[{prefix}] <> {name}");
    }

    fn error(&self, prefix: &str, text: &str) {
        error!("[{prefix}] {text}");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory history
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Bounded history of diagnostic records. Oldest records are evicted first.
#[derive(Debug)]
pub struct MemoryDiagnostics {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn push(
        &self,
        level: LogLevel,
        prefix: &str,
        name: Option<&str>,
        text: Option<&str>,
        message: Option<&Message>,
    ) {
        let entry = LogEntry {
            at: Utc::now(),
            level,
            prefix: prefix.to_string(),
            name: name.map(str::to_string),
            text: text.map(str::to_string),
            message: message.cloned(),
        };
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

impl Default for MemoryDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics for MemoryDiagnostics {
    fn info(&self, prefix: &str, text: &str) {
        TracingDiagnostics.info(prefix, text);
        self.push(LogLevel::Info, prefix, None, Some(text), None);
    }

    fn request(&self, prefix: &str, name: &str, message: &Message) {
        TracingDiagnostics.request(prefix, name, message);
        self.push(LogLevel::Request, prefix, Some(name), None, Some(message));
    }

    fn response(&self, prefix: &str, name: &str, message: &Message) {
        TracingDiagnostics.response(prefix, name, message);
        self.push(LogLevel::Response, prefix, Some(name), None, Some(message));
    }

    fn event(&self, prefix: &str, name: &str, message: &Message) {
        TracingDiagnostics.event(prefix, name, message);
        self.push(LogLevel::Event, prefix, Some(name), None, Some(message));
    }

    fn error(&self, prefix: &str, text: &str) {
        TracingDiagnostics.error(prefix, text);
        self.push(LogLevel::Error, prefix, None, Some(text), None);
    }

    fn logs(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}
