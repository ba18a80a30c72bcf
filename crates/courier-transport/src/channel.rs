//! The transport-independent core owned by every binding.
//!
//! A binding drives its physical transport and hands every inbound item to
//! its [`Channel`], which classifies it, logs it, and fans it out. The
//! channel also owns the binding's connection state and its stream of
//! channel-level faults.

use std::fmt;
use std::sync::Arc;

use courier_protocol::{ConnectionState, Message, MessageKind, TransportError};
use tokio::sync::broadcast;

use crate::demux::{Demultiplexer, Route};
use crate::diagnostics::{Diagnostics, TracingDiagnostics};
use crate::registry::CorrelationRegistry;
use crate::state::{StateCell, StateSubscription};

/// Maps a message kind to a human-readable name for diagnostics.
pub type KindNamer = Arc<dyn Fn(MessageKind) -> String + Send + Sync>;

pub const DEFAULT_CAPACITY: usize = 1024;

/// Options shared by every binding.
#[derive(Clone)]
pub struct ChannelOptions {
    /// Prefix attached to every diagnostic line
    pub prefix: String,
    /// Buffer size of the responses, events, and faults streams
    pub capacity: usize,
    /// Diagnostics collaborator
    pub diagnostics: Arc<dyn Diagnostics>,
    /// Kind-to-name mapping used in diagnostics
    pub namer: KindNamer,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            prefix: "courier".into(),
            capacity: DEFAULT_CAPACITY,
            diagnostics: Arc::new(TracingDiagnostics),
            namer: Arc::new(|kind: MessageKind| kind.to_string()),
        }
    }
}

impl ChannelOptions {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_namer(
        mut self,
        namer: impl Fn(MessageKind) -> String + Send + Sync + 'static,
    ) -> Self {
        self.namer = Arc::new(namer);
        self
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("prefix", &self.prefix)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

pub struct Channel {
    registry: CorrelationRegistry,
    state: StateCell,
    demux: Demultiplexer,
    faults: broadcast::Sender<TransportError>,
    diagnostics: Arc<dyn Diagnostics>,
    prefix: String,
    namer: KindNamer,
}

impl Channel {
    pub fn new(options: ChannelOptions) -> Self {
        let registry = CorrelationRegistry::new();
        let (faults, _) = broadcast::channel(options.capacity.max(1));
        Self {
            demux: Demultiplexer::new(registry.clone(), options.capacity),
            registry,
            state: StateCell::new(),
            faults,
            diagnostics: options.diagnostics,
            prefix: options.prefix,
            namer: options.namer,
        }
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    pub fn demux(&self) -> &Demultiplexer {
        &self.demux
    }

    pub fn diagnostics(&self) -> &Arc<dyn Diagnostics> {
        &self.diagnostics
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn name_of(&self, kind: MessageKind) -> String {
        (self.namer)(kind)
    }

    // ── State ───────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn publish_state(&self, state: ConnectionState) -> bool {
        self.state.publish(state)
    }

    pub fn subscribe_state(&self) -> StateSubscription {
        self.state.subscribe()
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Classify, log, and fan out one inbound message.
    pub fn deliver(&self, message: Message) -> Route {
        let route = self.demux.classify(&message);
        let name = self.name_of(message.kind);
        match route {
            Route::Response => self.diagnostics.response(&self.prefix, &name, &message),
            Route::Event => self.diagnostics.event(&self.prefix, &name, &message),
        }
        self.demux.emit(route, message);
        route
    }

    /// Report an inbound item that could not be decoded. The item is dropped.
    pub fn reject(&self, reason: impl fmt::Display) {
        let err = TransportError::invalid(reason.to_string());
        self.diagnostics
            .error(&self.prefix, &format!("{}: {err}", err.code()));
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Log an outbound message as a request when its id is pending, as an
    /// event otherwise.
    pub fn log_outbound(&self, message: &Message) {
        let name = self.name_of(message.kind);
        let pending = message.id().is_some_and(|id| self.registry.is_pending(id));
        if pending {
            self.diagnostics.request(&self.prefix, &name, message);
        } else {
            self.diagnostics.event(&self.prefix, &name, message);
        }
    }

    // ── Faults ──────────────────────────────────────────────────────────

    pub fn info(&self, text: &str) {
        self.diagnostics.info(&self.prefix, text);
    }

    /// Log a channel-level error and publish it to fault subscribers.
    pub fn fault(&self, err: TransportError) {
        self.diagnostics
            .error(&self.prefix, &format!("{}: {err}", err.code()));
        let _ = self.faults.send(err);
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<TransportError> {
        self.faults.subscribe()
    }

    pub fn subscribe_responses(&self) -> broadcast::Receiver<Message> {
        self.demux.subscribe_responses()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Message> {
        self.demux.subscribe_events()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("prefix", &self.prefix)
            .field("state", &self.state.get())
            .field("pending", &self.registry.len())
            .finish_non_exhaustive()
    }
}
