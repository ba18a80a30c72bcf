//! Demultiplexer: splits inbound traffic into responses and events.
//!
//! An inbound message whose correlation id is pending in the registry is a
//! response; anything else (unknown id, no id) is an event. The
//! demultiplexer never removes ids from the registry: the dispatcher that
//! registered an id is the only one allowed to drop it, otherwise a reply and
//! a disconnect could both try to complete the same request.

use courier_protocol::Message;
use tokio::sync::broadcast;

use crate::registry::CorrelationRegistry;

/// Where an inbound message was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Response,
    Event,
}

#[derive(Debug)]
pub struct Demultiplexer {
    registry: CorrelationRegistry,
    responses: broadcast::Sender<Message>,
    events: broadcast::Sender<Message>,
}

impl Demultiplexer {
    pub fn new(registry: CorrelationRegistry, capacity: usize) -> Self {
        let (responses, _) = broadcast::channel(capacity.max(1));
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            registry,
            responses,
            events,
        }
    }

    pub fn classify(&self, message: &Message) -> Route {
        match message.id() {
            Some(id) if self.registry.is_pending(id) => Route::Response,
            _ => Route::Event,
        }
    }

    /// Emit an already classified message on its stream. Having no
    /// subscribers is not an error.
    pub fn emit(&self, route: Route, message: Message) {
        let tx = match route {
            Route::Response => &self.responses,
            Route::Event => &self.events,
        };
        let _ = tx.send(message);
    }

    /// Classify and emit in one step.
    pub fn route(&self, message: Message) -> Route {
        let route = self.classify(&message);
        self.emit(route, message);
        route
    }

    pub fn subscribe_responses(&self) -> broadcast::Receiver<Message> {
        self.responses.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Message> {
        self.events.subscribe()
    }
}
