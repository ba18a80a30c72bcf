//! Cross-context binding over a shared, in-process message bus.
//!
//! Models the host/embedded-client bridge: both sides publish onto one bus,
//! each tagging envelopes with its own [`Direction`] and accepting only the
//! opposite one.

use std::sync::Arc;

use courier_protocol::{ConnectionState, Direction, Envelope, Message, Result, TransportError};
use tokio::sync::{broadcast, oneshot};
use tracing::warn;

use crate::binding::ChannelBinding;
use crate::channel::{Channel, ChannelOptions};
use crate::lifecycle::{ConnectionSlot, join_attempt};

pub const BUS_CAPACITY: usize = 1024;

/// A shared bus carrying envelopes in both directions. Clones share the bus.
#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<Envelope>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an envelope. Returns `false` when nobody is listening.
    pub fn publish(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct PostConfig {
    /// Direction this side sends in
    pub direction: Direction,
    pub options: ChannelOptions,
}

impl PostConfig {
    /// Embedded-client side: sends `ToHost`, accepts `FromHost`.
    pub fn client() -> Self {
        Self {
            direction: Direction::ToHost,
            options: ChannelOptions::default().with_prefix("client"),
        }
    }

    /// Host side: sends `FromHost`, accepts `ToHost`.
    pub fn host() -> Self {
        Self {
            direction: Direction::FromHost,
            options: ChannelOptions::default().with_prefix("host"),
        }
    }

    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }
}

pub struct PostBinding {
    inner: Arc<PostInner>,
}

struct PostInner {
    channel: Channel,
    bus: MessageBus,
    direction: Direction,
    slot: ConnectionSlot<()>,
}

impl PostBinding {
    pub fn new(bus: MessageBus, config: PostConfig) -> Self {
        Self {
            inner: Arc::new(PostInner {
                channel: Channel::new(config.options),
                bus,
                direction: config.direction,
                slot: ConnectionSlot::new(),
            }),
        }
    }

    pub fn client(bus: MessageBus) -> Self {
        Self::new(bus, PostConfig::client())
    }

    pub fn host(bus: MessageBus) -> Self {
        Self::new(bus, PostConfig::host())
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }
}

impl PostInner {
    async fn drive(
        self: Arc<Self>,
        generation: u64,
        mut inbound: broadcast::Receiver<Envelope>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let accepted = self.direction.opposite();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                envelope = inbound.recv() => match envelope {
                    Ok(envelope) if envelope.direction == accepted => {
                        match serde_json::from_value::<Message>(envelope.data) {
                            Ok(message) => {
                                self.channel.deliver(message);
                            }
                            Err(e) => self.channel.reject(e),
                        }
                    }
                    // Our own outbound traffic echoed back by the bus.
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[{}] bus subscriber lagged, skipped {skipped} envelopes", self.channel.prefix());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        self.channel.info("closed");
        self.slot.finish(generation, &self.channel);
    }
}

impl ChannelBinding for PostBinding {
    fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        // Subscribe before declaring readiness so nothing sent after
        // `Connected` can be missed.
        let inbound = inner.bus.subscribe();
        let Some((generation, shutdown)) = inner.slot.begin(&inner.channel, ()) else {
            return join_attempt(&inner.channel).await;
        };
        match inner.direction {
            Direction::ToHost => inner.channel.info("connected to host"),
            Direction::FromHost => inner.channel.info("connected to client"),
        }
        inner.channel.publish_state(ConnectionState::Connected);
        tokio::spawn(inner.clone().drive(generation, inbound, shutdown));
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.inner.channel.subscribe_state();
        if self.inner.slot.shutdown() {
            state
                .wait_for(ConnectionState::Disconnected)
                .await;
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        let inner = &self.inner;
        if inner.slot.with(|_, _| ()).is_none() {
            return Err(TransportError::transmission("bus is not connected"));
        }
        let data = serde_json::to_value(&message)
            .map_err(|e| TransportError::transmission(e.to_string()))?;
        inner.channel.log_outbound(&message);
        // No listener is not a failure: the other side may attach later.
        inner.bus.publish(Envelope::new(inner.direction, data));
        Ok(())
    }
}
