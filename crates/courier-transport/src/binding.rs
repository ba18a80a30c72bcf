//! The contract every transport binding implements.

use std::future::Future;

use courier_protocol::{ConnectionState, CorrelationId, Message, Result, TransportError};
use tokio::sync::broadcast;

use crate::channel::Channel;
use crate::state::StateSubscription;

/// Normalizes a concrete transport into connect/disconnect controls, a send
/// primitive, and the streams owned by its [`Channel`].
///
/// Implementations publish `Connecting` on `connect()`, `Connected` once the
/// transport confirms readiness, and exactly one `Disconnected` when that
/// connection ends, whatever the cause.
pub trait ChannelBinding: Send + Sync + 'static {
    /// The shared core: registry, state, demultiplexer, faults.
    fn channel(&self) -> &Channel;

    /// Open the transport. Resolves once the binding is `Connected`, or with
    /// the handshake failure. While an attempt is already in progress, joins
    /// it instead of starting another.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Close the transport. Idempotent; always ends in `Disconnected`.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// Transmit one message. Fails with `TransmissionFailure` when the
    /// message cannot be handed to the transport.
    fn send(&self, message: Message) -> impl Future<Output = Result<()>> + Send;

    // ── Provided ────────────────────────────────────────────────────────

    fn add(&self, id: &CorrelationId) -> bool {
        self.channel().registry().add(id)
    }

    fn drop_id(&self, id: &CorrelationId) -> bool {
        self.channel().registry().drop(id)
    }

    fn is_pending(&self, id: &CorrelationId) -> bool {
        self.channel().registry().is_pending(id)
    }

    fn state(&self) -> ConnectionState {
        self.channel().state()
    }

    fn subscribe_state(&self) -> StateSubscription {
        self.channel().subscribe_state()
    }

    fn subscribe_responses(&self) -> broadcast::Receiver<Message> {
        self.channel().subscribe_responses()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<Message> {
        self.channel().subscribe_events()
    }

    fn subscribe_faults(&self) -> broadcast::Receiver<TransportError> {
        self.channel().subscribe_faults()
    }
}
