//! Request dispatcher: the request/response protocol.
//!
//! One call to [`send_request`]:
//! 1. resolves the correlation id (caller-supplied or generated),
//! 2. registers it, unless the message is fire-and-forget,
//! 3. subscribes to responses and to state before transmitting,
//! 4. transmits through the binding,
//! 5. waits for the first of: a response carrying the id, or a transition
//!    to `Disconnected`.
//!
//! Registration and both subscriptions live in a [`PendingRequest`] whose
//! `Drop` deregisters the id. Every exit path (reply, disconnect, transmit
//! error, or the caller dropping the future) therefore drops the id exactly
//! once and releases both subscriptions exactly once.
//!
//! A response subscriber that lags may have missed its own reply. It scans
//! what is still buffered and, if the reply is not there, fails with
//! `ChannelError` rather than waiting for a reply that will never come.

use courier_protocol::{
    ConnectionState, CorrelationId, Message, MessageKind, Result, TransportError,
};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tracing::{debug, warn};

use crate::binding::ChannelBinding;
use crate::registry::CorrelationRegistry;
use crate::state::StateSubscription;

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Transmit without registering the id or awaiting a reply.
    pub fire_and_forget: bool,
}

impl SendOptions {
    pub fn fire_and_forget() -> Self {
        Self {
            fire_and_forget: true,
        }
    }
}

/// Send `message` through `binding` and await its reply.
///
/// Returns `Ok(None)` for fire-and-forget sends. A caller-supplied id that
/// is already pending on this binding is rejected with
/// `DuplicateCorrelationId` before anything is transmitted.
pub async fn send_request<B: ChannelBinding>(
    binding: &B,
    mut message: Message,
    options: SendOptions,
) -> Result<Option<Message>> {
    let id = message
        .correlation_id
        .get_or_insert_with(CorrelationId::generate)
        .clone();

    if options.fire_and_forget {
        binding.send(message).await?;
        return Ok(None);
    }

    let mut pending = PendingRequest::register(binding, id, message.kind)?;
    binding.send(message).await?;
    pending.wait().await
}

/// The registration and subscriptions held by one outstanding request.
struct PendingRequest<'a> {
    registry: &'a CorrelationRegistry,
    id: CorrelationId,
    kind: MessageKind,
    responses: broadcast::Receiver<Message>,
    state: StateSubscription,
}

impl<'a> PendingRequest<'a> {
    fn register<B: ChannelBinding>(
        binding: &'a B,
        id: CorrelationId,
        kind: MessageKind,
    ) -> Result<Self> {
        let registry = binding.channel().registry();
        // Visible to the demultiplexer before the reply can possibly arrive.
        if !registry.add(&id) {
            return Err(TransportError::DuplicateCorrelationId(id));
        }
        Ok(Self {
            registry,
            id,
            kind,
            responses: binding.subscribe_responses(),
            state: binding.subscribe_state(),
        })
    }

    async fn wait(&mut self) -> Result<Option<Message>> {
        loop {
            tokio::select! {
                // A reply that is already queued wins over a disconnect that
                // is queued at the same time.
                biased;

                reply = self.responses.recv() => match reply {
                    Ok(message) if message.answers(&self.id) => return Ok(Some(message)),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(id = %self.id, "Response subscriber lagged, skipped {skipped} messages");
                        return self.recover_from_lag(skipped);
                    }
                    Err(RecvError::Closed) => return Err(TransportError::closed(self.kind)),
                },

                state = self.state.next() => match state {
                    Some(ConnectionState::Disconnected) | None => {
                        debug!(id = %self.id, kind = self.kind, "Connection closed while awaiting reply");
                        return Err(TransportError::closed(self.kind));
                    }
                    Some(_) => {}
                },
            }
        }
    }

    /// Look for the reply among the messages still buffered after a lag.
    fn recover_from_lag(&mut self, mut skipped: u64) -> Result<Option<Message>> {
        loop {
            match self.responses.try_recv() {
                Ok(message) if message.answers(&self.id) => return Ok(Some(message)),
                Ok(_) => {}
                Err(TryRecvError::Lagged(more)) => skipped += more,
                Err(TryRecvError::Empty) => {
                    return Err(TransportError::channel(format!(
                        "response stream lagged, skipped {skipped} messages"
                    )));
                }
                Err(TryRecvError::Closed) => return Err(TransportError::closed(self.kind)),
            }
        }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.registry.drop(&self.id);
    }
}
