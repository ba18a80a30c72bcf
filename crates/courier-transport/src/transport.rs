//! Transport facade: the application-facing API over one binding.

use std::sync::Arc;

use courier_protocol::{ConnectionState, Message, MessageKind, Result, TransportError};
use tokio::sync::broadcast;

use crate::binding::ChannelBinding;
use crate::diagnostics::LogEntry;
use crate::dispatch::{SendOptions, send_request};
use crate::state::StateSubscription;

/// Decides whether a reply represents a domain-level failure.
pub type ErrorPredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Composes a binding with the dispatcher: `send(message) -> payload`, an
/// event subscription, and lifecycle controls.
pub struct Transport<B: ChannelBinding> {
    name: String,
    binding: Arc<B>,
    is_error: Option<ErrorPredicate>,
}

impl<B: ChannelBinding> Transport<B> {
    pub fn new(name: impl Into<String>, binding: B) -> Self {
        Self::from_arc(name, Arc::new(binding))
    }

    pub fn from_arc(name: impl Into<String>, binding: Arc<B>) -> Self {
        Self {
            name: name.into(),
            binding,
            is_error: None,
        }
    }

    /// Treat replies of these kinds as `ApplicationError`.
    pub fn with_error_kinds(self, kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        let kinds: Vec<MessageKind> = kinds.into_iter().collect();
        self.with_error_predicate(move |reply| kinds.contains(&reply.kind))
    }

    pub fn with_error_predicate(
        mut self,
        predicate: impl Fn(&Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_error = Some(Arc::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binding(&self) -> &Arc<B> {
        &self.binding
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<()> {
        self.binding.connect().await
    }

    pub async fn disconnect(&self) {
        self.binding.disconnect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.binding.state()
    }

    // ── Requests ────────────────────────────────────────────────────────

    /// Send a request and return the payload of its reply.
    pub async fn send(&self, message: Message) -> Result<serde_json::Value> {
        self.request(message).await.map(|reply| reply.payload)
    }

    /// Send a request and return the whole reply message.
    pub async fn request(&self, message: Message) -> Result<Message> {
        let kind = message.kind;
        self.send_with(message, SendOptions::default())
            .await?
            .ok_or(TransportError::closed(kind))
    }

    /// Send with explicit options. Fire-and-forget sends resolve to `None`.
    pub async fn send_with(
        &self,
        message: Message,
        options: SendOptions,
    ) -> Result<Option<Message>> {
        let reply = send_request(self.binding.as_ref(), message, options).await?;
        match (reply, &self.is_error) {
            (Some(reply), Some(is_error)) if is_error(&reply) => {
                Err(TransportError::ApplicationError(Box::new(reply)))
            }
            (reply, _) => Ok(reply),
        }
    }

    // ── Subscriptions ───────────────────────────────────────────────────

    /// Unsolicited inbound messages, in channel order.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Message> {
        self.binding.subscribe_events()
    }

    pub fn subscribe_state(&self) -> StateSubscription {
        self.binding.subscribe_state()
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<TransportError> {
        self.binding.subscribe_faults()
    }

    pub fn get_logs(&self) -> Vec<LogEntry> {
        self.binding.channel().diagnostics().logs()
    }
}

impl<B: ChannelBinding> Clone for Transport<B> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            binding: self.binding.clone(),
            is_error: self.is_error.clone(),
        }
    }
}
