//! Request-per-call (HTTP) binding.
//!
//! Each outbound message becomes one independent HTTP exchange. The JSON
//! body of the response becomes the payload of a reply carrying the
//! request's own correlation id, so replies are matched by id no matter in
//! which order the exchanges complete.
//!
//! An optional health probe gates readiness. A failed exchange (transport
//! error, non-success status, or a body that is not JSON) terminates the
//! binding, which fails every pending request with `ClosedConnection`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use courier_protocol::{CORRELATION_HEADER, ConnectionState, Message, Result, TransportError};
use reqwest::{Method, RequestBuilder};
use tokio::sync::{mpsc, oneshot};

use crate::binding::ChannelBinding;
use crate::channel::{Channel, ChannelOptions};
use crate::lifecycle::{ConnectionSlot, join_attempt};
use crate::socket::HANDSHAKE_TIMEOUT;

/// Where and how a message is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestRoute {
    pub method: Method,
    /// Path appended to the base URL
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RestRoute {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn has_body(&self) -> bool {
        self.method != Method::GET && self.method != Method::HEAD
    }
}

/// Resolves the route of an outbound message.
pub type RouteResolver = Arc<dyn Fn(&Message) -> RestRoute + Send + Sync>;

/// HTTP binding configuration.
#[derive(Clone)]
pub struct RestConfig {
    /// Base URL, e.g. `http://127.0.0.1:7070`
    pub base_url: String,
    /// Health probe path, e.g. `/health`
    pub health: Option<String>,
    /// Upper bound on the health probe
    pub handshake_timeout: Duration,
    pub route: RouteResolver,
    pub options: ChannelOptions,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            route: Arc::new(|message: &Message| RestRoute::post(format!("/rpc/{}", message.kind))),
            options: ChannelOptions::default().with_prefix("rest"),
        }
    }

    pub fn with_health(mut self, path: impl Into<String>) -> Self {
        self.health = Some(path.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_route(
        mut self,
        route: impl Fn(&Message) -> RestRoute + Send + Sync + 'static,
    ) -> Self {
        self.route = Arc::new(route);
        self
    }

    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }
}

impl fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestConfig")
            .field("base_url", &self.base_url)
            .field("health", &self.health)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

pub struct RestBinding {
    inner: Arc<RestInner>,
}

struct RestInner {
    channel: Channel,
    config: RestConfig,
    client: reqwest::Client,
    /// Failures reported by in-flight exchanges of the current attempt
    slot: ConnectionSlot<mpsc::UnboundedSender<TransportError>>,
}

/// Result of one HTTP exchange.
enum Exchange {
    Reply(serde_json::Value),
    Failed(TransportError),
}

impl RestBinding {
    pub fn new(config: RestConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: RestConfig, client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(RestInner {
                channel: Channel::new(config.options.clone()),
                config,
                client,
                slot: ConnectionSlot::new(),
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.inner.config.base_url
    }
}

impl RestInner {
    async fn drive(
        self: Arc<Self>,
        generation: u64,
        mut failures: mpsc::UnboundedReceiver<TransportError>,
        mut shutdown: oneshot::Receiver<()>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        if let Some(health) = &self.config.health {
            let probe = tokio::time::timeout(self.config.handshake_timeout, self.probe(health));
            tokio::select! {
                result = probe => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return self.abort(generation, err, true, ready),
                    Err(_) => return self.abort(generation, TransportError::TimeoutReached, true, ready),
                },
                _ = &mut shutdown => {
                    let err = TransportError::channel("Connection attempt aborted");
                    return self.abort(generation, err, false, ready);
                }
            }
        }

        self.channel
            .info(&format!("connected to {}", self.config.base_url));
        self.channel.publish_state(ConnectionState::Connected);
        let _ = ready.send(Ok(()));

        let failure = tokio::select! {
            failure = failures.recv() => failure,
            _ = &mut shutdown => None,
        };
        match failure {
            Some(err) => self.channel.fault(err),
            None => self
                .channel
                .info(&format!("rest closed {}", self.config.base_url)),
        }
        self.slot.finish(generation, &self.channel);
    }

    fn abort(
        &self,
        generation: u64,
        err: TransportError,
        is_fault: bool,
        ready: oneshot::Sender<Result<()>>,
    ) {
        if is_fault {
            self.channel.fault(err.clone());
        } else {
            self.channel.info(&err.to_string());
        }
        self.slot.finish(generation, &self.channel);
        let _ = ready.send(Err(err));
    }

    async fn probe(&self, health: &str) -> Result<()> {
        let url = format!("{}{}", self.config.base_url, health);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::channel(format!("{url} not accessible: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::channel(format!(
                "{url} not accessible: {status}"
            )));
        }
        response
            .json::<serde_json::Value>()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::channel(format!("{url} returned an invalid body: {e}")))
    }
}

async fn exchange(request: RequestBuilder) -> Exchange {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return Exchange::Failed(TransportError::channel(e.to_string())),
    };
    let status = response.status();
    if !status.is_success() {
        return Exchange::Failed(TransportError::channel(format!(
            "HTTP error. Status: {}",
            status.as_u16()
        )));
    }
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => return Exchange::Failed(TransportError::channel(e.to_string())),
    };
    if body.is_empty() {
        return Exchange::Reply(serde_json::Value::Null);
    }
    match serde_json::from_slice(&body) {
        Ok(payload) => Exchange::Reply(payload),
        // The body is the only reply this request will ever get.
        Err(e) => Exchange::Failed(TransportError::channel(format!("invalid JSON body: {e}"))),
    }
}

impl ChannelBinding for RestBinding {
    fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let Some((generation, shutdown)) = inner.slot.begin(&inner.channel, failures_tx) else {
            return join_attempt(&inner.channel).await;
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(inner.clone().drive(generation, failures_rx, shutdown, ready_tx));
        ready_rx
            .await
            .unwrap_or_else(|_| Err(TransportError::channel("rest task ended unexpectedly")))
    }

    async fn disconnect(&self) {
        let mut state = self.inner.channel.subscribe_state();
        if self.inner.slot.shutdown() {
            state.wait_for(ConnectionState::Disconnected).await;
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        let inner = &self.inner;
        let (generation, failures) = inner
            .slot
            .with(|generation, failures| (generation, failures.clone()))
            .ok_or_else(|| TransportError::transmission("rest binding is not connected"))?;
        if inner.channel.state() != ConnectionState::Connected {
            return Err(TransportError::transmission("rest binding is not ready"));
        }

        let route = (inner.config.route)(&message);
        let url = format!("{}{}", inner.config.base_url, route.path);
        let mut request = inner.client.request(route.method.clone(), &url);
        if let Some(id) = message.id() {
            request = request.header(CORRELATION_HEADER, id.as_str());
        }
        for (name, value) in &route.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if route.has_body() {
            request = request.json(&message.payload);
        }

        inner.channel.log_outbound(&message);

        let inner = inner.clone();
        let Message {
            correlation_id,
            kind,
            ..
        } = message;
        tokio::spawn(async move {
            let outcome = exchange(request).await;
            // Results of an attempt that has since ended are discarded.
            if !inner.slot.is_current(generation) {
                return;
            }
            match outcome {
                Exchange::Reply(payload) => {
                    inner.channel.deliver(Message {
                        correlation_id,
                        kind,
                        payload,
                    });
                }
                Exchange::Failed(err) => {
                    let _ = failures.send(err);
                }
            }
        });
        Ok(())
    }
}
