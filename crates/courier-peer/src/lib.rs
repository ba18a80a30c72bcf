//! Reference peer for courier bindings.
//!
//! Serves the three surfaces a remote end presents to the bindings:
//! - `GET /ws`: a WebSocket carrying JSON-encoded messages in both directions
//! - `POST|GET /rpc/{kind}`: one HTTP exchange per request, correlation id in
//!   the `x-correlation-id` header, reply payload as the JSON body
//! - `GET /health`: readiness probe
//!
//! Request handling is delegated to a [`RequestHandler`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::Bytes,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message as WsMessage, WebSocket},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use courier_protocol::{CORRELATION_HEADER, CorrelationId, Message, MessageKind};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

pub type PeerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// What the peer does with one request.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerReply {
    /// Send this message back.
    Reply(Message),
    /// Send nothing.
    NoReply,
    /// Close the socket with this code. Over HTTP, fail the exchange.
    Close { code: u16, reason: String },
}

/// Trait implemented by whatever answers requests on the peer.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Message) -> impl Future<Output = PeerReply> + Send;
}

/// Replies with the request unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    async fn handle(&self, request: Message) -> PeerReply {
        PeerReply::Reply(request)
    }
}

/// Adapts a synchronous closure into a handler.
pub struct FnHandler<F>(pub F);

impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(Message) -> PeerReply + Send + Sync + 'static,
{
    async fn handle(&self, request: Message) -> PeerReply {
        (self.0)(request)
    }
}

/// Peer server configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Maximum concurrent socket connections
    pub max_connections: Option<usize>,
    /// Enable permissive CORS
    pub enable_cors: bool,
    /// Sub-protocol accepted on `/ws`
    pub protocol: Option<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            hostname: "127.0.0.1".into(),
            max_connections: Some(32),
            enable_cors: false,
            protocol: None,
        }
    }
}

struct AppState<H: RequestHandler> {
    handler: Arc<H>,
    config: PeerConfig,
    /// Text frames pushed to every socket (peer → all clients)
    frames_tx: broadcast::Sender<String>,
    client_count: Arc<AtomicUsize>,
}

pub struct PeerServer {
    frames_tx: broadcast::Sender<String>,
    client_count: Arc<AtomicUsize>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    port: u16,
    hostname: String,
}

impl PeerServer {
    pub async fn start<H: RequestHandler>(config: PeerConfig, handler: H) -> PeerResult<Self> {
        let (frames_tx, _) = broadcast::channel(1024);
        Self::start_with_sender(config, Arc::new(handler), frames_tx).await
    }

    /// Start with a pre-existing broadcast channel and a shared handler.
    pub async fn start_with_sender<H: RequestHandler>(
        config: PeerConfig,
        handler: Arc<H>,
        frames_tx: broadcast::Sender<String>,
    ) -> PeerResult<Self> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let client_count = Arc::new(AtomicUsize::new(0));

        let state = Arc::new(AppState {
            handler,
            config: config.clone(),
            frames_tx: frames_tx.clone(),
            client_count: client_count.clone(),
        });

        let app = Router::new()
            .route("/ws", get(ws_upgrade_handler::<H>))
            .route(
                "/rpc/{kind}",
                get(rpc_handler::<H>).post(rpc_handler::<H>),
            )
            .route("/health", get(health_handler::<H>))
            .with_state(state);
        let app = if config.enable_cors {
            app.layer(CorsLayer::permissive())
        } else {
            app
        };

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        info!(
            "Courier peer listening on ws://{}:{}/ws and http://{}:{}/rpc",
            config.hostname, actual_port, config.hostname, actual_port
        );

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            frames_tx,
            client_count,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
            hostname: config.hostname,
        })
    }

    /// Push an event to every connected socket. Returns how many sockets
    /// were listening.
    pub fn broadcast(&self, message: &Message) -> usize {
        match serde_json::to_string(message) {
            Ok(text) => self.broadcast_raw(text),
            Err(e) => {
                error!("Failed to encode broadcast: {e}");
                0
            }
        }
    }

    /// Push an arbitrary text frame to every connected socket.
    pub fn broadcast_raw(&self, text: impl Into<String>) -> usize {
        self.frames_tx.send(text.into()).unwrap_or(0)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.hostname, self.port)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }

    /// Sockets currently attached and subscribed to broadcasts.
    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    /// Gracefully stop the server.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Courier peer stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: RequestHandler>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<H>>>,
) -> Response {
    if let Some(max) = state.config.max_connections {
        let current = state.client_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    let ws = match &state.config.protocol {
        Some(protocol) => ws.protocols([protocol.clone()]),
        None => ws,
    };
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn rpc_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
    Path(kind): Path<MessageKind>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = if body.is_empty() {
        serde_json::Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                    .into_response();
            }
        }
    };
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(CorrelationId::from);

    let request = Message {
        correlation_id,
        kind,
        payload,
    };
    debug!(kind, "HTTP request");

    match state.handler.handle(request).await {
        PeerReply::Reply(reply) => Json(reply.payload).into_response(),
        PeerReply::NoReply => StatusCode::NO_CONTENT.into_response(),
        PeerReply::Close { code, reason } => {
            let status = StatusCode::from_u16(code)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({ "error": reason }))).into_response()
        }
    }
}

async fn health_handler<H: RequestHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.client_count.load(Ordering::Relaxed),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws_connection<H: RequestHandler>(socket: WebSocket, state: Arc<AppState<H>>) {
    // Subscribe before counting so a visible client always receives broadcasts.
    let mut frames_rx = state.frames_tx.subscribe();
    state.client_count.fetch_add(1, Ordering::Relaxed);

    let client_id = uuid::Uuid::new_v4().to_string();
    info!("Client connected: {client_id}");

    let (mut ws_tx, mut ws_rx) = socket.split();
    // Requests are handled concurrently; their replies come back here.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<PeerReply>();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let decoded = match msg {
                    Some(Ok(WsMessage::Text(text))) => serde_json::from_str::<Message>(text.as_str()),
                    Some(Ok(WsMessage::Binary(data))) => serde_json::from_slice::<Message>(&data),
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws_tx.send(WsMessage::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("Client disconnected: {client_id}");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {client_id}: {e}");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };
                match decoded {
                    Ok(request) => {
                        let handler = state.handler.clone();
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let _ = reply_tx.send(handler.handle(request).await);
                        });
                    }
                    Err(e) => warn!("Undecodable frame from {client_id}: {e}"),
                }
            }

            reply = reply_rx.recv() => match reply {
                Some(PeerReply::Reply(message)) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode reply: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                        error!("Failed to send reply to {client_id}: {e}");
                        break;
                    }
                }
                Some(PeerReply::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
                    debug!("Closed {client_id} with code {code}");
                    break;
                }
                Some(PeerReply::NoReply) | None => {}
            },

            frame = frames_rx.recv() => {
                if let Ok(text) = frame {
                    if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                        error!("Failed to broadcast to {client_id}: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.client_count.fetch_sub(1, Ordering::Relaxed);
    info!(
        "Client disconnected: {client_id} (total: {})",
        state.client_count.load(Ordering::Relaxed)
    );
}
