//! WebSocket binding.
//!
//! Handles the connection handshake (raced against a fixed timeout), close
//! code interpretation, ping replies, and frame encoding through a pluggable
//! codec. A close with code 1000 (or one we initiated) is graceful; any other
//! code, a stream error, or a stream that ends without a close frame is a
//! `SocketError`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use courier_protocol::{
    Codec, ConnectionState, JsonCodec, Message, Result, TransportError, WireFrame,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message as WsMessage,
        client::IntoClientRequest,
        http::{HeaderValue, Request},
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::debug;

use crate::binding::ChannelBinding;
use crate::channel::{Channel, ChannelOptions};
use crate::lifecycle::{ConnectionSlot, join_attempt};

/// Close code treated as an expected shutdown.
pub const GRACEFUL_CLOSE_CODE: u16 = 1000;

/// How long the opening handshake may take.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Socket binding configuration.
#[derive(Clone)]
pub struct SocketConfig {
    /// `ws://` or `wss://` URL
    pub url: String,
    /// Sub-protocol requested via `Sec-WebSocket-Protocol`
    pub protocol: Option<String>,
    pub handshake_timeout: Duration,
    pub codec: Arc<dyn Codec>,
    pub options: ChannelOptions,
}

impl SocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocol: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            codec: Arc::new(JsonCodec),
            options: ChannelOptions::default().with_prefix("socket"),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }
}

impl fmt::Debug for SocketConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketConfig")
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

pub struct SocketBinding {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    channel: Channel,
    config: SocketConfig,
    slot: ConnectionSlot<mpsc::UnboundedSender<WsMessage>>,
}

impl SocketBinding {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                channel: Channel::new(config.options.clone()),
                config,
                slot: ConnectionSlot::new(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }
}

/// How a live connection ended.
enum Ending {
    Graceful,
    Abnormal(TransportError),
}

impl SocketInner {
    fn client_request(&self) -> Result<Request<()>> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::socket(None, e.to_string()))?;
        if let Some(protocol) = &self.config.protocol {
            let value = HeaderValue::from_str(protocol)
                .map_err(|e| TransportError::socket(None, e.to_string()))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }
        Ok(request)
    }

    async fn drive(
        self: Arc<Self>,
        generation: u64,
        outbound: mpsc::UnboundedReceiver<WsMessage>,
        mut shutdown: oneshot::Receiver<()>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let request = match self.client_request() {
            Ok(request) => request,
            Err(err) => return self.abort(generation, err, true, ready),
        };

        let handshake = tokio::time::timeout(self.config.handshake_timeout, connect_async(request));
        let stream = tokio::select! {
            result = handshake => match result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => {
                    let err = TransportError::socket(None, e.to_string());
                    return self.abort(generation, err, true, ready);
                }
                Err(_) => return self.abort(generation, TransportError::TimeoutReached, true, ready),
            },
            _ = &mut shutdown => {
                let err = TransportError::channel("Connection attempt aborted");
                return self.abort(generation, err, false, ready);
            }
        };

        self.channel
            .info(&format!("connected to {}", self.config.url));
        self.channel.publish_state(ConnectionState::Connected);
        let _ = ready.send(Ok(()));

        match self.pump(stream, outbound, shutdown).await {
            Ending::Graceful => self.channel.info(&format!("socket closed {}", self.config.url)),
            Ending::Abnormal(err) => self.channel.fault(err),
        }
        self.slot.finish(generation, &self.channel);
    }

    /// End an attempt that never reached `Connected`.
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

    async fn pump(
        &self,
        stream: WsStream,
        mut outbound: mpsc::UnboundedReceiver<WsMessage>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Ending {
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.accept(WireFrame::Text(text.as_str().to_owned())),
                    Some(Ok(WsMessage::Binary(data))) => self.accept(WireFrame::Binary(data)),
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sink.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        // Push out the close reply queued by the protocol layer.
                        if let Err(e) = sink.flush().await {
                            debug!("Failed to flush close reply: {e}");
                        }
                        return close_ending(frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ending::Abnormal(TransportError::socket(None, e.to_string())),
                    None => {
                        return Ending::Abnormal(TransportError::socket(
                            None,
                            "connection ended without a close frame",
                        ));
                    }
                },

                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            return Ending::Abnormal(TransportError::socket(None, e.to_string()));
                        }
                    }
                    None => return close_gracefully(&mut sink).await,
                },

                _ = &mut shutdown => return close_gracefully(&mut sink).await,
            }
        }
    }

    fn accept(&self, frame: WireFrame) {
        match self.config.codec.decode(&frame) {
            Ok(message) => {
                self.channel.deliver(message);
            }
            Err(e) => self.channel.reject(e),
        }
    }
}

async fn close_gracefully<S>(sink: &mut S) -> Ending
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: fmt::Display,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    if let Err(e) = sink.send(WsMessage::Close(Some(frame))).await {
        debug!("Failed to send close frame: {e}");
    }
    Ending::Graceful
}

fn close_ending(frame: Option<CloseFrame>) -> Ending {
    match frame {
        Some(frame) if u16::from(frame.code) == GRACEFUL_CLOSE_CODE => Ending::Graceful,
        Some(frame) => Ending::Abnormal(TransportError::socket(
            Some(u16::from(frame.code)),
            frame.reason.as_str(),
        )),
        None => Ending::Abnormal(TransportError::socket(None, "closed without a status code")),
    }
}

fn to_ws(frame: WireFrame) -> WsMessage {
    match frame {
        WireFrame::Text(text) => WsMessage::Text(text.into()),
        WireFrame::Binary(data) => WsMessage::Binary(data),
    }
}

impl ChannelBinding for SocketBinding {
    fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let Some((generation, shutdown)) = inner.slot.begin(&inner.channel, outbound_tx) else {
            return join_attempt(&inner.channel).await;
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(inner.clone().drive(generation, outbound_rx, shutdown, ready_tx));
        ready_rx
            .await
            .unwrap_or_else(|_| Err(TransportError::channel("socket task ended unexpectedly")))
    }

    async fn disconnect(&self) {
        let mut state = self.inner.channel.subscribe_state();
        if self.inner.slot.shutdown() {
            state.wait_for(ConnectionState::Disconnected).await;
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        let inner = &self.inner;
        let frame = inner
            .config
            .codec
            .encode(&message)
            .map_err(|e| TransportError::transmission(e.to_string()))?;
        let outbound = inner
            .slot
            .with(|_, outbound| outbound.clone())
            .ok_or_else(|| TransportError::transmission("socket is not connected"))?;
        inner.channel.log_outbound(&message);
        outbound
            .send(to_ws(frame))
            .map_err(|_| TransportError::transmission("socket is closed"))
    }
}
