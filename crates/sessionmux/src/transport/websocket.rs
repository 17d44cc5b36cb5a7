//! WebSocket transport.
//!
//! One socket carries every session. Outbound messages are wrapped in a
//! sequenced [`Envelope`] and sent as JSON text frames; inbound envelopes
//! are accepted as JSON text or MessagePack binary frames. The link is kept
//! alive with WebSocket pings and re-established with exponential backoff.
//! After a reconnect every session that was connected is connected again.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use protocol::error::{ProtocolError, Result};
use protocol::{
    ControlRequest, Envelope, InboundFrame, Message, Payload, SessionConnect, SessionDisconnect,
    SessionSend,
};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use url::Url;

use super::{Transport, INBOUND_CHANNEL_CAPACITY};

/// Default reconnection settings.
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default endpoint when none is configured.
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8787/stream";

/// State of the shared socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting to reconnect after a disconnect.
    Reconnecting,
}

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Server URL (`ws://` or `wss://`).
    pub endpoint: String,
    /// Timeout for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Initial backoff duration for reconnection.
    pub initial_backoff: Duration,
    /// Maximum backoff duration for reconnection.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to automatically reconnect on disconnect.
    pub auto_reconnect: bool,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Timeout for heartbeat pong response.
    pub heartbeat_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            auto_reconnect: true,
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketConfig {
    /// Creates a configuration for `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Sets whether to automatically reconnect on disconnect.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets the initial backoff duration.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Sets the maximum backoff duration.
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Sets the heartbeat ping interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Parses and checks the endpoint URL.
    pub fn endpoint_url(&self) -> Result<Url> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| ProtocolError::InvalidEndpoint(format!("{}: {}", self.endpoint, e)))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ProtocolError::InvalidEndpoint(format!(
                "unsupported scheme '{}', expected ws or wss",
                other
            ))),
        }
    }
}

/// Next backoff after `current`, capped at `max`.
pub fn next_backoff(current: Duration, multiplier: f64, max: Duration) -> Duration {
    std::cmp::min(
        Duration::from_secs_f64(current.as_secs_f64() * multiplier),
        max,
    )
}

/// Internal state of the socket.
struct SocketState {
    /// Current link status.
    status: LinkStatus,
    /// Sender for outgoing messages while the socket is up.
    outgoing_tx: Option<mpsc::Sender<Message>>,
    /// Sessions to (re)connect whenever the link comes up.
    sessions: HashSet<String>,
    /// Current backoff duration for reconnection.
    current_backoff: Duration,
    /// Whether a shutdown has been requested.
    shutdown_requested: bool,
}

impl SocketState {
    fn new(initial_backoff: Duration) -> Self {
        Self {
            status: LinkStatus::Disconnected,
            outgoing_tx: None,
            sessions: HashSet::new(),
            current_backoff: initial_backoff,
            shutdown_requested: false,
        }
    }
}

/// WebSocket-based [`Transport`].
pub struct WebSocketTransport {
    /// Configuration for the transport.
    config: WebSocketConfig,
    /// Internal state.
    state: Arc<RwLock<SocketState>>,
    /// Next envelope sequence number.
    sequence: Arc<AtomicU64>,
    /// Sender for inbound frames.
    inbound_tx: mpsc::Sender<InboundFrame>,
    /// Receiver for inbound frames (returned by events()).
    inbound_rx: Arc<RwLock<Option<mpsc::Receiver<InboundFrame>>>>,
}

impl WebSocketTransport {
    /// Creates a transport. Call [`WebSocketTransport::start`] to open the socket.
    pub fn new(config: WebSocketConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let state = SocketState::new(config.initial_backoff);

        Self {
            config,
            state: Arc::new(RwLock::new(state)),
            sequence: Arc::new(AtomicU64::new(0)),
            inbound_tx,
            inbound_rx: Arc::new(RwLock::new(Some(inbound_rx))),
        }
    }

    /// Current link status.
    pub fn status(&self) -> LinkStatus {
        match self.state.try_read() {
            Ok(state) => state.status,
            Err(_) => LinkStatus::Disconnected,
        }
    }

    /// Waits until the link is up or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state.read().await.status == LinkStatus::Connected {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProtocolError::Timeout(format!(
                    "no connection to {} after {:?}",
                    self.config.endpoint, timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Updates the link status. Logs only on change.
    async fn set_status(&self, new_status: LinkStatus) {
        let mut state = self.state.write().await;
        if state.status == new_status {
            return;
        }
        tracing::info!(from = ?state.status, to = ?new_status, "Link status changed");
        state.status = new_status;
    }

    /// Wraps `message` in an envelope and queues it on the socket.
    async fn enqueue(&self, message: Message) -> Result<()> {
        let state = self.state.read().await;
        if let Some(ref tx) = state.outgoing_tx {
            tx.send(message).await.map_err(|e| {
                ProtocolError::TransferFailed(format!("failed to queue message: {}", e))
            })?;
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed(
                "not connected to stream server".to_string(),
            ))
        }
    }

    /// Runs the connection loop with reconnection support.
    async fn run_connection_loop(self: Arc<Self>) {
        loop {
            if self.state.read().await.shutdown_requested {
                break;
            }

            self.set_status(LinkStatus::Connecting).await;

            match self.connect_internal().await {
                Ok((outgoing_tx, mut frames_rx, control_tx, last_pong)) => {
                    let sessions: Vec<String> = {
                        let mut state = self.state.write().await;
                        state.outgoing_tx = Some(outgoing_tx.clone());
                        state.current_backoff = self.config.initial_backoff;
                        state.sessions.iter().cloned().collect()
                    };

                    // Queued ahead of anything sent once the link reports connected
                    for session_id in sessions {
                        tracing::debug!(session_id = %session_id, "Connecting session stream");
                        let connect = Message::Connect(SessionConnect { session_id });
                        if outgoing_tx.send(connect).await.is_err() {
                            break;
                        }
                    }
                    self.set_status(LinkStatus::Connected).await;

                    let mut heartbeat_interval =
                        tokio::time::interval(self.config.heartbeat_interval);
                    // Skip the first immediate tick
                    heartbeat_interval.tick().await;

                    loop {
                        tokio::select! {
                            _ = heartbeat_interval.tick() => {
                                let last_pong_time = *last_pong.read().await;
                                if last_pong_time.elapsed() > self.config.heartbeat_timeout + self.config.heartbeat_interval {
                                    tracing::warn!("Heartbeat timeout, reconnecting...");
                                    break;
                                }

                                if let Err(e) = control_tx.send(WsMessage::Ping(vec![])).await {
                                    tracing::error!(error = %e, "Failed to send ping");
                                    break;
                                }
                                tracing::debug!("Sent heartbeat ping");
                            }
                            Some(result) = frames_rx.recv() => {
                                match result {
                                    Ok(frame) => {
                                        if self.inbound_tx.send(frame).await.is_err() {
                                            tracing::warn!("Inbound receiver dropped, closing link");
                                            self.state.write().await.shutdown_requested = true;
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::error!(error = %e, "Stream receive error");
                                        break;
                                    }
                                }
                            }
                            else => break,
                        }

                        if self.state.read().await.shutdown_requested {
                            break;
                        }
                    }

                    self.state.write().await.outgoing_tx = None;
                }
                Err(e) => {
                    tracing::error!(error = %e, endpoint = %self.config.endpoint, "Stream connection failed");
                }
            }

            let should_reconnect = {
                let state = self.state.read().await;
                self.config.auto_reconnect && !state.shutdown_requested
            };

            if !should_reconnect {
                self.set_status(LinkStatus::Disconnected).await;
                self.close_all_sessions().await;
                break;
            }

            let backoff = {
                let mut state = self.state.write().await;
                let backoff = state.current_backoff;
                state.current_backoff = next_backoff(
                    state.current_backoff,
                    self.config.backoff_multiplier,
                    self.config.max_backoff,
                );
                backoff
            };

            self.set_status(LinkStatus::Reconnecting).await;
            tracing::info!(backoff = ?backoff, "Reconnecting");
            tokio::time::sleep(backoff).await;
        }
    }

    /// Reports every registered session as closed once the link is gone for good.
    async fn close_all_sessions(&self) {
        let sessions: Vec<String> = self.state.write().await.sessions.drain().collect();
        for session_id in sessions {
            if self
                .inbound_tx
                .send(InboundFrame::closed(session_id))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    /// Internal connection establishment.
    ///
    /// Returns:
    /// - Sender for outgoing messages
    /// - Receiver for decoded inbound frames
    /// - Sender for WebSocket control frames (ping)
    /// - Shared timestamp of last pong received
    async fn connect_internal(
        &self,
    ) -> Result<(
        mpsc::Sender<Message>,
        mpsc::Receiver<Result<InboundFrame>>,
        mpsc::Sender<WsMessage>,
        Arc<RwLock<Instant>>,
    )> {
        let url = self.config.endpoint_url()?;

        tracing::info!(endpoint = %url, "Connecting to stream server");

        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ProtocolError::Timeout(format!("handshake with {} timed out", url))
            })?
            .map_err(|e| match e {
                WsError::Io(io_err) => ProtocolError::from(io_err),
                _ => ProtocolError::ConnectionClosed(format!("WebSocket connection failed: {}", e)),
            })?;

        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let (frames_tx, frames_rx) = mpsc::channel::<Result<InboundFrame>>(256);
        let (control_tx, mut control_rx) = mpsc::channel::<WsMessage>(16);

        // Initialized to now for a grace period
        let last_pong = Arc::new(RwLock::new(Instant::now()));
        let last_pong_writer = last_pong.clone();

        let sequence = self.sequence.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(message) = outgoing_rx.recv() => {
                        let envelope = Envelope::new(sequence.fetch_add(1, Ordering::Relaxed), message);
                        match envelope.to_json() {
                            Ok(json) => {
                                if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                                    tracing::error!(error = %e, "Failed to send WebSocket message");
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to serialize envelope");
                            }
                        }
                    }
                    Some(control_msg) = control_rx.recv() => {
                        if let Err(e) = ws_sink.send(control_msg).await {
                            tracing::error!(error = %e, "Failed to send WebSocket control frame");
                            break;
                        }
                    }
                    else => break,
                }
            }
        });

        tokio::spawn(async move {
            while let Some(result) = ws_stream.next().await {
                let decoded = match result {
                    Ok(WsMessage::Text(text)) => Envelope::from_json(&text),
                    Ok(WsMessage::Binary(bytes)) => Envelope::from_msgpack(&bytes),
                    Ok(WsMessage::Pong(_)) => {
                        *last_pong_writer.write().await = Instant::now();
                        tracing::debug!("Received heartbeat pong");
                        continue;
                    }
                    Ok(WsMessage::Close(_)) => {
                        let _ = frames_tx
                            .send(Err(ProtocolError::ConnectionClosed(
                                "server closed connection".to_string(),
                            )))
                            .await;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = frames_tx
                            .send(Err(ProtocolError::ConnectionClosed(format!(
                                "WebSocket error: {}",
                                e
                            ))))
                            .await;
                        break;
                    }
                };

                match decoded {
                    Ok(Envelope {
                        payload: Message::Frame(frame),
                        ..
                    }) => {
                        if frames_tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Ok(envelope) => {
                        tracing::warn!(sequence = envelope.sequence, "Ignoring non-frame message from server");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to decode inbound envelope");
                    }
                }
            }
        });

        Ok((outgoing_tx, frames_rx, control_tx, last_pong))
    }

    /// Starts the connection loop in the background.
    pub fn start(self: Arc<Self>) {
        let transport = self.clone();
        tokio::spawn(async move {
            transport.run_connection_loop().await;
        });
    }

    /// Stops the connection loop and drops the socket.
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        state.shutdown_requested = true;
        state.outgoing_tx = None;
        state.status = LinkStatus::Disconnected;
    }
}

impl Transport for WebSocketTransport {
    fn connect(
        &self,
        session_id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        let session_id = session_id.to_string();

        Box::pin(async move {
            let link_up = {
                let mut state = self.state.write().await;
                state.sessions.insert(session_id.clone());
                state.outgoing_tx.is_some()
            };

            // Otherwise the connection loop connects it when the link comes up
            if link_up {
                self.enqueue(Message::Connect(SessionConnect { session_id }))
                    .await?;
            }
            Ok(())
        })
    }

    fn send(
        &self,
        session_id: &str,
        payload: Payload,
        correlation_id: Option<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        let message = Message::Send(SessionSend {
            session_id: session_id.to_string(),
            payload,
            correlation_id,
        });
        Box::pin(async move { self.enqueue(message).await })
    }

    fn control(
        &self,
        request: ControlRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.enqueue(Message::Control(request)).await })
    }

    fn disconnect(
        &self,
        session_id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        let session_id = session_id.to_string();

        Box::pin(async move {
            let link_up = {
                let mut state = self.state.write().await;
                state.sessions.remove(&session_id);
                state.outgoing_tx.is_some()
            };

            if link_up {
                self.enqueue(Message::Disconnect(SessionDisconnect { session_id }))
                    .await?;
            }
            Ok(())
        })
    }

    fn events(&self) -> Option<mpsc::Receiver<InboundFrame>> {
        // Returns None if already taken or if lock is contended
        match self.inbound_rx.try_write() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        }
    }
}
