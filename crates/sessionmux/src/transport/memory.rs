//! In-process transport.
//!
//! Records every outbound call and lets the caller inject inbound frames.
//! Failures and latency can be switched on to exercise error paths and
//! per-session ordering.

use std::sync::Arc;
use std::time::Duration;

use protocol::error::{ProtocolError, Result};
use protocol::{ControlRequest, InboundFrame, Payload, SessionSend};
use tokio::sync::{mpsc, Mutex, RwLock};

use super::{Transport, INBOUND_CHANNEL_CAPACITY};

/// An outbound call as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// `connect(session_id)`.
    Connect(String),
    /// `send(..)`.
    Send(SessionSend),
    /// `control(..)`.
    Control(ControlRequest),
    /// `disconnect(session_id)`.
    Disconnect(String),
}

impl Outbound {
    /// Session the call targeted.
    pub fn session_id(&self) -> &str {
        match self {
            Outbound::Connect(id) | Outbound::Disconnect(id) => id,
            Outbound::Send(send) => &send.session_id,
            Outbound::Control(request) => &request.session_id,
        }
    }
}

#[derive(Debug, Default)]
struct Behavior {
    fail_with: Option<String>,
    latency: Option<Duration>,
}

/// In-memory [`Transport`].
#[derive(Clone)]
pub struct MemoryTransport {
    sent: Arc<Mutex<Vec<Outbound>>>,
    behavior: Arc<RwLock<Behavior>>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    inbound_rx: Arc<RwLock<Option<mpsc::Receiver<InboundFrame>>>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Creates a transport with an empty log.
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            behavior: Arc::new(RwLock::new(Behavior::default())),
            inbound_tx,
            inbound_rx: Arc::new(RwLock::new(Some(inbound_rx))),
        }
    }

    /// Delivers an inbound frame as if it arrived from the server.
    pub async fn inject(&self, frame: InboundFrame) -> Result<()> {
        self.inbound_tx
            .send(frame)
            .await
            .map_err(|e| ProtocolError::ConnectionClosed(format!("inbound channel closed: {}", e)))
    }

    /// Makes every subsequent outbound call fail with `message`.
    pub async fn fail_with(&self, message: impl Into<String>) {
        self.behavior.write().await.fail_with = Some(message.into());
    }

    /// Clears an injected failure.
    pub async fn heal(&self) {
        self.behavior.write().await.fail_with = None;
    }

    /// Delays every outbound call.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.behavior.write().await.latency = latency;
    }

    /// Snapshot of all recorded calls, oldest first.
    pub async fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().await.clone()
    }

    /// Recorded calls for one session.
    pub async fn sent_to(&self, session_id: &str) -> Vec<Outbound> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|call| call.session_id() == session_id)
            .cloned()
            .collect()
    }

    /// Clears the call log.
    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }

    async fn record(&self, call: Outbound) -> Result<()> {
        let (fail_with, latency) = {
            let behavior = self.behavior.read().await;
            (behavior.fail_with.clone(), behavior.latency)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(message) = fail_with {
            return Err(ProtocolError::TransferFailed(message));
        }
        self.sent.lock().await.push(call);
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn connect(
        &self,
        session_id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        let call = Outbound::Connect(session_id.to_string());
        Box::pin(async move { self.record(call).await })
    }

    fn send(
        &self,
        session_id: &str,
        payload: Payload,
        correlation_id: Option<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        let call = Outbound::Send(SessionSend {
            session_id: session_id.to_string(),
            payload,
            correlation_id,
        });
        Box::pin(async move { self.record(call).await })
    }

    fn control(
        &self,
        request: ControlRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.record(Outbound::Control(request)).await })
    }

    fn disconnect(
        &self,
        session_id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        let call = Outbound::Disconnect(session_id.to_string());
        Box::pin(async move { self.record(call).await })
    }

    fn events(&self) -> Option<mpsc::Receiver<InboundFrame>> {
        match self.inbound_rx.try_write() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        }
    }
}
