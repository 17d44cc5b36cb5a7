//! Duplex transport shared by all sessions.
//!
//! A transport carries outbound connect/send/control/disconnect requests and
//! delivers inbound [`InboundFrame`]s through a take-once receiver. One
//! transport instance serves every session of a manager.
//!
//! - [`websocket::WebSocketTransport`]: one WebSocket for all sessions
//! - [`memory::MemoryTransport`]: in-process, for tests and demos

pub mod memory;
pub mod websocket;

pub use memory::{MemoryTransport, Outbound};
pub use websocket::{LinkStatus, WebSocketConfig, WebSocketTransport};

use protocol::error::Result;
use protocol::{ControlRequest, InboundFrame, Payload};
use tokio::sync::mpsc;

/// Capacity of the inbound frame channel handed out by [`Transport::events`].
pub const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Operations the manager needs from the wire.
///
/// This trait abstracts the transport, allowing for different
/// implementations (e.g., WebSocket, in-memory for testing).
pub trait Transport: Send + Sync {
    /// Opens the server-side stream of a session.
    fn connect(
        &self,
        session_id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>>;

    /// Sends data (chat text) to a session.
    fn send(
        &self,
        session_id: &str,
        payload: Payload,
        correlation_id: Option<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>>;

    /// Sends an out-of-band control operation.
    fn control(
        &self,
        request: ControlRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>>;

    /// Closes the server-side stream of a session.
    fn disconnect(
        &self,
        session_id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>>;

    /// Returns the inbound frame receiver.
    /// Returns None if the receiver has already been taken or if the lock is contended.
    fn events(&self) -> Option<mpsc::Receiver<InboundFrame>>;
}
