//! Protocol message definitions for SessionMux.
//!
//! This module defines the frames a transport delivers to the session
//! stream manager and the requests the manager sends back. Messages are
//! exchanged as JSON text or MessagePack binary, wrapped in a sequenced
//! [`Envelope`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope wrapper for all protocol messages.
///
/// The envelope provides versioning and sequence numbers for message ordering
/// and compatibility checking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Sequence number for message ordering and acknowledgment.
    pub sequence: u64,
    /// The actual message payload.
    pub payload: Message,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }
}

/// Top-level message enum containing all message types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    // Client to server
    /// Open the server-side stream for a session.
    Connect(SessionConnect),
    /// Send a chat message or raw data to a session.
    Send(SessionSend),
    /// Out-of-band control operation.
    Control(ControlRequest),
    /// Close the server-side stream for a session.
    Disconnect(SessionDisconnect),

    // Server to client
    /// A tagged event for one session.
    Frame(InboundFrame),
}

// ============================================================================
// Outbound Messages
// ============================================================================

/// Request to open a session stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConnect {
    /// Session to connect.
    pub session_id: String,
}

/// Request to close a session stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDisconnect {
    /// Session to disconnect.
    pub session_id: String,
}

/// Data sent to a session outside the control channel (chat text).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSend {
    /// Target session.
    pub session_id: String,
    /// Content to deliver.
    pub payload: Payload,
    /// Optional correlation id echoed back in acknowledgements.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// A control operation addressed to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Target session.
    pub session_id: String,
    /// The operation to perform.
    pub op: ControlOp,
    /// Optional idempotency/correlation id.
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ControlRequest {
    /// Creates a control request without a correlation id.
    pub fn new(session_id: impl Into<String>, op: ControlOp) -> Self {
        Self {
            session_id: session_id.into(),
            op,
            correlation_id: None,
        }
    }
}

/// Out-of-band operations distinct from data flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum ControlOp {
    /// Raw input bytes for a terminal.
    Input {
        /// Bytes to write.
        #[serde(with = "crate::bytes")]
        data: Vec<u8>,
    },
    /// Terminal resize.
    Resize {
        /// New terminal columns.
        cols: u16,
        /// New terminal rows.
        rows: u16,
    },
    /// Deliver a signal to the session's foreground process.
    Signal {
        /// Which signal to send.
        signal: SignalKind,
    },
    /// Pause output delivery.
    Pause,
    /// Resume output delivery.
    Resume,
    /// Liveness probe.
    Ping {
        /// Timestamp when the ping was sent (Unix millis).
        timestamp: u64,
    },
}

impl ControlOp {
    /// Short operation name used in logs and error context.
    pub fn name(&self) -> &'static str {
        match self {
            ControlOp::Input { .. } => "input",
            ControlOp::Resize { .. } => "resize",
            ControlOp::Signal { .. } => "signal",
            ControlOp::Pause => "pause",
            ControlOp::Resume => "resume",
            ControlOp::Ping { .. } => "ping",
        }
    }
}

/// The closed set of signals a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    /// SIGINT.
    Int,
    /// SIGTERM.
    Term,
    /// SIGKILL.
    Kill,
}

impl SignalKind {
    /// POSIX signal number.
    pub fn number(self) -> i32 {
        match self {
            SignalKind::Int => 2,
            SignalKind::Term => 15,
            SignalKind::Kill => 9,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Int => "INT",
            SignalKind::Term => "TERM",
            SignalKind::Kill => "KILL",
        };
        f.write_str(name)
    }
}

impl FromStr for SignalKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "INT" => Ok(SignalKind::Int),
            "TERM" => Ok(SignalKind::Term),
            "KILL" => Ok(SignalKind::Kill),
            _ => Err(ProtocolError::InvalidPayload(format!(
                "unsupported signal: {}",
                s
            ))),
        }
    }
}

// ============================================================================
// Inbound Frames
// ============================================================================

/// Discriminant of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// The server accepted a connect request.
    Connected,
    /// Periodic keep-alive.
    Heartbeat,
    /// Free-form remote status string.
    Status,
    /// A chunk of streamed output.
    Output,
    /// A command or reply finished.
    CommandComplete,
    /// Fatal error for the session.
    Error,
    /// The server closed the session stream.
    Closed,
    /// Acknowledgement of a control operation.
    Ack,
}

impl FrameKind {
    /// Whether the frame carries output that feeds the assembler.
    pub fn is_output(self) -> bool {
        matches!(self, FrameKind::Output | FrameKind::CommandComplete)
    }
}

/// Frame content: nothing, text, or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// No content.
    #[default]
    Empty,
    /// UTF-8 text (chat deltas, status strings, error messages).
    Text(String),
    /// Raw bytes (terminal output).
    Binary(#[serde(with = "crate::bytes")] Vec<u8>),
}

impl Payload {
    /// Returns true if there is no content.
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Text(text) => text.is_empty(),
            Payload::Binary(data) => data.is_empty(),
        }
    }

    /// Content length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Payload::Empty => 0,
            Payload::Text(text) => text.len(),
            Payload::Binary(data) => data.len(),
        }
    }

    /// Borrows the content as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(data) => data,
        }
    }

    /// Converts to text, failing on invalid UTF-8.
    pub fn into_text(self) -> Result<String, ProtocolError> {
        match self {
            Payload::Empty => Ok(String::new()),
            Payload::Text(text) => Ok(text),
            Payload::Binary(data) => String::from_utf8(data)
                .map_err(|e| ProtocolError::InvalidPayload(format!("invalid UTF-8: {}", e))),
        }
    }

    /// Converts to text, replacing invalid UTF-8 sequences.
    pub fn into_text_lossy(self) -> String {
        match self {
            Payload::Empty => String::new(),
            Payload::Text(text) => text,
            Payload::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Binary(data)
    }
}

/// A tagged event for a single session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    /// Session this frame belongs to.
    pub session_id: String,
    /// Frame discriminant.
    pub kind: FrameKind,
    /// Frame content.
    #[serde(default)]
    pub payload: Payload,
    /// Terminal flag: the current streamed unit is complete.
    #[serde(default)]
    pub finished: bool,
    /// Server-assigned id of the unit this chunk belongs to.
    #[serde(default)]
    pub unit_id: Option<String>,
    /// Correlation id of the request that caused this frame.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Exit code for completed commands.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl InboundFrame {
    /// Creates a frame with an empty payload.
    pub fn new(session_id: impl Into<String>, kind: FrameKind) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            payload: Payload::Empty,
            finished: false,
            unit_id: None,
            correlation_id: None,
            exit_code: None,
        }
    }

    /// An output chunk.
    pub fn output(
        session_id: impl Into<String>,
        payload: impl Into<Payload>,
        finished: bool,
    ) -> Self {
        Self {
            payload: payload.into(),
            finished,
            ..Self::new(session_id, FrameKind::Output)
        }
    }

    /// A command-complete frame carrying optional trailing content.
    pub fn command_complete(
        session_id: impl Into<String>,
        payload: impl Into<Payload>,
        exit_code: Option<i32>,
    ) -> Self {
        Self {
            payload: payload.into(),
            finished: true,
            exit_code,
            ..Self::new(session_id, FrameKind::CommandComplete)
        }
    }

    /// A connect acknowledgement.
    pub fn connected(session_id: impl Into<String>) -> Self {
        Self::new(session_id, FrameKind::Connected)
    }

    /// A heartbeat.
    pub fn heartbeat(session_id: impl Into<String>) -> Self {
        Self::new(session_id, FrameKind::Heartbeat)
    }

    /// A stream-closed notification.
    pub fn closed(session_id: impl Into<String>) -> Self {
        Self::new(session_id, FrameKind::Closed)
    }

    /// A fatal error report.
    pub fn error(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            payload: Payload::Text(message.into()),
            ..Self::new(session_id, FrameKind::Error)
        }
    }

    /// Sets the unit id.
    pub fn with_unit_id(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

// ============================================================================
// Serialization helpers
// ============================================================================

impl Envelope {
    /// Serialize the envelope to MessagePack bytes (named fields).
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Serialize the envelope to a JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize an envelope from a JSON string.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
