//! # SessionMux Protocol Library
//!
//! Wire types shared between the session stream manager and the server
//! that multiplexes chat and terminal sessions over one connection.
//!
//! ## Overview
//!
//! - **Inbound frames**: tagged events for a single session (output chunks,
//!   heartbeats, status changes, completion markers)
//! - **Outbound messages**: connect, send, control and disconnect requests
//! - **Control operations**: input, resize, signal, pause/resume, ping
//! - **Envelope**: versioned, sequenced wrapper with JSON and MessagePack codecs
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  JSON text / MessagePack
//! ├─────────────────────────────────────────┤
//! │               Envelope                  │  version + sequence
//! ├─────────────────────────────────────────┤
//! │        Transport (WebSocket/pub-sub)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, InboundFrame, Message};
//!
//! let frame = InboundFrame::output("session-1", "Hel", false);
//! let envelope = Envelope::new(1, Message::Frame(frame));
//!
//! let json = envelope.to_json().unwrap();
//! let decoded = Envelope::from_json(&json).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

pub mod bytes;
pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ControlOp, ControlRequest, Envelope, FrameKind, InboundFrame, Message, Payload,
    SessionConnect, SessionDisconnect, SessionSend, SignalKind, PROTOCOL_VERSION,
};
