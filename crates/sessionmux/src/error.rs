//! Error types for the session stream manager.

use std::collections::HashMap;
use std::fmt;

use protocol::ProtocolError;
use thiserror::Error;

use crate::liveness::{now_millis, LinkState};
use crate::persistence::PersistenceError;
use crate::session::SessionId;

/// Errors surfaced synchronously by manager operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// Bad session spec or operation arguments.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The session id is unknown.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Delivery or connectivity failure.
    #[error("transport error during {operation} on session {session_id}: {message}")]
    Transport {
        /// Operation that failed (e.g. "resize", "create_session").
        operation: String,
        /// Session the operation targeted.
        session_id: SessionId,
        /// Underlying failure description.
        message: String,
    },

    /// The session's status does not allow the operation.
    #[error("cannot {operation} session {session_id} in state {status:?}")]
    State {
        /// Session the operation targeted.
        session_id: SessionId,
        /// Status at the time of the call.
        status: LinkState,
        /// Operation that was refused.
        operation: String,
    },
}

/// Result type alias for manager operations.
pub type ManagerResult<T> = Result<T, ManagerError>;

impl ManagerError {
    /// Wraps a protocol error with operation context.
    pub fn transport(
        operation: impl Into<String>,
        session_id: impl Into<SessionId>,
        err: ProtocolError,
    ) -> Self {
        ManagerError::Transport {
            operation: operation.into(),
            session_id: session_id.into(),
            message: err.to_string(),
        }
    }

    /// Maps a persistence failure: missing records become `NotFound`,
    /// everything else is a delivery failure.
    pub fn persistence(
        operation: impl Into<String>,
        session_id: impl Into<SessionId>,
        err: PersistenceError,
    ) -> Self {
        let session_id = session_id.into();
        match err {
            PersistenceError::NotFound(id) => ManagerError::NotFound(id),
            other => ManagerError::Transport {
                operation: operation.into(),
                session_id,
                message: other.to_string(),
            },
        }
    }
}

/// Logical operation categories that each keep a last-error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Create, select, delete, list.
    Registry,
    /// Send, input, resize, signal, pause, resume, ping.
    Control,
    /// Inbound event processing.
    Stream,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Registry => "registry",
            ErrorCategory::Control => "control",
            ErrorCategory::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// A recorded error with the time it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Human-readable message.
    pub message: String,
    /// Unix milliseconds.
    pub at: u64,
}

/// Last error per category.
#[derive(Debug, Default)]
pub struct LastErrors {
    slots: HashMap<ErrorCategory, ErrorRecord>,
}

impl LastErrors {
    /// Records an error, replacing any previous one in the category.
    pub fn record(&mut self, category: ErrorCategory, message: impl Into<String>) {
        self.slots.insert(
            category,
            ErrorRecord {
                message: message.into(),
                at: now_millis(),
            },
        );
    }

    /// Returns the last error for a category.
    pub fn get(&self, category: ErrorCategory) -> Option<&ErrorRecord> {
        self.slots.get(&category)
    }

    /// Clears a category.
    pub fn clear(&mut self, category: ErrorCategory) {
        self.slots.remove(&category);
    }
}
