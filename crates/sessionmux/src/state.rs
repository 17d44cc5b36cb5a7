//! State shared by the facade, the correlator and the dispatcher.
//!
//! Everything that mutates session records or in-flight units lives in one
//! [`ManagerState`] behind a single mutex. The lock is never held across a
//! network call.

use crate::assembler::{ChunkAssembler, StreamingUnit};
use crate::error::{ErrorCategory, LastErrors};
use crate::session::{Session, SessionId, SessionRegistry};

/// Change notifications broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A session was added or removed.
    SessionListChanged,
    /// A session record changed (status, counters, pause flag).
    SessionUpdated(Session),
    /// The current session changed.
    CurrentSessionChanged(Option<SessionId>),
    /// A session's sealed history changed.
    HistoryChanged(SessionId),
    /// The in-flight unit of the current session grew.
    StreamingUnitUpdated(StreamingUnit),
    /// A unit was sealed and appended to history.
    StreamingUnitSealed(StreamingUnit),
    /// An error was recorded.
    Error {
        /// Category slot the error was recorded in.
        category: ErrorCategory,
        /// Human-readable message.
        message: String,
    },
}

/// Registry, assembler and last-error slots.
#[derive(Debug, Default)]
pub struct ManagerState {
    /// Session records, history, current pointer.
    pub registry: SessionRegistry,
    /// In-flight units.
    pub assembler: ChunkAssembler,
    /// Last error per category.
    pub errors: LastErrors,
}

impl ManagerState {
    /// Creates empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an error and returns the matching event.
    pub fn record_error(&mut self, category: ErrorCategory, message: impl Into<String>) -> ManagerEvent {
        let message = message.into();
        self.errors.record(category, message.clone());
        ManagerEvent::Error { category, message }
    }

    /// Snapshot event for a session, if it still exists.
    pub fn session_updated(&self, id: &str) -> Option<ManagerEvent> {
        self.registry
            .get(id)
            .cloned()
            .map(ManagerEvent::SessionUpdated)
    }
}
