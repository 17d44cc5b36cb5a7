//! Persistence API client.
//!
//! Sessions and their sealed history are stored server-side. The manager
//! only talks to the store through the [`Persistence`] trait:
//! - [`http::HttpPersistence`]: JSON over HTTP
//! - [`memory::MemoryPersistence`]: in-process store for tests and offline use

pub mod http;
pub mod memory;

pub use http::HttpPersistence;
pub use memory::MemoryPersistence;

use thiserror::Error;

use crate::assembler::StreamingUnit;
use crate::session::{Session, SessionSpec};

/// Errors returned by a persistence backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The requested record does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The request failed or returned an unexpected status.
    #[error("request failed: {0}")]
    Http(String),

    /// The response body could not be decoded.
    #[error("invalid response body: {0}")]
    Decode(String),
}

/// Result type alias for persistence calls.
pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

/// The five calls the manager makes against the session store.
pub trait Persistence: Send + Sync {
    /// Lists the sessions of a scope.
    fn list_sessions(
        &self,
        scope_id: &str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = PersistenceResult<Vec<Session>>> + Send + '_>,
    >;

    /// Creates a session. `spec.id` is always set by the caller.
    fn create_session(
        &self,
        spec: &SessionSpec,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PersistenceResult<Session>> + Send + '_>>;

    /// Fetches one session.
    fn get_session(
        &self,
        id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PersistenceResult<Session>> + Send + '_>>;

    /// Fetches the sealed history of a session, oldest first.
    fn get_history(
        &self,
        id: &str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = PersistenceResult<Vec<StreamingUnit>>> + Send + '_>,
    >;

    /// Deletes a session and its history.
    fn delete_session(
        &self,
        id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PersistenceResult<()>> + Send + '_>>;
}
