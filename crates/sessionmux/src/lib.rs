//! # SessionMux
//!
//! Client-side manager for many concurrent chat and terminal sessions
//! multiplexed over one streaming transport.
//!
//! ## Overview
//!
//! - **Session registry**: create, select, delete and list sessions through
//!   a Persistence API, with one current session at a time
//! - **Streaming assembly**: output chunks are folded into one in-flight
//!   unit per session and sealed into history when finished
//! - **Liveness**: heartbeat and close events drive a per-session link state
//!   machine; quiet sessions are expired by a periodic sweep
//! - **Control plane**: input, resize, signal, pause, resume and ping are
//!   serialized per session and reported, never retried
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   SessionStreamManager                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────┐  │
//! │  │   Session    │  │    Chunk     │  │    Last errors     │  │
//! │  │   Registry   │  │  Assembler   │  │   (per category)   │  │
//! │  └──────────────┘  └──────────────┘  └────────────────────┘  │
//! │         ▲ correlator (inbound)     dispatcher (outbound) │   │
//! │  ┌──────┴───────────────────────────────────────────────▼─┐  │
//! │  │                  Transport (one link)                  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                  Persistence API                       │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sessionmux::{
//!     Config, HttpPersistence, SessionKind, SessionSpec, SessionStreamManager,
//!     WebSocketTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let transport = Arc::new(WebSocketTransport::new(config.websocket_config()));
//!     transport.clone().start();
//!     let persistence = Arc::new(HttpPersistence::new(
//!         &config.persistence.base_url,
//!         config.request_timeout(),
//!     )?);
//!
//!     let manager = SessionStreamManager::new(transport, persistence, config.manager_options());
//!     manager.start()?;
//!
//!     let session = manager
//!         .create_session(SessionSpec::new("default", "build", SessionKind::Terminal))
//!         .await?;
//!     manager.send_input(&session.id, "cargo --version\n").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session records and the registry
//! - [`liveness`]: Link state machine
//! - [`assembler`]: Streaming unit assembly
//! - [`correlator`]: Inbound frame routing
//! - [`dispatcher`]: Per-session outbound queues
//! - [`transport`]: WebSocket and in-memory transports
//! - [`persistence`]: HTTP and in-memory Persistence API clients
//! - [`manager`]: The facade

pub mod assembler;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod liveness;
pub mod manager;
pub mod persistence;
pub mod session;
pub mod state;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use error::{ErrorCategory, ErrorRecord, ManagerError, ManagerResult};

pub use session::{Session, SessionContext, SessionId, SessionKind, SessionSpec, UsageCounters};

pub use liveness::{LinkState, Liveness, LivenessEvent};

pub use assembler::{StreamingUnit, UnitRole};

pub use state::ManagerEvent;

pub use transport::{LinkStatus, MemoryTransport, Transport, WebSocketConfig, WebSocketTransport};

pub use persistence::{HttpPersistence, MemoryPersistence, Persistence, PersistenceError};

pub use manager::{CompletionHook, ManagerOptions, SessionStreamManager};
