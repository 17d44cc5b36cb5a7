//! Session management module.
//!
//! This module provides session records and the registry that owns them.
//! Sessions can be created, selected, listed and deleted through the
//! [`crate::manager::SessionStreamManager`] facade.

pub mod model;
pub mod registry;

pub use model::{Session, SessionContext, SessionId, SessionKind, SessionSpec, UsageCounters};
pub use registry::{SessionRegistry, StatusChange};
