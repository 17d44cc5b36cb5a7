//! Session records and creation specs.

use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, ManagerResult};
use crate::liveness::{LinkState, Liveness};

/// Unique identifier for a session.
pub type SessionId = String;

/// What a session multiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Conversational session; content is text.
    #[default]
    Chat,
    /// Remote shell; content is terminal output.
    Terminal,
}

/// Working context of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionContext {
    /// Working directory.
    pub working_dir: Option<String>,
    /// Model name for chat sessions.
    pub model: Option<String>,
    /// Shell command for terminal sessions.
    pub shell: Option<String>,
}

/// Usage counters maintained by the control and stream paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageCounters {
    /// Chat messages sent.
    pub messages: u64,
    /// Terminal commands issued or completed.
    pub commands: u64,
    /// Bytes sent to the session.
    pub bytes_sent: u64,
    /// Bytes received from the session.
    pub bytes_received: u64,
}

impl UsageCounters {
    /// Per-field maximum. Local counts may run ahead of the server and the
    /// server may have counted work done while the session was backgrounded.
    pub fn merge(&self, other: &UsageCounters) -> UsageCounters {
        UsageCounters {
            messages: self.messages.max(other.messages),
            commands: self.commands.max(other.commands),
            bytes_sent: self.bytes_sent.max(other.bytes_sent),
            bytes_received: self.bytes_received.max(other.bytes_received),
        }
    }
}

/// A logical session multiplexed over the shared transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Owning workspace/scope.
    pub scope_id: String,
    /// Display name.
    pub name: String,
    /// Chat or terminal.
    #[serde(default)]
    pub kind: SessionKind,
    /// Connection state and timestamps.
    #[serde(flatten)]
    pub liveness: Liveness,
    /// Working context.
    #[serde(default)]
    pub context: SessionContext,
    /// Creation time (Unix millis).
    pub created_at: u64,
    /// Usage counters.
    #[serde(default)]
    pub counters: UsageCounters,
    /// Output delivery paused by the client.
    #[serde(default)]
    pub paused: bool,
    /// Persisted history changed while the session was in the background.
    #[serde(default, skip_serializing)]
    pub history_stale: bool,
}

impl Session {
    /// Current connection state.
    pub fn status(&self) -> LinkState {
        self.liveness.state
    }

    /// Last activity time (Unix millis).
    pub fn last_activity_at(&self) -> u64 {
        self.liveness.last_activity_at
    }
}

/// Parameters for creating a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Explicit id; allocated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SessionId>,
    /// Owning workspace/scope.
    pub scope_id: String,
    /// Display name.
    pub name: String,
    /// Chat or terminal.
    #[serde(default)]
    pub kind: SessionKind,
    /// Working context.
    #[serde(default)]
    pub context: SessionContext,
    /// Initial terminal columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    /// Initial terminal rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

impl SessionSpec {
    /// Creates a spec with the required fields.
    pub fn new(scope_id: impl Into<String>, name: impl Into<String>, kind: SessionKind) -> Self {
        Self {
            scope_id: scope_id.into(),
            name: name.into(),
            kind,
            ..Default::default()
        }
    }

    /// Sets an explicit id.
    pub fn with_id(mut self, id: impl Into<SessionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the working context.
    pub fn with_context(mut self, context: SessionContext) -> Self {
        self.context = context;
        self
    }

    /// Sets the initial terminal size.
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = Some(cols);
        self.rows = Some(rows);
        self
    }

    /// Checks required fields.
    pub fn validate(&self) -> ManagerResult<()> {
        if self.scope_id.trim().is_empty() {
            return Err(ManagerError::Validation("scope_id is required".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(ManagerError::Validation("name is required".to_string()));
        }
        if let Some(id) = &self.id {
            if id.trim().is_empty() {
                return Err(ManagerError::Validation(
                    "id must not be blank when given".to_string(),
                ));
            }
        }
        if self.cols == Some(0) || self.rows == Some(0) {
            return Err(ManagerError::Validation(
                "terminal size must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the initial record for this spec.
    pub fn into_session(self, id: SessionId, now: u64) -> Session {
        Session {
            id,
            scope_id: self.scope_id,
            name: self.name,
            kind: self.kind,
            liveness: Liveness::pending(now),
            context: self.context,
            created_at: now,
            counters: UsageCounters::default(),
            paused: false,
            history_stale: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_validation() {
        assert!(SessionSpec::new("ws-1", "main", SessionKind::Chat)
            .validate()
            .is_ok());

        let missing_scope = SessionSpec::new("", "main", SessionKind::Chat);
        assert!(matches!(
            missing_scope.validate(),
            Err(ManagerError::Validation(_))
        ));

        let missing_name = SessionSpec::new("ws-1", "  ", SessionKind::Terminal);
        assert!(matches!(
            missing_name.validate(),
            Err(ManagerError::Validation(_))
        ));

        let zero_size = SessionSpec::new("ws-1", "sh", SessionKind::Terminal).with_size(0, 24);
        assert!(matches!(
            zero_size.validate(),
            Err(ManagerError::Validation(_))
        ));

        let blank_id = SessionSpec::new("ws-1", "sh", SessionKind::Terminal).with_id("");
        assert!(blank_id.validate().is_err());
    }

    #[test]
    fn test_into_session_starts_pending() {
        let session = SessionSpec::new("ws-1", "main", SessionKind::Terminal)
            .into_session("s1".to_string(), 42);
        assert_eq!(session.status(), LinkState::Pending);
        assert_eq!(session.created_at, 42);
        assert_eq!(session.last_activity_at(), 42);
        assert_eq!(session.counters, UsageCounters::default());
    }

    #[test]
    fn test_session_json_shape() {
        let session = SessionSpec::new("ws-1", "main", SessionKind::Chat)
            .into_session("s1".to_string(), 1000);
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["id"], "s1");
        assert_eq!(json["kind"], "chat");
        assert_eq!(json["state"], "pending");
        assert_eq!(json["last_activity_at"], 1000);
        assert!(json.get("history_stale").is_none());
    }

    #[test]
    fn test_session_parses_sparse_record() {
        let json = r#"{
            "id": "s7",
            "scope_id": "ws-1",
            "name": "build",
            "state": "connected",
            "last_activity_at": 5,
            "created_at": 1
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.status(), LinkState::Connected);
        assert_eq!(session.kind, SessionKind::Chat);
        assert_eq!(session.counters.messages, 0);
    }
}
