//! Session registry.
//!
//! The registry is the single owner of session records, their sealed
//! history, and the current-session pointer. Other components mutate
//! sessions only through the setters below.

use std::collections::HashMap;

use crate::assembler::StreamingUnit;
use crate::liveness::{self, LinkState, LivenessEvent};

use super::model::{Session, SessionId};

/// Result of applying a liveness event to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    /// State before the event.
    pub from: LinkState,
    /// State after the event.
    pub to: LinkState,
}

impl StatusChange {
    /// Whether the state actually changed.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Keyed store of sessions and history.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    histories: HashMap<SessionId, Vec<StreamingUnit>>,
    current: Option<SessionId>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record (last write wins). Returns true if the
    /// id was new.
    pub fn upsert(&mut self, session: Session) -> bool {
        let id = session.id.clone();
        let is_new = self.sessions.insert(id.clone(), session).is_none();
        if is_new {
            self.histories.entry(id).or_default();
        }
        is_new
    }

    /// Merges a record fetched from persistence. The local liveness snapshot
    /// and pause flag win because they are driven by the live transport.
    pub fn merge_remote(&mut self, remote: Session) -> &Session {
        let id = remote.id.clone();
        match self.sessions.get_mut(&id) {
            Some(local) => {
                local.name = remote.name;
                local.scope_id = remote.scope_id;
                local.kind = remote.kind;
                local.context = remote.context;
                local.created_at = remote.created_at;
                local.counters = local.counters.merge(&remote.counters);
            }
            None => {
                self.sessions.insert(id.clone(), remote);
                self.histories.entry(id.clone()).or_default();
            }
        }
        // The entry was just inserted or updated.
        &self.sessions[&id]
    }

    /// Removes a session and its history. Clears the current pointer if it
    /// pointed at the removed session.
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let removed = self.sessions.remove(id);
        self.histories.remove(id);
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
        removed
    }

    /// Looks up a session.
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Returns true if the id is known.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// All sessions, one per id, oldest first.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The current session id.
    pub fn current_id(&self) -> Option<&SessionId> {
        self.current.as_ref()
    }

    /// Returns true if `id` is the current session.
    pub fn is_current(&self, id: &str) -> bool {
        self.current.as_deref() == Some(id)
    }

    /// Sets the current session, returning the previous one.
    pub fn set_current(&mut self, id: Option<SessionId>) -> Option<SessionId> {
        std::mem::replace(&mut self.current, id)
    }

    /// Applies a liveness event through the pure tracker.
    pub fn apply_liveness(
        &mut self,
        id: &str,
        event: &LivenessEvent,
        now: u64,
    ) -> Option<StatusChange> {
        let session = self.sessions.get_mut(id)?;
        let from = session.liveness.state;
        session.liveness = liveness::transition(&session.liveness, event, now);
        Some(StatusChange {
            from,
            to: session.liveness.state,
        })
    }

    /// Bumps last activity without a liveness transition.
    pub fn touch(&mut self, id: &str, now: u64) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.liveness.last_activity_at = now;
        }
    }

    /// Counts bytes sent and bumps activity.
    pub fn record_sent(&mut self, id: &str, bytes: usize, now: u64) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.counters.bytes_sent += bytes as u64;
            session.liveness.last_activity_at = now;
        }
    }

    /// Counts bytes received.
    pub fn record_received(&mut self, id: &str, bytes: usize) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.counters.bytes_received += bytes as u64;
        }
    }

    /// Increments the chat message counter.
    pub fn increment_messages(&mut self, id: &str) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.counters.messages += 1;
        }
    }

    /// Increments the command counter.
    pub fn increment_commands(&mut self, id: &str) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.counters.commands += 1;
        }
    }

    /// Sets the pause flag.
    pub fn set_paused(&mut self, id: &str, paused: bool) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.paused = paused;
        }
    }

    /// Flags persisted history as changed while backgrounded.
    pub fn mark_history_stale(&mut self, id: &str, stale: bool) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.history_stale = stale;
        }
    }

    /// Appends a sealed unit. Units already present (same id) are skipped;
    /// returns false in that case or if the session is unknown.
    pub fn append_history(&mut self, id: &str, unit: StreamingUnit) -> bool {
        if !self.sessions.contains_key(id) {
            return false;
        }
        let history = self.histories.entry(id.to_string()).or_default();
        if history.iter().any(|existing| existing.id == unit.id) {
            return false;
        }
        history.push(unit);
        true
    }

    /// Replaces a session's history with a fetched copy.
    pub fn replace_history(&mut self, id: &str, units: Vec<StreamingUnit>) {
        if self.sessions.contains_key(id) {
            self.histories.insert(id.to_string(), units);
            self.mark_history_stale(id, false);
        }
    }

    /// Sealed history of a session.
    pub fn history(&self, id: &str) -> &[StreamingUnit] {
        self.histories.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Connected sessions whose heartbeat is older than `timeout`.
    pub fn expired(&self, now: u64, timeout: std::time::Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| liveness::is_expired(&s.liveness, now, timeout))
            .map(|s| s.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::UnitRole;
    use crate::session::{SessionKind, SessionSpec};
    use std::time::Duration;

    fn session(id: &str, created_at: u64) -> Session {
        SessionSpec::new("ws-1", format!("name-{}", id), SessionKind::Chat)
            .into_session(id.to_string(), created_at)
    }

    #[test]
    fn test_upsert_deduplicates_by_id() {
        let mut registry = SessionRegistry::new();
        assert!(registry.upsert(session("s1", 1)));

        let mut renamed = session("s1", 1);
        renamed.name = "renamed".to_string();
        assert!(!registry.upsert(renamed));

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "renamed");
    }

    #[test]
    fn test_list_is_ordered_by_creation() {
        let mut registry = SessionRegistry::new();
        registry.upsert(session("b", 20));
        registry.upsert(session("a", 10));
        registry.upsert(session("c", 20));
        let ids: Vec<_> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_clears_current() {
        let mut registry = SessionRegistry::new();
        registry.upsert(session("s1", 1));
        registry.set_current(Some("s1".to_string()));

        assert!(registry.remove("s1").is_some());
        assert!(registry.current_id().is_none());
        assert!(registry.history("s1").is_empty());
    }

    #[test]
    fn test_remove_other_keeps_current() {
        let mut registry = SessionRegistry::new();
        registry.upsert(session("s1", 1));
        registry.upsert(session("s2", 2));
        registry.set_current(Some("s1".to_string()));

        registry.remove("s2");
        assert!(registry.is_current("s1"));
    }

    #[test]
    fn test_set_current_returns_previous() {
        let mut registry = SessionRegistry::new();
        assert_eq!(registry.set_current(Some("s1".to_string())), None);
        assert_eq!(
            registry.set_current(Some("s2".to_string())),
            Some("s1".to_string())
        );
    }

    #[test]
    fn test_append_history_is_idempotent() {
        let mut registry = SessionRegistry::new();
        registry.upsert(session("s1", 1));
        let unit = StreamingUnit::sealed("s1", UnitRole::Assistant, "Hello", 5);

        assert!(registry.append_history("s1", unit.clone()));
        assert!(!registry.append_history("s1", unit));
        assert_eq!(registry.history("s1").len(), 1);
    }

    #[test]
    fn test_append_history_unknown_session() {
        let mut registry = SessionRegistry::new();
        let unit = StreamingUnit::sealed("ghost", UnitRole::User, "hi", 1);
        assert!(!registry.append_history("ghost", unit));
    }

    #[test]
    fn test_apply_liveness_reports_change() {
        let mut registry = SessionRegistry::new();
        registry.upsert(session("s1", 1));

        let change = registry
            .apply_liveness("s1", &LivenessEvent::ConnectAck, 10)
            .unwrap();
        assert_eq!(change.from, LinkState::Pending);
        assert_eq!(change.to, LinkState::Connected);
        assert!(change.changed());

        let change = registry
            .apply_liveness("s1", &LivenessEvent::Heartbeat, 20)
            .unwrap();
        assert!(!change.changed());
        assert_eq!(registry.get("s1").unwrap().last_activity_at(), 20);

        assert!(registry
            .apply_liveness("missing", &LivenessEvent::Heartbeat, 20)
            .is_none());
    }

    #[test]
    fn test_merge_remote_keeps_local_liveness() {
        let mut registry = SessionRegistry::new();
        registry.upsert(session("s1", 1));
        registry.apply_liveness("s1", &LivenessEvent::ConnectAck, 10);
        registry.set_paused("s1", true);

        registry.increment_commands("s1");
        let mut remote = session("s1", 1);
        remote.counters.messages = 7;
        remote.name = "server name".to_string();
        let merged = registry.merge_remote(remote);

        assert_eq!(merged.status(), LinkState::Connected);
        assert!(merged.paused);
        assert_eq!(merged.counters.messages, 7);
        assert_eq!(merged.counters.commands, 1);
        assert_eq!(merged.name, "server name");
    }

    #[test]
    fn test_counters() {
        let mut registry = SessionRegistry::new();
        registry.upsert(session("s1", 1));
        registry.record_sent("s1", 5, 50);
        registry.record_received("s1", 11);
        registry.increment_messages("s1");
        registry.increment_commands("s1");

        let s = registry.get("s1").unwrap();
        assert_eq!(s.counters.bytes_sent, 5);
        assert_eq!(s.counters.bytes_received, 11);
        assert_eq!(s.counters.messages, 1);
        assert_eq!(s.counters.commands, 1);
        assert_eq!(s.last_activity_at(), 50);
    }

    #[test]
    fn test_replace_history_clears_stale_flag() {
        let mut registry = SessionRegistry::new();
        registry.upsert(session("s1", 1));
        registry.mark_history_stale("s1", true);
        registry.replace_history(
            "s1",
            vec![StreamingUnit::sealed("s1", UnitRole::Output, "total 0", 3)],
        );
        assert!(!registry.get("s1").unwrap().history_stale);
        assert_eq!(registry.history("s1").len(), 1);
    }

    #[test]
    fn test_expired_lists_stale_connected_sessions() {
        let mut registry = SessionRegistry::new();
        registry.upsert(session("s1", 1));
        registry.upsert(session("s2", 2));
        registry.apply_liveness("s1", &LivenessEvent::ConnectAck, 0);
        registry.apply_liveness("s2", &LivenessEvent::ConnectAck, 50_000);

        let expired = registry.expired(40_000, Duration::from_secs(30));
        assert_eq!(expired, vec!["s1".to_string()]);
    }
}
