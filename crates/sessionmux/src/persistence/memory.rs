//! In-process session store.

use std::sync::Arc;

use dashmap::DashMap;

use super::{Persistence, PersistenceError, PersistenceResult};
use crate::assembler::StreamingUnit;
use crate::liveness::now_millis;
use crate::session::{Session, SessionId, SessionSpec};

/// A [`Persistence`] backed by concurrent maps.
///
/// Cloning shares the underlying store, so a test can keep a handle and
/// seed history while the manager holds another.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    sessions: Arc<DashMap<SessionId, Session>>,
    histories: Arc<DashMap<SessionId, Vec<StreamingUnit>>>,
}

impl MemoryPersistence {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a session record.
    pub fn insert_session(&self, session: Session) {
        self.histories.entry(session.id.clone()).or_default();
        self.sessions.insert(session.id.clone(), session);
    }

    /// Appends a unit to a session's stored history.
    pub fn push_history(&self, id: &str, unit: StreamingUnit) {
        self.histories.entry(id.to_string()).or_default().push(unit);
    }

    /// Mutates a stored session in place. Returns false if it is unknown.
    pub fn update_session(&self, id: &str, f: impl FnOnce(&mut Session)) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Persistence for MemoryPersistence {
    fn list_sessions(
        &self,
        scope_id: &str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = PersistenceResult<Vec<Session>>> + Send + '_>,
    > {
        let scope_id = scope_id.to_string();
        Box::pin(async move {
            let mut sessions: Vec<Session> = self
                .sessions
                .iter()
                .filter(|entry| entry.scope_id == scope_id)
                .map(|entry| entry.value().clone())
                .collect();
            sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(sessions)
        })
    }

    fn create_session(
        &self,
        spec: &SessionSpec,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PersistenceResult<Session>> + Send + '_>>
    {
        let spec = spec.clone();
        Box::pin(async move {
            let id = spec
                .id
                .clone()
                .ok_or_else(|| PersistenceError::Http("session id is required".to_string()))?;
            let session = spec.into_session(id, now_millis());
            self.insert_session(session.clone());
            Ok(session)
        })
    }

    fn get_session(
        &self,
        id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PersistenceResult<Session>> + Send + '_>>
    {
        let id = id.to_string();
        Box::pin(async move {
            self.sessions
                .get(&id)
                .map(|entry| entry.value().clone())
                .ok_or(PersistenceError::NotFound(id))
        })
    }

    fn get_history(
        &self,
        id: &str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = PersistenceResult<Vec<StreamingUnit>>> + Send + '_>,
    > {
        let id = id.to_string();
        Box::pin(async move {
            if !self.sessions.contains_key(&id) {
                return Err(PersistenceError::NotFound(id));
            }
            Ok(self
                .histories
                .get(&id)
                .map(|entry| entry.value().clone())
                .unwrap_or_default())
        })
    }

    fn delete_session(
        &self,
        id: &str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = PersistenceResult<()>> + Send + '_>>
    {
        let id = id.to_string();
        Box::pin(async move {
            self.histories.remove(&id);
            match self.sessions.remove(&id) {
                Some(_) => Ok(()),
                None => Err(PersistenceError::NotFound(id)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::UnitRole;
    use crate::session::SessionKind;

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryPersistence::new();
        let spec = SessionSpec::new("ws-1", "main", SessionKind::Chat).with_id("s1");
        let created = store.create_session(&spec).await.unwrap();
        assert_eq!(created.id, "s1");

        let fetched = store.get_session("s1").await.unwrap();
        assert_eq!(fetched, created);
        assert!(store.get_history("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_requires_id() {
        let store = MemoryPersistence::new();
        let spec = SessionSpec::new("ws-1", "main", SessionKind::Chat);
        assert!(store.create_session(&spec).await.is_err());
    }

    #[tokio::test]
    async fn test_list_filters_by_scope() {
        let store = MemoryPersistence::new();
        for (id, scope) in [("a", "ws-1"), ("b", "ws-2"), ("c", "ws-1")] {
            let spec = SessionSpec::new(scope, id, SessionKind::Terminal).with_id(id);
            store.create_session(&spec).await.unwrap();
        }
        let listed = store.list_sessions("ws-1").await.unwrap();
        let mut ids: Vec<_> = listed.into_iter().map(|s| s.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_missing_records() {
        let store = MemoryPersistence::new();
        assert_eq!(
            store.get_session("nope").await,
            Err(PersistenceError::NotFound("nope".to_string()))
        );
        assert!(matches!(
            store.get_history("nope").await,
            Err(PersistenceError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_session("nope").await,
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_history_and_delete() {
        let store = MemoryPersistence::new();
        let spec = SessionSpec::new("ws-1", "sh", SessionKind::Terminal).with_id("s1");
        store.create_session(&spec).await.unwrap();
        store.push_history("s1", StreamingUnit::sealed("s1", UnitRole::Output, "ok", 1));

        assert_eq!(store.get_history("s1").await.unwrap().len(), 1);
        store.delete_session("s1").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_update_session() {
        let store = MemoryPersistence::new();
        let spec = SessionSpec::new("ws-1", "sh", SessionKind::Terminal).with_id("s1");
        store.create_session(&spec).await.unwrap();

        assert!(store.update_session("s1", |s| s.counters.commands = 4));
        assert!(!store.update_session("s2", |_| {}));
        assert_eq!(store.get_session("s1").await.unwrap().counters.commands, 4);
    }
}
