//! Session stream manager facade.
//!
//! [`SessionStreamManager`] ties the pieces together:
//! - registry operations go through the Persistence API, then update the
//!   shared [`ManagerState`]
//! - control operations are validated against the state and queued on the
//!   [`ControlDispatcher`]
//! - a pump task feeds inbound frames to the correlator in arrival order
//! - a sweep task expires sessions whose heartbeat went quiet
//!
//! The state mutex is released before every network call. Changes are
//! published on a broadcast channel (see [`SessionStreamManager::subscribe`]).

use std::sync::Arc;
use std::time::Duration;

use protocol::{ControlOp, ControlRequest, InboundFrame, Payload, SignalKind};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::assembler::{StreamingUnit, UnitRole};
use crate::correlator;
use crate::dispatcher::{check_target, require_kind, validate_op, ControlDispatcher, OutboundCall};
use crate::error::{ErrorCategory, ErrorRecord, ManagerError, ManagerResult};
use crate::liveness::{self, now_millis, LinkState, Liveness, LivenessEvent};
use crate::persistence::Persistence;
use crate::session::{Session, SessionId, SessionKind, SessionSpec};
use crate::state::{ManagerEvent, ManagerState};
use crate::transport::Transport;

/// Called with every unit sealed from the stream.
pub type CompletionHook = Arc<dyn Fn(&StreamingUnit) + Send + Sync>;

/// Tunables of a manager instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerOptions {
    /// A connected session with an older heartbeat is considered dead.
    pub heartbeat_timeout: Duration,
    /// How often the liveness sweep runs.
    pub liveness_sweep_interval: Duration,
    /// Capacity of each per-session control queue.
    pub control_queue_capacity: usize,
    /// Capacity of the change broadcast channel.
    pub broadcast_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            liveness_sweep_interval: Duration::from_secs(5),
            control_queue_capacity: 64,
            broadcast_capacity: 256,
        }
    }
}

/// Client-side manager of many sessions over one transport.
#[derive(Clone)]
pub struct SessionStreamManager {
    state: Arc<Mutex<ManagerState>>,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn Persistence>,
    dispatcher: Arc<ControlDispatcher>,
    event_tx: broadcast::Sender<ManagerEvent>,
    options: ManagerOptions,
    completion_hook: Option<CompletionHook>,
    shutdown_token: CancellationToken,
}

impl SessionStreamManager {
    /// Creates a manager. Call [`SessionStreamManager::start`] to begin
    /// processing inbound frames.
    pub fn new(
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn Persistence>,
        options: ManagerOptions,
    ) -> Self {
        let shutdown_token = CancellationToken::new();
        let dispatcher = ControlDispatcher::new(
            Arc::clone(&transport),
            options.control_queue_capacity,
            shutdown_token.clone(),
        );
        let (event_tx, _) = broadcast::channel(options.broadcast_capacity.max(1));

        Self {
            state: Arc::new(Mutex::new(ManagerState::new())),
            transport,
            persistence,
            dispatcher: Arc::new(dispatcher),
            event_tx,
            options,
            completion_hook: None,
            shutdown_token,
        }
    }

    /// Registers a hook run for every unit sealed from the stream.
    pub fn with_completion_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StreamingUnit) + Send + Sync + 'static,
    {
        self.completion_hook = Some(Arc::new(hook));
        self
    }

    /// Returns a receiver for change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.event_tx.subscribe()
    }

    /// The options this manager runs with.
    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Starts the inbound pump and the liveness sweep.
    pub fn start(&self) -> ManagerResult<()> {
        let frames = self.transport.events().ok_or_else(|| {
            ManagerError::Validation("transport events were already taken".to_string())
        })?;

        let pump = self.clone();
        tokio::spawn(async move {
            pump.run_pump(frames).await;
        });

        let sweeper = self.clone();
        tokio::spawn(async move {
            sweeper.run_sweep().await;
        });

        tracing::info!(
            heartbeat_timeout = ?self.options.heartbeat_timeout,
            "Session stream manager started"
        );
        Ok(())
    }

    /// Stops background tasks and control workers.
    pub fn shutdown(&self) {
        tracing::info!("Stopping session stream manager");
        self.shutdown_token.cancel();
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    // ------------------------------------------------------------------
    // Registry operations
    // ------------------------------------------------------------------

    /// Creates a session, makes it current and opens its stream.
    ///
    /// If the stream cannot be opened the session stays registered in the
    /// `Error` state and a transport error is returned.
    pub async fn create_session(&self, spec: SessionSpec) -> ManagerResult<Session> {
        let result = self.create_session_inner(spec).await;
        self.track(ErrorCategory::Registry, result).await
    }

    async fn create_session_inner(&self, spec: SessionSpec) -> ManagerResult<Session> {
        spec.validate()?;
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let size = spec.cols.zip(spec.rows);
        let spec = SessionSpec {
            id: Some(id.clone()),
            ..spec
        };

        let mut session = self
            .persistence
            .create_session(&spec)
            .await
            .map_err(|e| ManagerError::persistence("create_session", id.as_str(), e))?;
        session.liveness = Liveness::pending(now_millis());
        session.paused = false;

        {
            let mut state = self.state.lock().await;
            state.registry.upsert(session);
            state.assembler.reset(&id);
            let previous = state.registry.set_current(Some(id.clone()));
            if let Some(previous) = previous.filter(|p| *p != id) {
                state.assembler.reset(&previous);
            }
        }
        tracing::info!(session_id = %id, kind = ?spec.kind, "Session created");
        self.emit(ManagerEvent::SessionListChanged);
        self.emit(ManagerEvent::CurrentSessionChanged(Some(id.clone())));

        self.open_stream(&id).await?;
        if let Some((cols, rows)) = size {
            self.control_inner(&id, ControlOp::Resize { cols, rows })
                .await?;
        }

        self.session(&id)
            .await
            .ok_or_else(|| ManagerError::NotFound(id.clone()))
    }

    /// Makes `id` current, loading its record and history through the
    /// Persistence API. In-flight units of the previous and the target
    /// session are dropped.
    pub async fn select_session(&self, id: &str) -> ManagerResult<Session> {
        let result = self.select_session_inner(id).await;
        self.track(ErrorCategory::Registry, result).await
    }

    async fn select_session_inner(&self, id: &str) -> ManagerResult<Session> {
        let (remote, history) = tokio::join!(
            self.persistence.get_session(id),
            self.persistence.get_history(id)
        );
        let mut remote = remote.map_err(|e| ManagerError::persistence("select_session", id, e))?;
        let history = history.map_err(|e| ManagerError::persistence("select_session", id, e))?;

        let (session, changed) = {
            let mut state = self.state.lock().await;
            if !state.registry.contains(id) {
                remote.liveness = Liveness::pending(now_millis());
            }
            let session = state.registry.merge_remote(remote).clone();
            state.registry.replace_history(id, history);

            let previous = state.registry.set_current(Some(id.to_string()));
            if let Some(previous) = &previous {
                state.assembler.reset(previous);
            }
            state.assembler.reset(id);
            (session, previous.as_deref() != Some(id))
        };

        tracing::info!(session_id = %id, status = ?session.status(), "Session selected");
        self.emit(ManagerEvent::SessionUpdated(session.clone()));
        self.emit(ManagerEvent::HistoryChanged(id.to_string()));
        if changed {
            self.emit(ManagerEvent::CurrentSessionChanged(Some(id.to_string())));
        }

        if session.status() == LinkState::Pending {
            self.open_stream(id).await?;
        }
        Ok(self.session(id).await.unwrap_or(session))
    }

    /// Deletes a session. Clears the current selection if it pointed at it.
    pub async fn delete_session(&self, id: &str) -> ManagerResult<()> {
        let result = self.delete_session_inner(id).await;
        self.track(ErrorCategory::Registry, result).await
    }

    async fn delete_session_inner(&self, id: &str) -> ManagerResult<()> {
        if !self.state.lock().await.registry.contains(id) {
            return Err(ManagerError::NotFound(id.to_string()));
        }

        match self.persistence.delete_session(id).await {
            Ok(()) => {}
            Err(crate::persistence::PersistenceError::NotFound(_)) => {
                tracing::debug!(session_id = %id, "Session already gone from store");
            }
            Err(e) => return Err(ManagerError::persistence("delete_session", id, e)),
        }

        let was_current = {
            let mut state = self.state.lock().await;
            let was_current = state.registry.is_current(id);
            state.registry.remove(id);
            state.assembler.forget(id);
            was_current
        };
        tracing::info!(session_id = %id, "Session deleted");
        self.emit(ManagerEvent::SessionListChanged);
        if was_current {
            self.emit(ManagerEvent::CurrentSessionChanged(None));
        }

        if let Err(e) = self.dispatcher.dispatch(id, OutboundCall::Disconnect).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to close session stream");
        }
        self.dispatcher.remove(id);
        Ok(())
    }

    /// All known sessions, oldest first, one entry per id.
    pub async fn list_sessions(&self) -> Vec<Session> {
        self.state.lock().await.registry.list()
    }

    /// Merges the sessions of `scope_id` from the Persistence API into the
    /// registry and returns the full list.
    pub async fn refresh_sessions(&self, scope_id: &str) -> ManagerResult<Vec<Session>> {
        let result = self.refresh_sessions_inner(scope_id).await;
        self.track(ErrorCategory::Registry, result).await
    }

    async fn refresh_sessions_inner(&self, scope_id: &str) -> ManagerResult<Vec<Session>> {
        let remote = self
            .persistence
            .list_sessions(scope_id)
            .await
            .map_err(|e| ManagerError::persistence("refresh_sessions", "", e))?;

        let sessions = {
            let mut state = self.state.lock().await;
            let now = now_millis();
            for mut session in remote {
                if !state.registry.contains(&session.id) {
                    session.liveness = Liveness::pending(now);
                }
                state.registry.merge_remote(session);
            }
            state.registry.list()
        };
        tracing::debug!(scope_id = %scope_id, count = sessions.len(), "Sessions refreshed");
        self.emit(ManagerEvent::SessionListChanged);
        Ok(sessions)
    }

    // ------------------------------------------------------------------
    // Data and control operations
    // ------------------------------------------------------------------

    /// Sends a chat message. The message is recorded in history as a sealed
    /// `User` unit before it is sent; the reply streams in through the
    /// inbound pump.
    pub async fn send_message(&self, session_id: &str, text: &str) -> ManagerResult<StreamingUnit> {
        let result = self.send_message_inner(session_id, text).await;
        self.track(ErrorCategory::Control, result).await
    }

    async fn send_message_inner(&self, session_id: &str, text: &str) -> ManagerResult<StreamingUnit> {
        if text.trim().is_empty() {
            return Err(ManagerError::Validation("message must not be empty".to_string()));
        }

        let (unit, updated) = {
            let mut state = self.state.lock().await;
            let kind = check_target(&state, session_id, "send_message")?;
            require_kind(session_id, kind, SessionKind::Chat, "send_message")?;
            let now = now_millis();
            let unit = StreamingUnit::sealed(session_id, UnitRole::User, text, now);
            state.registry.append_history(session_id, unit.clone());
            state.registry.increment_messages(session_id);
            state.registry.record_sent(session_id, text.len(), now);
            (unit, state.session_updated(session_id))
        };
        self.emit(ManagerEvent::HistoryChanged(session_id.to_string()));
        if let Some(event) = updated {
            self.emit(event);
        }

        self.dispatcher
            .dispatch(
                session_id,
                OutboundCall::Send {
                    payload: Payload::Text(text.to_string()),
                    correlation_id: Some(unit.id.clone()),
                },
            )
            .await?;
        Ok(unit)
    }

    /// Writes raw input to a terminal session. A UTF-8 line ending in a
    /// newline is also recorded as a sealed `Command` unit.
    pub async fn send_input(&self, session_id: &str, data: impl Into<Vec<u8>>) -> ManagerResult<()> {
        let result = self.send_input_inner(session_id, data.into()).await;
        self.track(ErrorCategory::Control, result).await
    }

    async fn send_input_inner(&self, session_id: &str, data: Vec<u8>) -> ManagerResult<()> {
        if data.is_empty() {
            return Err(ManagerError::Validation("input must not be empty".to_string()));
        }

        let events = {
            let mut state = self.state.lock().await;
            let kind = check_target(&state, session_id, "input")?;
            require_kind(session_id, kind, SessionKind::Terminal, "input")?;
            let now = now_millis();
            state.registry.record_sent(session_id, data.len(), now);

            let mut events = Vec::new();
            if let Some(line) = command_line(&data) {
                let unit = StreamingUnit::sealed(session_id, UnitRole::Command, line, now);
                if state.registry.append_history(session_id, unit) {
                    events.push(ManagerEvent::HistoryChanged(session_id.to_string()));
                }
                state.registry.increment_commands(session_id);
            }
            events.extend(state.session_updated(session_id));
            events
        };
        for event in events {
            self.emit(event);
        }

        self.dispatch_control(session_id, ControlOp::Input { data })
            .await
    }

    /// Resizes a terminal session.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> ManagerResult<()> {
        let result = self
            .control_inner(session_id, ControlOp::Resize { cols, rows })
            .await;
        self.track(ErrorCategory::Control, result).await
    }

    /// Sends a signal to a terminal session.
    pub async fn signal(&self, session_id: &str, signal: SignalKind) -> ManagerResult<()> {
        let result = self
            .control_inner(session_id, ControlOp::Signal { signal })
            .await;
        self.track(ErrorCategory::Control, result).await
    }

    /// Pauses output delivery for a session.
    pub async fn pause(&self, session_id: &str) -> ManagerResult<()> {
        let result = self.control_inner(session_id, ControlOp::Pause).await;
        self.track(ErrorCategory::Control, result).await
    }

    /// Resumes output delivery for a session.
    pub async fn resume(&self, session_id: &str) -> ManagerResult<()> {
        let result = self.control_inner(session_id, ControlOp::Resume).await;
        self.track(ErrorCategory::Control, result).await
    }

    /// Sends an application-level ping.
    pub async fn ping(&self, session_id: &str) -> ManagerResult<()> {
        let result = self
            .control_inner(
                session_id,
                ControlOp::Ping {
                    timestamp: now_millis(),
                },
            )
            .await;
        self.track(ErrorCategory::Control, result).await
    }

    async fn control_inner(&self, session_id: &str, op: ControlOp) -> ManagerResult<()> {
        validate_op(&op)?;
        {
            let state = self.state.lock().await;
            check_target(&state, session_id, op.name())?;
        }
        self.dispatch_control(session_id, op).await
    }

    async fn dispatch_control(&self, session_id: &str, op: ControlOp) -> ManagerResult<()> {
        let paused = match op {
            ControlOp::Pause => Some(true),
            ControlOp::Resume => Some(false),
            _ => None,
        };

        tracing::debug!(session_id = %session_id, op = %op.name(), "Dispatching control");
        let request = ControlRequest::new(session_id, op);
        self.dispatcher
            .dispatch(session_id, OutboundCall::Control(request))
            .await?;

        let updated = {
            let mut state = self.state.lock().await;
            state.registry.touch(session_id, now_millis());
            if let Some(paused) = paused {
                state.registry.set_paused(session_id, paused);
            }
            paused.and_then(|_| state.session_updated(session_id))
        };
        if let Some(event) = updated {
            self.emit(event);
        }
        Ok(())
    }

    async fn open_stream(&self, id: &str) -> ManagerResult<()> {
        if let Err(e) = self.dispatcher.dispatch(id, OutboundCall::Connect).await {
            let updated = {
                let mut state = self.state.lock().await;
                state
                    .registry
                    .apply_liveness(id, &LivenessEvent::Fatal(e.to_string()), now_millis());
                state.session_updated(id)
            };
            if let Some(event) = updated {
                self.emit(event);
            }
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The current session.
    pub async fn current_session(&self) -> Option<Session> {
        let state = self.state.lock().await;
        state
            .registry
            .current_id()
            .and_then(|id| state.registry.get(id))
            .cloned()
    }

    /// One session by id.
    pub async fn session(&self, id: &str) -> Option<Session> {
        self.state.lock().await.registry.get(id).cloned()
    }

    /// Sealed history of a session, oldest first.
    pub async fn history(&self, id: &str) -> Vec<StreamingUnit> {
        self.state.lock().await.registry.history(id).to_vec()
    }

    /// The unit currently being assembled for a session.
    pub async fn in_flight(&self, id: &str) -> Option<StreamingUnit> {
        self.state.lock().await.assembler.in_flight(id).cloned()
    }

    /// Whether a session is connected with a fresh heartbeat.
    pub async fn is_alive(&self, id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .registry
            .get(id)
            .map(|s| liveness::is_alive(&s.liveness, now_millis(), self.options.heartbeat_timeout))
            .unwrap_or(false)
    }

    /// Last error recorded in a category.
    pub async fn last_error(&self, category: ErrorCategory) -> Option<ErrorRecord> {
        self.state.lock().await.errors.get(category).cloned()
    }

    /// Clears the last error of a category.
    pub async fn clear_error(&self, category: ErrorCategory) {
        self.state.lock().await.errors.clear(category);
    }

    /// Disconnects connected sessions whose heartbeat is older than the
    /// configured timeout. Returns the affected ids.
    pub async fn sweep_liveness(&self) -> Vec<SessionId> {
        let (expired, events) = {
            let mut state = self.state.lock().await;
            let now = now_millis();
            let expired = state.registry.expired(now, self.options.heartbeat_timeout);
            let mut events = Vec::new();
            for id in &expired {
                state
                    .registry
                    .apply_liveness(id, &LivenessEvent::HeartbeatTimeout, now);
                events.extend(state.session_updated(id));
            }
            (expired, events)
        };

        for id in &expired {
            tracing::warn!(session_id = %id, "Heartbeat timed out");
        }
        for event in events {
            self.emit(event);
        }
        expired
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    async fn run_pump(self, mut frames: mpsc::Receiver<InboundFrame>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_token.cancelled() => {
                    tracing::debug!("Inbound pump received shutdown signal");
                    break;
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        tracing::info!("Transport closed the inbound channel");
                        break;
                    };
                    self.apply_frame(frame).await;
                }
            }
        }
    }

    async fn apply_frame(&self, frame: InboundFrame) {
        let events = {
            let mut state = self.state.lock().await;
            correlator::on_event(&mut state, frame, now_millis())
        };

        for event in events {
            let sealed_in = match &event {
                ManagerEvent::StreamingUnitSealed(unit) => {
                    if let Some(hook) = &self.completion_hook {
                        hook(unit);
                    }
                    Some(unit.session_id.clone())
                }
                _ => None,
            };
            self.emit(event);
            if let Some(session_id) = sealed_in {
                self.spawn_refresh(session_id);
            }
        }
    }

    /// Re-fetches a session after a seal and merges its counters.
    fn spawn_refresh(&self, session_id: SessionId) {
        let manager = self.clone();
        tokio::spawn(async move {
            match manager.persistence.get_session(&session_id).await {
                Ok(remote) => {
                    let updated = {
                        let mut state = manager.state.lock().await;
                        if !state.registry.contains(&session_id) {
                            return;
                        }
                        state.registry.merge_remote(remote);
                        state.session_updated(&session_id)
                    };
                    if let Some(event) = updated {
                        manager.emit(event);
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Completion refresh failed");
                }
            }
        });
    }

    async fn run_sweep(self) {
        let mut interval = tokio::time::interval(self.options.liveness_sweep_interval);
        // Skip the first immediate tick
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                _ = interval.tick() => {
                    self.sweep_liveness().await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn emit(&self, event: ManagerEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Records a failed operation in its category slot.
    async fn track<T>(&self, category: ErrorCategory, result: ManagerResult<T>) -> ManagerResult<T> {
        if let Err(e) = &result {
            let event = self.state.lock().await.record_error(category, e.to_string());
            self.emit(event);
        }
        result
    }
}

/// The command text of a newline-terminated UTF-8 input, without the line
/// ending.
fn command_line(data: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(data).ok()?;
    let line = text.strip_suffix('\n')?;
    let line = line.strip_suffix('\r').unwrap_or(line);
    (!line.trim().is_empty()).then_some(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::transport::{MemoryTransport, Outbound};

    struct Harness {
        manager: SessionStreamManager,
        transport: MemoryTransport,
        store: MemoryPersistence,
    }

    fn harness() -> Harness {
        let transport = MemoryTransport::new();
        let store = MemoryPersistence::new();
        let manager = SessionStreamManager::new(
            Arc::new(transport.clone()),
            Arc::new(store.clone()),
            ManagerOptions::default(),
        );
        Harness {
            manager,
            transport,
            store,
        }
    }

    fn chat(name: &str) -> SessionSpec {
        SessionSpec::new("ws-1", name, SessionKind::Chat)
    }

    #[test]
    fn test_command_line() {
        assert_eq!(command_line(b"ls -la\n"), Some("ls -la"));
        assert_eq!(command_line(b"dir\r\n"), Some("dir"));
        assert_eq!(command_line(b"partial"), None);
        assert_eq!(command_line(b"\n"), None);
        assert_eq!(command_line(&[0xff, b'\n']), None);
    }

    #[tokio::test]
    async fn test_create_session_sets_current_and_connects() {
        let h = harness();
        let session = h.manager.create_session(chat("main")).await.unwrap();

        assert_eq!(session.status(), LinkState::Pending);
        assert_eq!(h.manager.current_session().await.unwrap().id, session.id);
        assert_eq!(
            h.transport.sent().await,
            vec![Outbound::Connect(session.id.clone())]
        );
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_create_session_rejects_invalid_spec() {
        let h = harness();
        let err = h.manager.create_session(chat("")).await.unwrap_err();
        assert!(matches!(err, ManagerError::Validation(_)));
        assert!(h.manager.list_sessions().await.is_empty());
        assert!(h.transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_session_sends_initial_size() {
        let h = harness();
        let spec = SessionSpec::new("ws-1", "sh", SessionKind::Terminal)
            .with_id("t1")
            .with_size(120, 40);
        h.manager.create_session(spec).await.unwrap();

        let sent = h.transport.sent_to("t1").await;
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            sent[1],
            Outbound::Control(ControlRequest {
                op: ControlOp::Resize { cols: 120, rows: 40 },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_marks_session_errored() {
        let h = harness();
        h.transport.fail_with("offline").await;

        let err = h
            .manager
            .create_session(chat("main").with_id("s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Transport { ref operation, .. } if operation == "connect"));
        assert_eq!(
            h.manager.session("s1").await.unwrap().status(),
            LinkState::Error
        );
    }

    #[tokio::test]
    async fn test_control_on_unknown_session() {
        let h = harness();
        assert_eq!(
            h.manager.resize("nope", 80, 24).await,
            Err(ManagerError::NotFound("nope".to_string()))
        );
    }

    #[tokio::test]
    async fn test_resize_rejects_zero_dims() {
        let h = harness();
        h.manager.create_session(chat("main").with_id("s1")).await.unwrap();
        let err = h.manager.resize("s1", 0, 24).await.unwrap_err();
        assert!(matches!(err, ManagerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_send_message_records_user_unit() {
        let h = harness();
        h.manager.create_session(chat("main").with_id("s1")).await.unwrap();

        let unit = h.manager.send_message("s1", "hi there").await.unwrap();
        assert_eq!(unit.role, UnitRole::User);
        assert!(unit.completed);

        let history = h.manager.history("s1").await;
        assert_eq!(history, vec![unit.clone()]);
        let session = h.manager.session("s1").await.unwrap();
        assert_eq!(session.counters.messages, 1);
        assert_eq!(session.counters.bytes_sent, 8);

        let sent = h.transport.sent_to("s1").await;
        assert!(matches!(
            sent.last(),
            Some(Outbound::Send(send)) if send.correlation_id.as_deref() == Some(unit.id.as_str())
        ));
    }

    #[tokio::test]
    async fn test_send_message_rejects_empty_text() {
        let h = harness();
        h.manager.create_session(chat("main").with_id("s1")).await.unwrap();
        assert!(matches!(
            h.manager.send_message("s1", "   ").await,
            Err(ManagerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_send_input_records_command() {
        let h = harness();
        let spec = SessionSpec::new("ws-1", "sh", SessionKind::Terminal).with_id("t1");
        h.manager.create_session(spec).await.unwrap();

        h.manager.send_input("t1", "ls\n").await.unwrap();
        h.manager.send_input("t1", vec![0x03u8]).await.unwrap();

        let history = h.manager.history("t1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, UnitRole::Command);
        assert_eq!(history[0].content, "ls");

        let session = h.manager.session("t1").await.unwrap();
        assert_eq!(session.counters.commands, 1);
        assert_eq!(session.counters.bytes_sent, 4);
    }

    #[tokio::test]
    async fn test_data_calls_reject_wrong_session_kind() {
        let h = harness();
        h.manager.create_session(chat("main").with_id("s1")).await.unwrap();
        let spec = SessionSpec::new("ws-1", "sh", SessionKind::Terminal).with_id("t1");
        h.manager.create_session(spec).await.unwrap();
        let sent_before = h.transport.sent().await.len();

        assert!(matches!(
            h.manager.send_message("t1", "hello").await,
            Err(ManagerError::Validation(_))
        ));
        assert!(matches!(
            h.manager.send_input("s1", "ls\n").await,
            Err(ManagerError::Validation(_))
        ));

        assert!(h.manager.history("s1").await.is_empty());
        assert!(h.manager.history("t1").await.is_empty());
        assert_eq!(h.transport.sent().await.len(), sent_before);
        assert_eq!(h.manager.session("t1").await.unwrap().counters.bytes_sent, 0);
    }

    #[tokio::test]
    async fn test_create_same_id_twice_lists_once() {
        let h = harness();
        h.manager.create_session(chat("main").with_id("s1")).await.unwrap();
        h.manager.create_session(chat("main again").with_id("s1")).await.unwrap();

        let sessions = h.manager.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s1");
    }

    #[tokio::test]
    async fn test_pause_and_resume_update_flag() {
        let h = harness();
        h.manager.create_session(chat("main").with_id("s1")).await.unwrap();

        h.manager.pause("s1").await.unwrap();
        assert!(h.manager.session("s1").await.unwrap().paused);
        h.manager.resume("s1").await.unwrap();
        assert!(!h.manager.session("s1").await.unwrap().paused);
    }

    #[tokio::test]
    async fn test_failed_pause_keeps_flag_and_records_error() {
        let h = harness();
        h.manager.create_session(chat("main").with_id("s1")).await.unwrap();
        let mut events = h.manager.subscribe();
        h.transport.fail_with("socket reset").await;

        assert!(h.manager.pause("s1").await.is_err());
        assert!(!h.manager.session("s1").await.unwrap().paused);

        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(ManagerEvent::Error { category, message }) = events.recv().await {
                    break (category, message);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.0, ErrorCategory::Control);
        assert!(event.1.contains("socket reset"));
        assert!(h.manager.last_error(ErrorCategory::Control).await.is_some());

        h.manager.clear_error(ErrorCategory::Control).await;
        assert!(h.manager.last_error(ErrorCategory::Control).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_current_session_clears_selection() {
        let h = harness();
        h.manager.create_session(chat("main").with_id("s1")).await.unwrap();
        h.manager.delete_session("s1").await.unwrap();

        assert!(h.manager.current_session().await.is_none());
        assert!(h.manager.list_sessions().await.is_empty());
        assert!(h.store.is_empty());
        assert_eq!(
            h.manager.delete_session("s1").await,
            Err(ManagerError::NotFound("s1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_select_loads_history_from_store() {
        let h = harness();
        h.manager.create_session(chat("one").with_id("s1")).await.unwrap();
        h.manager.create_session(chat("two").with_id("s2")).await.unwrap();
        h.store
            .push_history("s1", StreamingUnit::sealed("s1", UnitRole::Assistant, "stored", 1));

        let selected = h.manager.select_session("s1").await.unwrap();
        assert_eq!(selected.id, "s1");
        assert_eq!(h.manager.current_session().await.unwrap().id, "s1");
        assert_eq!(h.manager.history("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_select_unknown_session() {
        let h = harness();
        assert_eq!(
            h.manager.select_session("ghost").await,
            Err(ManagerError::NotFound("ghost".to_string()))
        );
    }

    #[tokio::test]
    async fn test_refresh_sessions_merges_store() {
        let h = harness();
        let stored = SessionSpec::new("ws-1", "remote", SessionKind::Terminal)
            .into_session("r1".to_string(), 5);
        h.store.insert_session(stored);

        let sessions = h.manager.refresh_sessions("ws-1").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status(), LinkState::Pending);

        // Selecting a session that was never connected opens its stream
        h.manager.select_session("r1").await.unwrap();
        assert_eq!(
            h.transport.sent_to("r1").await,
            vec![Outbound::Connect("r1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let h = harness();
        h.manager.start().unwrap();
        assert!(h.manager.start().is_err());
        h.manager.shutdown();
    }

    #[tokio::test]
    async fn test_sweep_disconnects_quiet_sessions() {
        let transport = MemoryTransport::new();
        let options = ManagerOptions {
            heartbeat_timeout: Duration::from_millis(30),
            liveness_sweep_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let manager = SessionStreamManager::new(
            Arc::new(transport.clone()),
            Arc::new(MemoryPersistence::new()),
            options,
        );
        manager.start().unwrap();
        let mut events = manager.subscribe();
        manager.create_session(chat("main").with_id("s1")).await.unwrap();

        transport.inject(InboundFrame::connected("s1")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(ManagerEvent::SessionUpdated(s)) = events.recv().await {
                    if s.status() == LinkState::Connected {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert!(manager.is_alive("s1").await);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!manager.is_alive("s1").await);
        assert_eq!(manager.sweep_liveness().await, vec!["s1".to_string()]);
        assert_eq!(
            manager.session("s1").await.unwrap().status(),
            LinkState::Disconnected
        );
        assert!(matches!(
            manager.pause("s1").await,
            Err(ManagerError::State { .. })
        ));
        manager.shutdown();
    }
}
