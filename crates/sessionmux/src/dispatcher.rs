//! Control dispatcher.
//!
//! Outbound calls are serialized per session: each session gets a worker
//! task draining a bounded queue, so two resizes issued back to back reach
//! the transport in issue order while other sessions proceed in parallel.
//! Callers await a oneshot reply. Failed calls are reported, never retried.

use std::sync::Arc;

use dashmap::DashMap;
use protocol::error::{ProtocolError, Result};
use protocol::{ControlOp, ControlRequest, Payload};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{ManagerError, ManagerResult};
use crate::session::{SessionId, SessionKind};
use crate::state::ManagerState;
use crate::transport::Transport;

/// An outbound call queued for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundCall {
    /// Open the session stream.
    Connect,
    /// Chat text or raw data.
    Send {
        /// Content.
        payload: Payload,
        /// Correlation id echoed by the server.
        correlation_id: Option<String>,
    },
    /// A control operation.
    Control(ControlRequest),
    /// Close the session stream.
    Disconnect,
}

impl OutboundCall {
    /// Operation name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundCall::Connect => "connect",
            OutboundCall::Send { .. } => "send_message",
            OutboundCall::Control(request) => request.op.name(),
            OutboundCall::Disconnect => "disconnect",
        }
    }
}

struct Job {
    call: OutboundCall,
    reply: oneshot::Sender<Result<()>>,
}

/// Per-session FIFO in front of the transport.
pub struct ControlDispatcher {
    transport: Arc<dyn Transport>,
    queues: DashMap<SessionId, mpsc::Sender<Job>>,
    capacity: usize,
    cancel: CancellationToken,
}

impl ControlDispatcher {
    /// Creates a dispatcher whose per-session queues hold `capacity` calls.
    pub fn new(transport: Arc<dyn Transport>, capacity: usize, cancel: CancellationToken) -> Self {
        Self {
            transport,
            queues: DashMap::new(),
            capacity: capacity.max(1),
            cancel,
        }
    }

    /// Queues `call` for `session_id` and waits for the transport's answer.
    pub async fn dispatch(&self, session_id: &str, call: OutboundCall) -> ManagerResult<()> {
        let operation = call.name();
        if self.cancel.is_cancelled() {
            return Err(stopped(operation, session_id));
        }
        let queue = self.queue(session_id);
        let (reply_tx, reply_rx) = oneshot::channel();

        queue
            .send(Job {
                call,
                reply: reply_tx,
            })
            .await
            .map_err(|_| stopped(operation, session_id))?;

        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(
                    session_id = %session_id,
                    operation = %operation,
                    error = %e,
                    "Outbound call failed"
                );
                Err(ManagerError::transport(operation, session_id, e))
            }
            Err(_) => Err(stopped(operation, session_id)),
        }
    }

    /// Drops the queue of a session. Calls already queued still run.
    pub fn remove(&self, session_id: &str) {
        self.queues.remove(session_id);
    }

    /// Number of sessions with a live worker.
    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    fn queue(&self, session_id: &str) -> mpsc::Sender<Job> {
        let mut entry = self
            .queues
            .entry(session_id.to_string())
            .or_insert_with(|| self.spawn_worker(session_id));
        if entry.is_closed() {
            *entry = self.spawn_worker(session_id);
        }
        entry.clone()
    }

    fn spawn_worker(&self, session_id: &str) -> mpsc::Sender<Job> {
        let (tx, rx) = mpsc::channel(self.capacity);
        tokio::spawn(run_worker(
            session_id.to_string(),
            Arc::clone(&self.transport),
            rx,
            self.cancel.clone(),
        ));
        tx
    }
}

async fn run_worker(
    session_id: SessionId,
    transport: Arc<dyn Transport>,
    mut rx: mpsc::Receiver<Job>,
    cancel: CancellationToken,
) {
    tracing::debug!(session_id = %session_id, "Control worker started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = rx.recv() => {
                let Some(job) = job else { break };
                let result = execute(transport.as_ref(), &session_id, job.call).await;
                // The caller may have given up waiting
                let _ = job.reply.send(result);
            }
        }
    }
    tracing::debug!(session_id = %session_id, "Control worker stopped");
}

async fn execute(transport: &dyn Transport, session_id: &str, call: OutboundCall) -> Result<()> {
    match call {
        OutboundCall::Connect => transport.connect(session_id).await,
        OutboundCall::Send {
            payload,
            correlation_id,
        } => transport.send(session_id, payload, correlation_id).await,
        OutboundCall::Control(request) => transport.control(request).await,
        OutboundCall::Disconnect => transport.disconnect(session_id).await,
    }
}

fn stopped(operation: &str, session_id: &str) -> ManagerError {
    ManagerError::transport(
        operation,
        session_id,
        ProtocolError::ConnectionClosed("dispatcher stopped".to_string()),
    )
}

/// Checks that `session_id` exists and is not in a terminal state.
/// Returns the session kind.
pub fn check_target(
    state: &ManagerState,
    session_id: &str,
    operation: &str,
) -> ManagerResult<SessionKind> {
    let session = state
        .registry
        .get(session_id)
        .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;

    if session.status().is_terminal() {
        return Err(ManagerError::State {
            session_id: session_id.to_string(),
            status: session.status(),
            operation: operation.to_string(),
        });
    }
    Ok(session.kind)
}

/// Rejects an operation meant for the other session kind.
pub fn require_kind(
    session_id: &str,
    kind: SessionKind,
    expected: SessionKind,
    operation: &str,
) -> ManagerResult<()> {
    if kind != expected {
        return Err(ManagerError::Validation(format!(
            "{} requires a {:?} session, '{}' is {:?}",
            operation, expected, session_id, kind
        )));
    }
    Ok(())
}

/// Checks control arguments.
pub fn validate_op(op: &ControlOp) -> ManagerResult<()> {
    match op {
        ControlOp::Input { data } if data.is_empty() => {
            Err(ManagerError::Validation("input must not be empty".to_string()))
        }
        ControlOp::Resize { cols, rows } if *cols == 0 || *rows == 0 => Err(
            ManagerError::Validation(format!("invalid terminal size {}x{}", cols, rows)),
        ),
        _ => Ok(()),
    }
}
