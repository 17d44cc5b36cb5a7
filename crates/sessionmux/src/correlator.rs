//! Stream correlator.
//!
//! Routes each inbound frame to the session it names. Only the current
//! session's output reaches the assembler; background sessions get liveness
//! updates and a stale-history mark when a reply or command finishes. Frames that
//! cannot be routed are logged and dropped and never reach the caller.

use protocol::{FrameKind, InboundFrame, Payload};

use crate::assembler::{Chunk, ChunkOutcome, UnitRole};
use crate::error::ErrorCategory;
use crate::liveness::LivenessEvent;
use crate::session::SessionKind;
use crate::state::{ManagerEvent, ManagerState};

/// Role given to streamed output of a session kind.
pub fn output_role(kind: SessionKind) -> UnitRole {
    match kind {
        SessionKind::Chat => UnitRole::Assistant,
        SessionKind::Terminal => UnitRole::Output,
    }
}

/// Applies one inbound frame. `now` is Unix milliseconds.
///
/// The current session id is read from `state` on every call, so a frame
/// that arrives right after a switch is routed against the new selection.
pub fn on_event(state: &mut ManagerState, frame: InboundFrame, now: u64) -> Vec<ManagerEvent> {
    let mut events = Vec::new();

    if frame.session_id.trim().is_empty() {
        reject(state, &mut events, &frame, "frame has no session id");
        return events;
    }

    let Some(kind) = state.registry.get(&frame.session_id).map(|s| s.kind) else {
        reject(state, &mut events, &frame, "frame for unknown session");
        return events;
    };

    let session_id = frame.session_id.clone();
    let is_current = state.registry.is_current(&session_id);

    match frame.kind {
        FrameKind::Connected => {
            apply_liveness(state, &mut events, &session_id, LivenessEvent::ConnectAck, now);
        }
        FrameKind::Heartbeat | FrameKind::Status => {
            if let Payload::Text(status) = &frame.payload {
                tracing::trace!(session_id = %session_id, status = %status, "Remote status");
            }
            apply_liveness(state, &mut events, &session_id, LivenessEvent::Heartbeat, now);
        }
        FrameKind::Closed => {
            apply_liveness(state, &mut events, &session_id, LivenessEvent::Close, now);
        }
        FrameKind::Error => {
            let message = frame.payload.clone().into_text_lossy();
            tracing::warn!(session_id = %session_id, error = %message, "Session reported a fatal error");
            apply_liveness(
                state,
                &mut events,
                &session_id,
                LivenessEvent::Fatal(message.clone()),
                now,
            );
            events.push(state.record_error(
                ErrorCategory::Stream,
                format!("session {}: {}", session_id, message),
            ));
        }
        FrameKind::Ack => {
            tracing::debug!(
                session_id = %session_id,
                correlation_id = ?frame.correlation_id,
                "Control acknowledged"
            );
        }
        FrameKind::Output | FrameKind::CommandComplete => {
            on_output(state, &mut events, frame, kind, is_current, now);
        }
    }

    events
}

fn on_output(
    state: &mut ManagerState,
    events: &mut Vec<ManagerEvent>,
    frame: InboundFrame,
    kind: SessionKind,
    is_current: bool,
    now: u64,
) {
    let session_id = frame.session_id.clone();
    let byte_len = frame.payload.len();
    let content = match kind {
        SessionKind::Chat => match frame.payload.clone().into_text() {
            Ok(text) => text,
            Err(_) => {
                reject(state, events, &frame, "chat output is not valid UTF-8");
                return;
            }
        },
        SessionKind::Terminal => frame.payload.clone().into_text_lossy(),
    };

    state.registry.record_received(&session_id, byte_len);
    apply_liveness(state, events, &session_id, LivenessEvent::Heartbeat, now);

    let completes = frame.kind == FrameKind::CommandComplete || frame.finished;

    if !is_current {
        if completes {
            tracing::debug!(session_id = %session_id, kind = ?frame.kind, "Background unit finished");
            state.registry.mark_history_stale(&session_id, true);
            if let Some(event) = state.session_updated(&session_id) {
                events.push(event);
            }
        } else {
            tracing::trace!(session_id = %session_id, bytes = byte_len, "Dropping background output");
        }
        return;
    }

    let chunk = Chunk {
        content: &content,
        finished: completes,
        unit_id: frame.unit_id.as_deref(),
        exit_code: frame.exit_code,
    };

    match state.assembler.on_chunk(&session_id, output_role(kind), chunk, now) {
        ChunkOutcome::Started(unit) | ChunkOutcome::Appended(unit) => {
            events.push(ManagerEvent::StreamingUnitUpdated(unit));
        }
        ChunkOutcome::Sealed(unit) => {
            tracing::debug!(
                session_id = %session_id,
                unit_id = %unit.id,
                duration_ms = ?unit.duration_ms,
                "Unit sealed"
            );
            if state.registry.append_history(&session_id, unit.clone()) {
                events.push(ManagerEvent::HistoryChanged(session_id.clone()));
            }
            events.push(ManagerEvent::StreamingUnitSealed(unit));
        }
        ChunkOutcome::KeepAlive | ChunkOutcome::Ignored => {}
    }
}

fn apply_liveness(
    state: &mut ManagerState,
    events: &mut Vec<ManagerEvent>,
    session_id: &str,
    event: LivenessEvent,
    now: u64,
) {
    if let Some(change) = state.registry.apply_liveness(session_id, &event, now) {
        if change.changed() {
            tracing::info!(
                session_id = %session_id,
                from = ?change.from,
                to = ?change.to,
                "Session status changed"
            );
            if let Some(event) = state.session_updated(session_id) {
                events.push(event);
            }
        }
    }
}

fn reject(state: &mut ManagerState, events: &mut Vec<ManagerEvent>, frame: &InboundFrame, reason: &str) {
    tracing::warn!(
        session_id = %frame.session_id,
        kind = ?frame.kind,
        reason = %reason,
        "Dropping malformed frame"
    );
    events.push(state.record_error(
        ErrorCategory::Stream,
        format!("{} (session '{}')", reason, frame.session_id),
    ));
}
