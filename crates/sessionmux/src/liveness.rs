//! Per-session liveness state machine.
//!
//! The tracker is a pure function of the previous [`Liveness`] snapshot, an
//! event, and the current time. It holds no state of its own; the session
//! registry stores the snapshot on each session record.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Connection state of a session stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Connect requested, not yet acknowledged.
    #[default]
    Pending,
    /// Acknowledged and receiving heartbeats.
    Connected,
    /// Closed explicitly or timed out.
    Disconnected,
    /// Transport reported a fatal error.
    Error,
}

impl LinkState {
    /// Terminal states never transition back.
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Error)
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Transport acknowledged the connect request.
    ConnectAck,
    /// Any sign of life: heartbeat, status, keep-alive, output.
    Heartbeat,
    /// Explicit close.
    Close,
    /// Heartbeat age exceeded the configured timeout.
    HeartbeatTimeout,
    /// Fatal transport error.
    Fatal(String),
}

/// Snapshot of a session's liveness.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Liveness {
    /// Current state.
    pub state: LinkState,
    /// Last heartbeat (Unix millis).
    pub last_heartbeat_at: Option<u64>,
    /// Last transition of any kind (Unix millis).
    pub last_activity_at: u64,
    /// Message of the fatal error, if any.
    pub error: Option<String>,
}

impl Liveness {
    /// A fresh pending snapshot.
    pub fn pending(now: u64) -> Self {
        Self {
            state: LinkState::Pending,
            last_heartbeat_at: None,
            last_activity_at: now,
            error: None,
        }
    }
}

/// Applies `event` to `prev`, returning the next snapshot.
pub fn transition(prev: &Liveness, event: &LivenessEvent, now: u64) -> Liveness {
    let mut next = prev.clone();
    next.last_activity_at = now;

    if prev.state.is_terminal() {
        return next;
    }

    match event {
        LivenessEvent::ConnectAck => {
            next.state = LinkState::Connected;
            next.last_heartbeat_at = Some(now);
        }
        LivenessEvent::Heartbeat => {
            next.last_heartbeat_at = Some(now);
        }
        LivenessEvent::Close => {
            next.state = LinkState::Disconnected;
        }
        LivenessEvent::HeartbeatTimeout => {
            if prev.state == LinkState::Connected {
                next.state = LinkState::Disconnected;
            }
        }
        LivenessEvent::Fatal(message) => {
            next.state = LinkState::Error;
            next.error = Some(message.clone());
        }
    }

    next
}

/// Milliseconds since the last heartbeat, if one has been seen.
pub fn heartbeat_age(liveness: &Liveness, now: u64) -> Option<u64> {
    liveness
        .last_heartbeat_at
        .map(|at| now.saturating_sub(at))
}

/// `state == Connected && now - last_heartbeat_at < timeout`.
pub fn is_alive(liveness: &Liveness, now: u64, timeout: Duration) -> bool {
    liveness.state == LinkState::Connected
        && heartbeat_age(liveness, now)
            .map(|age| u128::from(age) < timeout.as_millis())
            .unwrap_or(false)
}

/// Whether a sweep at `now` should fire [`LivenessEvent::HeartbeatTimeout`].
pub fn is_expired(liveness: &Liveness, now: u64, timeout: Duration) -> bool {
    liveness.state == LinkState::Connected && !is_alive(liveness, now, timeout)
}
