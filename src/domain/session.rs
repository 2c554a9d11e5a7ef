// Session running state
use serde::Serialize;
use tokio::time::Instant;

/// Whether the controller considers a test to be running.
///
/// A start time exists exactly while a session is running, so the two are
/// carried together. `generation` identifies the session; it changes every
/// time a new one begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Idle,
    Running { since: Instant, generation: u64 },
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running { .. })
    }

    pub fn started_at(&self) -> Option<Instant> {
        match self {
            RunState::Running { since, .. } => Some(*since),
            RunState::Idle => None,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            RunState::Running { generation, .. } => Some(*generation),
            RunState::Idle => None,
        }
    }

    /// Seconds since the session started, 0 when idle.
    pub fn runtime_s(&self, now: Instant) -> f64 {
        self.started_at()
            .map(|since| now.saturating_duration_since(since).as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// What a poll concluded about who turned the load on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reconciliation {
    /// Output is on but no session was running: one was started outside the controller.
    Adopted,
    /// Output went off while a session was running: the device stopped the load.
    Released,
}
