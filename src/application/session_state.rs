// Shared session state - Single source of truth for the live test
use crate::domain::session::{Reconciliation, RunState};
use crate::domain::telemetry::{DeviceState, LoggedDataPoint, TelemetrySnapshot};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub run: RunState,
    pub snapshot: TelemetrySnapshot,
    pub data_points: Vec<LoggedDataPoint>,
    /// Last state read successfully from the device.
    pub device: Option<DeviceState>,
    pub last_heartbeat: Option<Instant>,
    next_generation: u64,
}

impl SessionState {
    fn begin(&mut self, now: Instant) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.run = RunState::Running { since: now, generation };
        self.data_points.clear();
        generation
    }

    /// Align the running flag with the device's output flag.
    fn reconcile(&mut self, output_on: bool, now: Instant) -> Option<Reconciliation> {
        match (output_on, self.run.is_running()) {
            (true, false) => {
                self.begin(now);
                Some(Reconciliation::Adopted)
            }
            (false, true) => {
                self.run = RunState::Idle;
                Some(Reconciliation::Released)
            }
            _ => None,
        }
    }
}

/// Outcome of folding one device read into the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollApplied {
    pub reconciliation: Option<Reconciliation>,
    pub running: bool,
    pub snapshot: TelemetrySnapshot,
}

/// Handle to the session state; every mutation happens under one write lock.
#[derive(Clone, Default)]
pub struct SharedSession {
    inner: Arc<RwLock<SessionState>>,
}

impl SharedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> SessionState {
        self.inner.read().await.clone()
    }

    pub async fn run_state(&self) -> RunState {
        self.inner.read().await.run
    }

    pub async fn snapshot(&self) -> TelemetrySnapshot {
        self.inner.read().await.snapshot
    }

    pub async fn data_points(&self) -> Vec<LoggedDataPoint> {
        self.inner.read().await.data_points.clone()
    }

    /// Start a session commanded by this controller. Returns its generation.
    pub async fn begin_session(&self, now: Instant) -> u64 {
        let mut state = self.inner.write().await;
        let generation = state.begin(now);
        state.snapshot = TelemetrySnapshot::default();
        state.last_heartbeat = Some(now);
        generation
    }

    pub async fn end_session(&self) {
        self.inner.write().await.run = RunState::Idle;
    }

    pub async fn heartbeat(&self, now: Instant) {
        self.inner.write().await.last_heartbeat = Some(now);
    }

    pub async fn heartbeat_age(&self, now: Instant) -> Option<Duration> {
        self.inner
            .read()
            .await
            .last_heartbeat
            .map(|at| now.saturating_duration_since(at))
    }

    /// Reconcile, recompute the snapshot and log a point if running.
    pub async fn apply_poll(
        &self,
        device: DeviceState,
        now: Instant,
        wall_clock: DateTime<Local>,
    ) -> PollApplied {
        let mut state = self.inner.write().await;
        let reconciliation = state.reconcile(device.output_on, now);

        let snapshot = TelemetrySnapshot::from_state(&device, state.run.runtime_s(now));
        state.snapshot = snapshot;
        state.device = Some(device);

        let running = state.run.is_running();
        if running {
            state.data_points.push(LoggedDataPoint::new(wall_clock, &snapshot));
        }

        PollApplied {
            reconciliation,
            running,
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(output_on: bool, voltage: f64) -> DeviceState {
        DeviceState {
            voltage_v: voltage,
            current_a: if output_on { 1.0 } else { 0.0 },
            output_on,
            ..DeviceState::default()
        }
    }

    #[tokio::test]
    async fn test_output_on_adopts_session_and_clears_log() {
        let session = SharedSession::new();
        let now = Instant::now();

        let applied = session.apply_poll(device(true, 4.0), now, Local::now()).await;

        assert_eq!(applied.reconciliation, Some(Reconciliation::Adopted));
        let state = session.read().await;
        assert!(state.run.is_running());
        assert_eq!(state.run.started_at(), Some(now));
        assert_eq!(state.data_points.len(), 1);
    }

    #[tokio::test]
    async fn test_output_off_releases_session() {
        let session = SharedSession::new();
        let now = Instant::now();
        session.begin_session(now).await;

        let applied = session
            .apply_poll(device(false, 3.9), now + Duration::from_secs(2), Local::now())
            .await;

        assert_eq!(applied.reconciliation, Some(Reconciliation::Released));
        assert!(!applied.running);
        let state = session.read().await;
        assert_eq!(state.run, RunState::Idle);
        assert_eq!(state.run.started_at(), None);
        assert!(state.data_points.is_empty());
    }

    #[tokio::test]
    async fn test_running_poll_appends_points_in_order() {
        let session = SharedSession::new();
        let start = Instant::now();
        session.begin_session(start).await;

        for i in 1..=3u64 {
            let at = start + Duration::from_secs(i);
            session.apply_poll(device(true, 4.0 - i as f64 * 0.1), at, Local::now()).await;
        }

        let points = session.data_points().await;
        let elapsed: Vec<f64> = points.iter().map(|p| p.elapsed_s).collect();
        assert_eq!(elapsed, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_each_session_gets_new_generation() {
        let session = SharedSession::new();
        let now = Instant::now();

        let first = session.begin_session(now).await;
        session.end_session().await;
        let second = session.begin_session(now).await;

        assert_ne!(first, second);
        assert_eq!(session.run_state().await.generation(), Some(second));
    }
}
