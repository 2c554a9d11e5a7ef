// Test monitor - Cutoff watchdog for a live test and the safe stop procedure
use crate::application::instrument::InstrumentError;
use crate::application::link::InstrumentLink;
use crate::application::session_state::SharedSession;
use crate::domain::telemetry::{DeviceState, TelemetrySnapshot};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub tick: Duration,
    /// Wait before the first evaluation, so the first poll after start lands.
    pub initial_delay: Duration,
    pub window: usize,
    /// Readings at or below this voltage are treated as not yet valid.
    pub validity_floor_v: f64,
    pub heartbeat_timeout: Duration,
    pub status_every: Duration,
    pub low_voltage_margin_v: f64,
    /// Pause between commanding output off and verifying it.
    pub stop_settle: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            initial_delay: Duration::from_secs(1),
            window: 60,
            validity_floor_v: 1.0,
            heartbeat_timeout: Duration::from_secs(15),
            status_every: Duration::from_secs(30),
            low_voltage_margin_v: 0.2,
            stop_settle: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestLimits {
    pub cutoff_voltage: f64,
    /// `None` runs until cutoff.
    pub max_time: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    CutoffReached { voltage: f64 },
    TimeLimit { elapsed_s: f64 },
    HeartbeatLost { silent_s: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Active,
    Terminated,
}

/// Watches one live test and stops the load when a limit is hit.
pub struct TestMonitor {
    link: Arc<InstrumentLink>,
    session: SharedSession,
    limits: TestLimits,
    settings: MonitorSettings,
    generation: u64,
    state: MonitorState,
    voltages: VecDeque<f64>,
    currents: VecDeque<f64>,
    last_status_log: Option<Instant>,
}

impl TestMonitor {
    pub fn new(
        link: Arc<InstrumentLink>,
        session: SharedSession,
        limits: TestLimits,
        settings: MonitorSettings,
        generation: u64,
    ) -> Self {
        Self {
            link,
            session,
            limits,
            settings,
            generation,
            state: MonitorState::Active,
            voltages: VecDeque::new(),
            currents: VecDeque::new(),
            last_status_log: None,
        }
    }

    /// Fold one sample into the window and decide whether the test must stop.
    pub fn evaluate(
        &mut self,
        snapshot: &TelemetrySnapshot,
        elapsed: Duration,
        heartbeat_age: Option<Duration>,
    ) -> Option<StopReason> {
        self.voltages.push_back(snapshot.voltage);
        self.currents.push_back(snapshot.current);
        while self.voltages.len() > self.settings.window {
            self.voltages.pop_front();
            self.currents.pop_front();
        }

        let voltage = snapshot.voltage;
        if voltage <= self.settings.validity_floor_v {
            return None;
        }

        if voltage <= self.limits.cutoff_voltage {
            return Some(StopReason::CutoffReached { voltage });
        }

        if let Some(max_time) = self.limits.max_time {
            if elapsed >= max_time {
                return Some(StopReason::TimeLimit {
                    elapsed_s: elapsed.as_secs_f64(),
                });
            }
        }

        if let Some(age) = heartbeat_age {
            if age >= self.settings.heartbeat_timeout {
                return Some(StopReason::HeartbeatLost {
                    silent_s: age.as_secs_f64(),
                });
            }
        }

        if voltage <= self.limits.cutoff_voltage + self.settings.low_voltage_margin_v {
            tracing::warn!(
                voltage_v = voltage,
                cutoff_v = self.limits.cutoff_voltage,
                "Low voltage, approaching cutoff"
            );
        }

        None
    }

    /// Average voltage and current over the last ten samples plus the voltage
    /// trend across the whole window.
    fn window_summary(&self) -> Option<(f64, f64, f64)> {
        const RECENT: usize = 10;
        if self.voltages.len() < RECENT {
            return None;
        }
        let avg = |samples: &VecDeque<f64>| {
            samples.iter().rev().take(RECENT).sum::<f64>() / RECENT as f64
        };
        let trend = match (self.voltages.front(), self.voltages.back()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };
        Some((avg(&self.voltages), avg(&self.currents), trend))
    }

    fn log_status(&mut self, snapshot: &TelemetrySnapshot, elapsed: Duration, now: Instant) {
        let due = self
            .last_status_log
            .is_none_or(|at| now.saturating_duration_since(at) >= self.settings.status_every);
        if !due {
            return;
        }
        if let Some((avg_voltage, avg_current, trend)) = self.window_summary() {
            tracing::info!(
                elapsed_s = elapsed.as_secs(),
                avg_voltage_v = avg_voltage,
                voltage_trend_v = trend,
                avg_current_a = avg_current,
                capacity_mah = snapshot.capacity,
                energy_mwh = snapshot.energy,
                resistance_ohm = snapshot.resistance,
                "Test status"
            );
            self.last_status_log = Some(now);
        }
    }

    /// Run once per tick until the test ends. Returns why this monitor stopped
    /// the load, or `None` if the session ended some other way.
    pub async fn run(mut self) -> Option<StopReason> {
        tracing::info!(
            cutoff_v = self.limits.cutoff_voltage,
            max_time_s = self.limits.max_time.map(|d| d.as_secs()),
            "Test monitor started"
        );
        let started = Instant::now();
        tokio::time::sleep(self.settings.initial_delay).await;

        let mut stopped = None;
        while self.state == MonitorState::Active {
            if self.session.run_state().await.generation() != Some(self.generation) {
                break;
            }

            let now = Instant::now();
            let elapsed = now.saturating_duration_since(started);
            let snapshot = self.session.snapshot().await;
            let heartbeat_age = self.session.heartbeat_age(now).await;

            if let Some(reason) = self.evaluate(&snapshot, elapsed, heartbeat_age) {
                tracing::warn!(?reason, capacity_mah = snapshot.capacity, "Stopping test");
                self.terminate().await;
                stopped = Some(reason);
                break;
            }
            self.log_status(&snapshot, elapsed, now);

            tokio::time::sleep(self.settings.tick).await;
        }

        self.state = MonitorState::Terminated;
        tracing::info!("Test monitor ended");
        stopped
    }

    async fn terminate(&mut self) {
        if self.state == MonitorState::Terminated {
            return;
        }
        self.state = MonitorState::Terminated;
        if let Err(e) = stop_load(&self.link, &self.session, self.settings.stop_settle).await {
            tracing::error!("Error stopping test: {}", e);
        }
    }
}

/// Turn the load off and end the session.
///
/// Final values are read first when possible. The session is marked idle even
/// when the device cannot be reached; the error of the output-off command is
/// returned to the caller.
pub async fn stop_load(
    link: &InstrumentLink,
    session: &SharedSession,
    settle: Duration,
) -> Result<Option<DeviceState>, InstrumentError> {
    let result = {
        let mut guard = link.lock().await;

        let final_state = match guard.read_state().await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!("Could not read final values: {}", e);
                None
            }
        };

        let off = guard.set_output(false).await;
        if off.is_ok() {
            tokio::time::sleep(settle).await;
            match guard.read_state().await {
                Ok(state) if !state.output_on => tracing::info!("Load turned off"),
                Ok(_) => tracing::warn!("Load still reports output on after off command"),
                Err(e) => tracing::warn!("Could not verify load off: {}", e),
            }
        }
        off.map(|_| final_state)
    };

    let runtime_s = session.snapshot().await.runtime;
    session.end_session().await;

    if let Ok(Some(state)) = &result {
        tracing::info!(
            voltage_v = state.voltage_v,
            current_a = state.current_a,
            capacity_mah = state.charge_mah,
            energy_mwh = state.energy_mwh,
            runtime_s,
            "Final test summary"
        );
    }
    result
}
