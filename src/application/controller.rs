// Session controller - Command surface over the instrument session
use crate::application::cycle_executor::{CycleStatus, PreparedCycle, TestCycleExecutor};
use crate::application::error::{ControllerError, ControllerResult};
use crate::application::health_monitor::{HealthReport, SharedHealth};
use crate::application::instrument::InstrumentError;
use crate::application::link::InstrumentLink;
use crate::application::session_state::SharedSession;
use crate::application::test_monitor::{MonitorSettings, TestLimits, TestMonitor, stop_load};
use crate::domain::cycle::{CycleState, TestCycleDefinition};
use crate::domain::telemetry::{DeviceState, LoggedDataPoint, TelemetrySnapshot};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Pause between the commands of the start sequence.
    pub command_spacing: Duration,
    /// Wait after output on before the session is considered started.
    pub stabilise: Duration,
    pub monitor: MonitorSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            command_spacing: Duration::from_millis(300),
            stabilise: Duration::from_secs(1),
            monitor: MonitorSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connected: bool,
    pub running: bool,
    pub load_on: bool,
    pub cutoff_voltage: f64,
    pub set_current: f64,
    pub data: TelemetrySnapshot,
    pub connection_health: HealthReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub current: f64,
    pub cutoff: f64,
    pub load_on: bool,
}

/// Parameters of a live test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartTest {
    pub current: f64,
    pub cutoff_voltage: f64,
    /// Seconds; 0 runs until cutoff.
    pub max_time: u64,
}

impl StartTest {
    fn validate(&self) -> ControllerResult<TestLimits> {
        if !self.current.is_finite() || self.current <= 0.0 {
            return Err(ControllerError::InvalidRequest(format!(
                "current must be positive, got {}",
                self.current
            )));
        }
        if !self.cutoff_voltage.is_finite() || self.cutoff_voltage < 0.0 {
            return Err(ControllerError::InvalidRequest(format!(
                "cutoff voltage must not be negative, got {}",
                self.cutoff_voltage
            )));
        }
        Ok(TestLimits {
            cutoff_voltage: self.cutoff_voltage,
            max_time: (self.max_time > 0).then(|| Duration::from_secs(self.max_time)),
        })
    }
}

fn best_effort(step: &str, result: Result<(), InstrumentError>) {
    match result {
        Ok(()) => tracing::debug!("{} ok", step),
        Err(e) => tracing::warn!("{} failed: {}", step, e),
    }
}

pub struct SessionController {
    link: Arc<InstrumentLink>,
    session: SharedSession,
    health: SharedHealth,
    executor: Arc<TestCycleExecutor>,
    settings: ControllerSettings,
    /// Serialises start and stop.
    commands: Mutex<()>,
}

impl SessionController {
    pub fn new(
        link: Arc<InstrumentLink>,
        session: SharedSession,
        health: SharedHealth,
        executor: Arc<TestCycleExecutor>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            link,
            session,
            health,
            executor,
            settings,
            commands: Mutex::new(()),
        }
    }

    /// Current status with a fresh device read. Never fails; fields the
    /// device could not supply fall back to the last poll or to defaults.
    pub async fn status(&self) -> StatusReport {
        let live = if self.link.is_open() && !self.link.is_claimed() {
            let result = self.link.lock().await.read_state().await;
            match result {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::debug!("Status read failed: {}", e);
                    let message = e.to_string();
                    self.health.update(|h| h.note_error(message)).await;
                    None
                }
            }
        } else {
            None
        };
        self.build_status(live).await
    }

    /// Status from the last poll, without device traffic.
    pub async fn cached_status(&self) -> StatusReport {
        self.build_status(None).await
    }

    async fn build_status(&self, live: Option<DeviceState>) -> StatusReport {
        let session = self.session.read().await;
        let health = self.health.read().await;
        let device = live.or(session.device).unwrap_or_default();

        StatusReport {
            connected: self.link.is_open() && (live.is_some() || health.is_connected()),
            running: session.run.is_running(),
            load_on: device.output_on,
            cutoff_voltage: device.cutoff_v,
            set_current: device.current_limit_a,
            data: session.snapshot,
            connection_health: health.report(Instant::now()),
        }
    }

    /// Configure the load, switch it on and start watching it.
    pub async fn start_test(&self, request: StartTest) -> ControllerResult<()> {
        let limits = request.validate()?;
        let _serial = self.commands.lock().await;

        if self.session.run_state().await.is_running() || self.link.is_claimed() {
            return Err(ControllerError::AlreadyRunning);
        }
        if !self.link.is_open() {
            return Err(ControllerError::NotConnected);
        }

        tracing::info!(
            current_a = request.current,
            cutoff_v = request.cutoff_voltage,
            max_time_s = request.max_time,
            "Starting test"
        );

        {
            let spacing = self.settings.command_spacing;
            let mut link = self.link.lock().await;
            best_effort("Reset accumulators", link.reset_accumulators().await);
            tokio::time::sleep(spacing).await;
            best_effort("Set current", link.set_current(request.current).await);
            tokio::time::sleep(spacing).await;
            best_effort("Set cutoff", link.set_cutoff(request.cutoff_voltage).await);
            tokio::time::sleep(spacing).await;
            if let Err(e) = link.set_output(true).await {
                tracing::error!("Could not turn load on: {}", e);
                return Err(e.into());
            }
        }

        tokio::time::sleep(self.settings.stabilise).await;
        let generation = self.session.begin_session(Instant::now()).await;

        let monitor = TestMonitor::new(
            self.link.clone(),
            self.session.clone(),
            limits,
            self.settings.monitor.clone(),
            generation,
        );
        tokio::spawn(monitor.run());

        tracing::info!(generation, "Test started");
        Ok(())
    }

    /// Stop the live test. Stopping when nothing runs succeeds.
    ///
    /// A scripted run in progress is aborted as well.
    pub async fn stop_test(&self) -> ControllerResult<Option<DeviceState>> {
        let _serial = self.commands.lock().await;

        if self.executor.is_running() {
            self.executor.abort().await?;
        }
        if !self.session.run_state().await.is_running() {
            tracing::debug!("Stop requested with no test running");
            return Ok(None);
        }

        tracing::info!("Stopping test");
        Ok(stop_load(&self.link, &self.session, self.settings.monitor.stop_settle).await?)
    }

    pub async fn data_points(&self) -> Vec<LoggedDataPoint> {
        self.session.data_points().await
    }

    pub async fn reset_counters(&self) -> ControllerResult<()> {
        if !self.link.is_open() {
            return Err(ControllerError::NotConnected);
        }
        self.link.lock().await.reset_accumulators().await?;
        tracing::info!("Accumulators reset");
        Ok(())
    }

    pub async fn heartbeat(&self) {
        self.session.heartbeat(Instant::now()).await;
    }

    /// Close and reopen the link on request.
    pub async fn reconnect(&self) -> ControllerResult<()> {
        if self.session.run_state().await.is_running() || self.link.is_claimed() {
            return Err(ControllerError::AlreadyRunning);
        }

        tracing::info!("Manual reconnect requested");
        let result = self.link.lock().await.reopen().await;
        match result {
            Ok(()) => {
                self.health.update(|h| h.reconnect_succeeded(Instant::now())).await;
                tracing::info!("Reconnected");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.health.update(|h| h.reconnect_failed(message)).await;
                Err(e.into())
            }
        }
    }

    pub async fn device_config(&self) -> ControllerResult<DeviceConfig> {
        if !self.link.is_open() {
            return Err(ControllerError::NotConnected);
        }
        let state = self.link.lock().await.read_state().await?;
        Ok(DeviceConfig {
            current: state.current_limit_a,
            cutoff: state.cutoff_v,
            load_on: state.output_on,
        })
    }

    pub fn list_cycles(&self) -> Vec<String> {
        self.executor.list_cycles()
    }

    pub fn cycle_info(&self, name: &str) -> ControllerResult<TestCycleDefinition> {
        self.executor.cycle_info(name)
    }

    /// Claim the link for a cycle under the command lock.
    ///
    /// Once this returns, `start_test` and a second cycle are refused and
    /// `stop_test` aborts the prepared run.
    async fn prepare_cycle(&self, name: &str) -> ControllerResult<PreparedCycle> {
        let _serial = self.commands.lock().await;

        self.executor.cycle_info(name)?;
        if self.session.run_state().await.is_running() {
            return Err(ControllerError::AlreadyRunning);
        }
        self.executor.prepare(name).await
    }

    /// Run a scripted cycle and wait for it to finish.
    pub async fn run_cycle(&self, name: &str) -> ControllerResult<CycleState> {
        let prepared = self.prepare_cycle(name).await?;
        self.executor.execute(prepared).await
    }

    /// Validate and claim, then run the cycle on a background task.
    pub async fn spawn_cycle(&self, name: &str) -> ControllerResult<()> {
        let prepared = self.prepare_cycle(name).await?;

        let executor = self.executor.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = executor.execute(prepared).await {
                tracing::error!(cycle = %name, "Test cycle failed: {}", e);
            }
        });
        Ok(())
    }

    pub async fn abort_cycle(&self) -> ControllerResult<()> {
        self.executor.abort().await
    }

    pub async fn cycle_status(&self) -> CycleStatus {
        self.executor.status().await
    }

    pub async fn export_cycle_data(&self, path: Option<PathBuf>) -> ControllerResult<PathBuf> {
        self.executor.export(path).await
    }

    /// Leave the load off before the process exits.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_test().await {
            tracing::error!("Error stopping test during shutdown: {}", e);
        }
        if self.link.is_open() {
            let mut link = self.link.lock().await;
            best_effort("Output off", link.set_output(false).await);
            if let Err(e) = link.close().await {
                tracing::warn!("Could not close link: {}", e);
            }
        }
    }
}
