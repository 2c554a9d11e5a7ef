// Test cycle executor - Runs scripted multi-phase tests against the instrument
use crate::application::error::{ControllerError, ControllerResult};
use crate::application::instrument::InstrumentError;
use crate::application::link::{InstrumentLink, LinkClaim};
use crate::domain::cycle::{
    CycleCatalog, CyclePoint, CycleState, PhaseKind, TestCycleDefinition, TestPhaseDefinition,
    ramp_setpoint,
};
use crate::domain::telemetry::DeviceState;
use crate::infrastructure::csv_export::{default_export_path, export_to_file};
use chrono::Local;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Logging period of rest phases.
    pub rest_sample_period: Duration,
    /// How often a discharge phase checks its termination conditions.
    pub discharge_check_period: Duration,
    pub export_dir: PathBuf,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            rest_sample_period: Duration::from_secs(1),
            discharge_check_period: Duration::from_millis(500),
            export_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleStatus {
    pub state: CycleState,
    pub cycle: Option<String>,
    pub phase: Option<String>,
    /// 1-based index of the current phase.
    pub phase_number: Option<usize>,
    pub total_phases: usize,
    pub points: usize,
}

#[derive(Debug, Default)]
struct Progress {
    state: CycleState,
    cycle: Option<String>,
    phase: Option<String>,
    phase_number: Option<usize>,
    total_phases: usize,
}

/// Why a phase did not finish.
#[derive(Debug)]
enum PhaseStop {
    Aborted,
    Device(InstrumentError),
}

impl From<InstrumentError> for PhaseStop {
    fn from(err: InstrumentError) -> Self {
        PhaseStop::Device(err)
    }
}

/// A cycle that owns the link and is marked running.
pub struct PreparedCycle {
    cycle: TestCycleDefinition,
    _claim: LinkClaim,
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

pub struct TestCycleExecutor {
    link: Arc<InstrumentLink>,
    catalog: Arc<CycleCatalog>,
    settings: ExecutorSettings,
    running: AtomicBool,
    progress: RwLock<Progress>,
    data: RwLock<Vec<CyclePoint>>,
}

impl TestCycleExecutor {
    pub fn new(
        link: Arc<InstrumentLink>,
        catalog: Arc<CycleCatalog>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            link,
            catalog,
            settings,
            running: AtomicBool::new(false),
            progress: RwLock::new(Progress::default()),
            data: RwLock::new(Vec::new()),
        }
    }

    pub fn list_cycles(&self) -> Vec<String> {
        self.catalog.names()
    }

    pub fn cycle_info(&self, name: &str) -> ControllerResult<TestCycleDefinition> {
        self.catalog
            .get(name)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownCycle(name.to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn status(&self) -> CycleStatus {
        let progress = self.progress.read().await;
        CycleStatus {
            state: progress.state,
            cycle: progress.cycle.clone(),
            phase: progress.phase.clone(),
            phase_number: progress.phase_number,
            total_phases: progress.total_phases,
            points: self.data.read().await.len(),
        }
    }

    pub async fn data(&self) -> Vec<CyclePoint> {
        self.data.read().await.clone()
    }

    /// Claim the link and mark the named cycle running without touching the device.
    ///
    /// From here on [`abort`](Self::abort) applies to this run and no other
    /// owner can take the link, even before [`execute`](Self::execute) starts.
    pub async fn prepare(&self, name: &str) -> ControllerResult<PreparedCycle> {
        let cycle = self.cycle_info(name)?;
        let claim = self.link.try_claim().ok_or(ControllerError::AlreadyRunning)?;
        if !self.link.is_open() {
            return Err(ControllerError::NotConnected);
        }

        self.running.store(true, Ordering::Release);
        self.data.write().await.clear();
        *self.progress.write().await = Progress {
            state: CycleState::Running,
            cycle: Some(name.to_string()),
            phase: None,
            phase_number: None,
            total_phases: cycle.phases.len(),
        };

        Ok(PreparedCycle {
            cycle,
            _claim: claim,
        })
    }

    /// Run the phases of a prepared cycle to completion or abort.
    ///
    /// Returns the final state: `Completed`, or `Aborted` after [`abort`](Self::abort).
    /// A failed instrument call aborts the run and is returned as an error.
    /// The output is always commanded off and the link claim released before
    /// this returns.
    pub async fn execute(&self, prepared: PreparedCycle) -> ControllerResult<CycleState> {
        let PreparedCycle { cycle, _claim } = prepared;

        tracing::info!(
            cycle = %cycle.name,
            description = %cycle.description,
            estimate = %cycle.duration_estimate,
            "Starting test cycle"
        );

        let total = cycle.phases.len();
        let mut failure = None;
        for (index, phase) in cycle.phases.iter().enumerate() {
            {
                let mut progress = self.progress.write().await;
                progress.phase = Some(phase.name.clone());
                progress.phase_number = Some(index + 1);
            }
            tracing::info!(
                "Phase {}/{}: {} ({}) {}",
                index + 1,
                total,
                phase.name,
                phase.kind.type_name(),
                phase.description
            );

            if let Err(stop) = self.run_phase(phase).await {
                failure = Some(stop);
                break;
            }
        }

        if let Err(e) = self.link.lock().await.set_output(false).await {
            tracing::error!("Could not turn load off after cycle: {}", e);
        }
        self.running.store(false, Ordering::Release);

        let outcome = match failure {
            None => {
                tracing::info!(cycle = %cycle.name, "Test cycle completed");
                Ok(CycleState::Completed)
            }
            Some(PhaseStop::Aborted) => {
                tracing::warn!(cycle = %cycle.name, "Test cycle aborted");
                Ok(CycleState::Aborted)
            }
            Some(PhaseStop::Device(e)) => {
                tracing::error!(cycle = %cycle.name, "Test cycle aborted on device error: {}", e);
                Err(ControllerError::Device(e))
            }
        };
        self.progress.write().await.state = match &outcome {
            Ok(state) => *state,
            Err(_) => CycleState::Aborted,
        };
        outcome
    }

    /// Stop the running cycle and turn the load off.
    pub async fn abort(&self) -> ControllerResult<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(ControllerError::NotRunning);
        }
        tracing::warn!("Test cycle abort requested");
        self.link.lock().await.set_output(false).await?;
        Ok(())
    }

    /// Write the logged points as CSV. Returns the path written.
    pub async fn export(&self, path: Option<PathBuf>) -> ControllerResult<PathBuf> {
        let points = self.data().await;
        if points.is_empty() {
            return Err(ControllerError::NoData);
        }

        let path =
            path.unwrap_or_else(|| default_export_path(&self.settings.export_dir, Local::now()));
        let target = path.clone();
        tokio::task::spawn_blocking(move || export_to_file(&target, &points))
            .await
            .map_err(|e| ControllerError::Export(e.to_string()))??;
        Ok(path)
    }

    async fn run_phase(&self, phase: &TestPhaseDefinition) -> Result<(), PhaseStop> {
        match &phase.kind {
            PhaseKind::Rest { duration } => self.rest(phase, seconds(*duration)).await,
            PhaseKind::Discharge {
                current,
                cutoff_voltage,
                max_time,
                duration,
                log_interval,
            } => {
                let limit = DischargeLimit {
                    cutoff_voltage: *cutoff_voltage,
                    max_time: max_time.map(seconds),
                    duration: duration.map(seconds),
                };
                let result = self.discharge(phase, *current, limit, seconds(*log_interval)).await;
                let off = self.link.lock().await.set_output(false).await;
                result.and(off.map_err(PhaseStop::from))
            }
            PhaseKind::Ramp {
                start_current,
                end_current,
                duration,
                steps,
            } => {
                let result = self
                    .ramp(phase, *start_current, *end_current, seconds(*duration), *steps)
                    .await;
                if result.is_err() {
                    self.output_off_best_effort().await;
                }
                result
            }
        }
    }

    async fn rest(&self, phase: &TestPhaseDefinition, duration: Duration) -> Result<(), PhaseStop> {
        self.link.lock().await.set_output(false).await?;

        let start = Instant::now();
        while start.elapsed() < duration {
            self.ensure_running()?;
            let state = self.read().await?;
            self.record(phase, start, &state).await;
            tokio::time::sleep(self.settings.rest_sample_period).await;
        }
        Ok(())
    }

    async fn discharge(
        &self,
        phase: &TestPhaseDefinition,
        current: f64,
        limit: DischargeLimit,
        log_interval: Duration,
    ) -> Result<(), PhaseStop> {
        {
            let mut link = self.link.lock().await;
            self.ensure_running()?;
            link.set_current(current).await?;
            link.set_cutoff(limit.cutoff_voltage).await?;
            link.set_output(true).await?;
        }

        let start = Instant::now();
        let mut last_log: Option<Duration> = None;
        loop {
            self.ensure_running()?;
            let elapsed = start.elapsed();
            let state = self.read().await?;

            if let Some(reason) = limit.reached(elapsed, state.voltage_v) {
                tracing::info!(
                    elapsed_s = elapsed.as_secs_f64(),
                    voltage_v = state.voltage_v,
                    "{}",
                    reason
                );
                return Ok(());
            }

            if last_log.is_none_or(|at| elapsed.saturating_sub(at) >= log_interval) {
                let point = self.record(phase, start, &state).await;
                last_log = Some(elapsed);
                tracing::info!(
                    "  {:.0}s: {:.3}V, {:.3}A, {:.0}mAh",
                    point.elapsed_s,
                    point.voltage_v,
                    point.current_a,
                    point.capacity_mah
                );
            }

            tokio::time::sleep(self.settings.discharge_check_period).await;
        }
    }

    async fn ramp(
        &self,
        phase: &TestPhaseDefinition,
        start_current: f64,
        end_current: f64,
        duration: Duration,
        steps: u32,
    ) -> Result<(), PhaseStop> {
        let steps = steps.max(1);
        let step_duration = duration / steps;
        let start = Instant::now();

        for step in 0..steps {
            let setpoint = ramp_setpoint(start_current, end_current, steps, step);
            {
                // Checked under the guard so an abort cannot interleave with a setpoint.
                let mut link = self.link.lock().await;
                self.ensure_running()?;
                link.set_current(setpoint).await?;
                if step == 0 {
                    link.set_output(true).await?;
                }
            }

            let state = self.read().await?;
            self.record(phase, start, &state).await;
            tracing::info!(
                "  Step {}/{}: {:.2}A, {:.3}V",
                step + 1,
                steps,
                setpoint,
                state.voltage_v
            );

            tokio::time::sleep(step_duration).await;
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), PhaseStop> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PhaseStop::Aborted)
        }
    }

    async fn read(&self) -> Result<DeviceState, InstrumentError> {
        self.link.lock().await.read_state().await
    }

    async fn record(
        &self,
        phase: &TestPhaseDefinition,
        phase_start: Instant,
        state: &DeviceState,
    ) -> CyclePoint {
        let point = CyclePoint {
            timestamp: Local::now(),
            elapsed_s: phase_start.elapsed().as_secs_f64(),
            phase: phase.name.clone(),
            phase_type: phase.kind.type_name(),
            voltage_v: state.voltage_v,
            current_a: state.current_a,
            capacity_mah: state.charge_mah,
            energy_mwh: state.energy_mwh,
            temperature_c: state.temperature_c,
        };
        self.data.write().await.push(point.clone());
        point
    }

    async fn output_off_best_effort(&self) {
        if let Err(e) = self.link.lock().await.set_output(false).await {
            tracing::error!("Could not turn load off: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DischargeLimit {
    cutoff_voltage: f64,
    max_time: Option<Duration>,
    /// Fixed run time; overrides voltage and max_time when set.
    duration: Option<Duration>,
}

impl DischargeLimit {
    fn reached(&self, elapsed: Duration, voltage: f64) -> Option<&'static str> {
        if let Some(duration) = self.duration {
            return (elapsed >= duration).then_some("Duration limit reached");
        }
        if voltage <= self.cutoff_voltage {
            return Some("Cutoff voltage reached");
        }
        match self.max_time {
            Some(max_time) if elapsed >= max_time => Some("Max time reached"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::simulated_load::{
        LoadCommand, SimulatedLoad, SimulatedLoadConfig, SimulatedLoadHandle,
    };
    use std::collections::BTreeMap;

    fn phase(name: &str, kind: PhaseKind) -> TestPhaseDefinition {
        TestPhaseDefinition {
            name: name.to_string(),
            description: String::new(),
            kind,
        }
    }

    fn catalog(cycles: Vec<(&str, Vec<TestPhaseDefinition>)>) -> Arc<CycleCatalog> {
        let test_cycles: BTreeMap<String, TestCycleDefinition> = cycles
            .into_iter()
            .map(|(key, phases)| {
                (
                    key.to_string(),
                    TestCycleDefinition {
                        name: key.to_string(),
                        description: String::new(),
                        duration_estimate: String::new(),
                        phases,
                    },
                )
            })
            .collect();
        Arc::new(CycleCatalog { test_cycles })
    }

    fn endless_discharge() -> PhaseKind {
        PhaseKind::Discharge {
            current: 1.0,
            cutoff_voltage: 2.5,
            max_time: None,
            duration: None,
            log_interval: 5.0,
        }
    }

    async fn run(executor: &TestCycleExecutor, name: &str) -> ControllerResult<CycleState> {
        let prepared = executor.prepare(name).await?;
        executor.execute(prepared).await
    }

    async fn setup(
        catalog: Arc<CycleCatalog>,
        export_dir: PathBuf,
    ) -> (Arc<TestCycleExecutor>, SimulatedLoadHandle) {
        let (load, handle) = SimulatedLoad::with_handle(SimulatedLoadConfig::default());
        let link = Arc::new(InstrumentLink::new(Box::new(load), Duration::from_secs(1)));
        link.lock().await.connect().await.unwrap();
        let settings = ExecutorSettings {
            export_dir,
            ..ExecutorSettings::default()
        };
        (Arc::new(TestCycleExecutor::new(link, catalog, settings)), handle)
    }

    #[tokio::test]
    async fn test_unknown_cycle_is_rejected() {
        let (executor, _handle) = setup(catalog(vec![]), PathBuf::from(".")).await;

        let result = run(&executor, "missing").await;

        assert!(matches!(result, Err(ControllerError::UnknownCycle(name)) if name == "missing"));
        assert_eq!(executor.status().await.state, CycleState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rest_then_fixed_discharge_exports_every_point() {
        let dir = tempfile::tempdir().unwrap();
        let cycles = catalog(vec![(
            "short",
            vec![
                phase("Settle", PhaseKind::Rest { duration: 2.0 }),
                phase(
                    "Pulse",
                    PhaseKind::Discharge {
                        current: 1.0,
                        cutoff_voltage: 2.5,
                        max_time: None,
                        duration: Some(3.0),
                        log_interval: 1.0,
                    },
                ),
            ],
        )]);
        let (executor, handle) = setup(cycles, dir.path().to_path_buf()).await;

        let state = run(&executor, "short").await.unwrap();
        assert_eq!(state, CycleState::Completed);

        let points = executor.data().await;
        let types: Vec<&str> = points.iter().map(|p| p.phase_type).collect();
        assert_eq!(types, vec!["rest", "rest", "discharge", "discharge", "discharge"]);

        let path = executor.export(None).await.unwrap();
        assert!(path.starts_with(dir.path()));
        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), points.len());
        for (row, point) in rows.iter().zip(&points) {
            assert_eq!(&row[3], point.phase_type);
            assert_eq!(&row[2], point.phase.as_str());
        }
        assert_eq!(handle.last_output_command(), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_interpolates_setpoints_once_per_step() {
        let cycles = catalog(vec![(
            "sweep",
            vec![phase(
                "Sweep",
                PhaseKind::Ramp {
                    start_current: 0.5,
                    end_current: 2.0,
                    duration: 10.0,
                    steps: 10,
                },
            )],
        )]);
        let (executor, handle) = setup(cycles, PathBuf::from(".")).await;
        let start = Instant::now();

        run(&executor, "sweep").await.unwrap();

        let expected = [0.5, 0.65, 0.8, 0.95, 1.1, 1.25, 1.4, 1.55, 1.7, 1.85];
        let setpoints = handle.setpoints();
        assert_eq!(setpoints.len(), expected.len());
        for (got, want) in setpoints.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9);
        }
        let elapsed: Vec<f64> = executor.data().await.iter().map(|p| p.elapsed_s).collect();
        let seconds: Vec<f64> = (0..10).map(f64::from).collect();
        assert_eq!(elapsed, seconds);
        assert_eq!(start.elapsed(), Duration::from_secs(10));

        let output_commands: Vec<bool> = handle
            .commands()
            .iter()
            .filter_map(|c| match c {
                LoadCommand::SetOutput(on) => Some(*on),
                _ => None,
            })
            .collect();
        assert_eq!(output_commands, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_mid_discharge_turns_output_off_and_skips_later_phases() {
        let cycles = catalog(vec![(
            "long",
            vec![
                phase("Drain", endless_discharge()),
                phase("Recover", PhaseKind::Rest { duration: 60.0 }),
            ],
        )]);
        let (executor, handle) = setup(cycles, PathBuf::from(".")).await;
        handle.set_voltage(Some(3.7));

        let runner = executor.clone();
        let task = tokio::spawn(async move { run(&runner, "long").await });
        tokio::time::sleep(Duration::from_secs(3)).await;
        executor.abort().await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), CycleState::Aborted);
        assert_eq!(handle.last_output_command(), Some(false));
        assert!(!handle.output_on());
        let status = executor.status().await;
        assert_eq!(status.state, CycleState::Aborted);
        assert_eq!(status.phase.as_deref(), Some("Drain"));
        assert!(executor.data().await.iter().all(|p| p.phase_type == "discharge"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_mid_ramp_sends_no_further_setpoints() {
        let cycles = catalog(vec![(
            "sweep",
            vec![phase(
                "Sweep",
                PhaseKind::Ramp {
                    start_current: 0.5,
                    end_current: 2.0,
                    duration: 100.0,
                    steps: 10,
                },
            )],
        )]);
        let (executor, handle) = setup(cycles, PathBuf::from(".")).await;

        let runner = executor.clone();
        let task = tokio::spawn(async move { run(&runner, "sweep").await });
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(handle.setpoints().len(), 3);

        executor.abort().await.unwrap();
        assert_eq!(handle.last_output_command(), Some(false));
        assert!(!handle.output_on());

        assert_eq!(task.await.unwrap().unwrap(), CycleState::Aborted);
        assert_eq!(handle.setpoints().len(), 3);
        assert_eq!(handle.last_output_command(), Some(false));
        let last_output = handle
            .commands()
            .iter()
            .rev()
            .find_map(|c| match c {
                LoadCommand::SetOutput(on) => Some(*on),
                _ => None,
            });
        assert_eq!(last_output, Some(false));
        assert!(!handle.output_on());
    }

    #[tokio::test]
    async fn test_prepared_cycle_holds_the_link_and_honours_abort() {
        let cycles = catalog(vec![("long", vec![phase("Drain", endless_discharge())])]);
        let (executor, handle) = setup(cycles, PathBuf::from(".")).await;

        let prepared = executor.prepare("long").await.unwrap();
        assert!(executor.is_running());
        assert_eq!(executor.status().await.state, CycleState::Running);
        assert!(matches!(executor.prepare("long").await, Err(ControllerError::AlreadyRunning)));

        executor.abort().await.unwrap();
        assert_eq!(executor.execute(prepared).await.unwrap(), CycleState::Aborted);
        assert!(handle.setpoints().is_empty());
        assert!(!handle.output_on());

        // The claim is released once the run returns.
        let prepared = executor.prepare("long").await.unwrap();
        executor.abort().await.unwrap();
        assert_eq!(executor.execute(prepared).await.unwrap(), CycleState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_mid_discharge_still_turns_output_off() {
        let cycles = catalog(vec![("long", vec![phase("Drain", endless_discharge())])]);
        let (executor, handle) = setup(cycles, PathBuf::from(".")).await;
        handle.set_voltage(Some(3.7));

        let runner = executor.clone();
        let task = tokio::spawn(async move { run(&runner, "long").await });
        tokio::time::sleep(Duration::from_millis(2200)).await;
        handle.fail_next(InstrumentError::Timeout(Duration::from_secs(1)));

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ControllerError::Device(InstrumentError::Timeout(_)))));
        assert_eq!(handle.last_output_command(), Some(false));
        assert!(!handle.output_on());
        assert_eq!(executor.status().await.state, CycleState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discharge_stops_at_cutoff() {
        let cycles = catalog(vec![("drain", vec![phase("Drain", endless_discharge())])]);
        let (executor, handle) = setup(cycles, PathBuf::from(".")).await;
        handle.script_voltages([3.4, 3.1, 2.8, 2.4]);

        let state = run(&executor, "drain").await.unwrap();

        assert_eq!(state, CycleState::Completed);
        assert_eq!(handle.last_output_command(), Some(false));
        // Only the opening sample falls on a log boundary before cutoff.
        assert_eq!(executor.data().await.len(), 1);
    }

    #[tokio::test]
    async fn test_export_without_data_reports_no_data() {
        let (executor, _handle) = setup(catalog(vec![]), PathBuf::from(".")).await;
        assert!(matches!(executor.export(None).await, Err(ControllerError::NoData)));
    }

    #[tokio::test]
    async fn test_abort_when_idle_is_not_running() {
        let (executor, _handle) = setup(catalog(vec![]), PathBuf::from(".")).await;
        assert!(matches!(executor.abort().await, Err(ControllerError::NotRunning)));
    }
}
