// Device polling loop - Keeps the session state in step with the instrument
use crate::application::health_monitor::SharedHealth;
use crate::application::instrument::InstrumentError;
use crate::application::link::InstrumentLink;
use crate::application::session_state::{PollApplied, SharedSession};
use crate::domain::session::Reconciliation;
use crate::domain::telemetry::DeviceState;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Extra delay after a failed iteration, on top of the poll interval.
    pub error_backoff: Duration,
    /// Pause after flushing the link buffers.
    pub flush_settle: Duration,
    /// Minimum spacing of the periodic device-state log line.
    pub status_log_every: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            error_backoff: Duration::from_millis(500),
            flush_settle: Duration::from_millis(200),
            status_log_every: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// A scripted run owns the link.
    Skipped,
    Polled(PollApplied),
    Failed(InstrumentError),
}

pub struct DevicePoller {
    link: Arc<InstrumentLink>,
    session: SharedSession,
    health: SharedHealth,
    settings: PollerSettings,
    last_status_log: Option<Instant>,
    last_logged_state: Option<DeviceState>,
}

impl DevicePoller {
    pub fn new(
        link: Arc<InstrumentLink>,
        session: SharedSession,
        health: SharedHealth,
        settings: PollerSettings,
    ) -> Self {
        Self {
            link,
            session,
            health,
            settings,
            last_status_log: None,
            last_logged_state: None,
        }
    }

    /// Poll until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Device polling loop started");

        loop {
            let outcome = self.poll_once().await;

            let mut delay = self.health.read().await.current_interval();
            if matches!(outcome, PollOutcome::Failed(_)) {
                delay += self.settings.error_backoff;
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Device polling loop stopped");
    }

    pub async fn poll_once(&mut self) -> PollOutcome {
        if self.link.is_claimed() {
            return PollOutcome::Skipped;
        }

        let result = if self.link.is_open() {
            let mut guard = self.link.lock().await;
            // The claim may have been taken while we waited for the lock.
            if self.link.is_claimed() {
                return PollOutcome::Skipped;
            }
            let result = guard.poll_state().await;
            if let Err(e) = &result {
                if e.is_link_fault() {
                    tracing::warn!("Communication issue ({}), flushing link buffers", e);
                    if let Err(flush_err) = guard.flush().await {
                        tracing::warn!("Link flush failed: {}", flush_err);
                    }
                    tokio::time::sleep(self.settings.flush_settle).await;
                }
            }
            result
        } else {
            Err(InstrumentError::NotConnected)
        };

        let now = Instant::now();
        self.health.update(|h| h.record(&result, now)).await;
        match result {
            Ok(device) => {
                let applied = self.session.apply_poll(device, now, Local::now()).await;
                self.log_reconciliation(&applied);
                self.log_device_state(&device, applied.running, now);
                PollOutcome::Polled(applied)
            }
            Err(e) => {
                self.maybe_reconnect().await;
                PollOutcome::Failed(e)
            }
        }
    }

    async fn maybe_reconnect(&self) {
        let now = Instant::now();
        let due = self
            .health
            .update(|h| {
                if h.should_force_reconnect(now) {
                    h.begin_reconnect(now);
                    true
                } else {
                    false
                }
            })
            .await;
        if !due {
            return;
        }

        let failures = self.health.read().await.consecutive_failures();
        tracing::info!(failures, "Attempting automatic reconnection");

        let result = self.link.lock().await.reopen().await;
        match result {
            Ok(()) => {
                let resets = self
                    .health
                    .update(|h| {
                        h.reconnect_succeeded(Instant::now());
                        h.reset_count()
                    })
                    .await;
                tracing::info!(resets, "Automatic reconnection succeeded");
            }
            Err(e) => {
                tracing::error!("Automatic reconnection failed: {}", e);
                let message = e.to_string();
                self.health.update(|h| h.reconnect_failed(message)).await;
            }
        }
    }

    fn log_reconciliation(&self, applied: &PollApplied) {
        match applied.reconciliation {
            Some(Reconciliation::Adopted) => tracing::info!(
                current_a = applied.snapshot.current,
                "Device load turned on outside the controller, tracking as a running test"
            ),
            Some(Reconciliation::Released) => tracing::info!(
                capacity_mah = applied.snapshot.capacity,
                "Device load turned off, test tracking stopped"
            ),
            None => {}
        }
    }

    fn log_device_state(&mut self, device: &DeviceState, running: bool, now: Instant) {
        let due = self
            .last_status_log
            .is_none_or(|at| now.saturating_duration_since(at) >= self.settings.status_log_every);
        if !due || self.last_logged_state.as_ref() == Some(device) {
            return;
        }

        tracing::info!(
            output_on = device.output_on,
            voltage_v = device.voltage_v,
            current_a = device.current_a,
            set_current_a = device.current_limit_a,
            cutoff_v = device.cutoff_v,
            charge_mah = device.charge_mah,
            energy_mwh = device.energy_mwh,
            temperature_c = device.temperature_c,
            running,
            "Device status"
        );
        self.last_status_log = Some(now);
        self.last_logged_state = Some(*device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::health_monitor::HealthPolicy;
    use crate::infrastructure::simulated_load::{
        LoadCommand, SimulatedLoad, SimulatedLoadConfig, SimulatedLoadHandle,
    };

    async fn setup() -> (
        DevicePoller,
        SimulatedLoadHandle,
        SharedSession,
        SharedHealth,
        Arc<InstrumentLink>,
    ) {
        let (load, handle) = SimulatedLoad::with_handle(SimulatedLoadConfig::default());
        let link = Arc::new(InstrumentLink::new(Box::new(load), Duration::from_secs(1)));
        link.lock().await.connect().await.unwrap();
        let session = SharedSession::new();
        let health = SharedHealth::new(HealthPolicy::default());
        let poller = DevicePoller::new(
            link.clone(),
            session.clone(),
            health.clone(),
            PollerSettings::default(),
        );
        (poller, handle, session, health, link)
    }

    #[tokio::test(start_paused = true)]
    async fn test_front_panel_start_and_stop_are_reconciled() {
        let (mut poller, handle, session, _health, _link) = setup().await;

        handle.press_output_button(true);
        poller.poll_once().await;
        let run = session.run_state().await;
        assert!(run.is_running());
        assert!(run.started_at().is_some());

        handle.press_output_button(false);
        poller.poll_once().await;
        let run = session.run_state().await;
        assert!(!run.is_running());
        assert_eq!(run.started_at(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_poll_records_success_without_logging() {
        let (mut poller, _handle, session, health, _link) = setup().await;
        health.update(|h| h.record_failure("timeout")).await;

        let outcome = poller.poll_once().await;

        assert!(matches!(outcome, PollOutcome::Polled(applied) if !applied.running));
        assert_eq!(health.read().await.consecutive_failures(), 0);
        assert!(session.data_points().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_fault_flushes_and_records_failure() {
        let (mut poller, handle, _session, health, _link) = setup().await;
        handle.fail_next(InstrumentError::Protocol("ERR: bad frame".into()));

        let outcome = poller.poll_once().await;

        assert!(matches!(outcome, PollOutcome::Failed(InstrumentError::Protocol(_))));
        assert!(handle.commands().contains(&LoadCommand::Flush));
        assert_eq!(health.read().await.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_force_one_reconnect() {
        let (mut poller, handle, _session, health, _link) = setup().await;
        handle.drop_link();

        for _ in 0..5 {
            poller.poll_once().await;
        }
        assert!(handle.is_open());
        assert_eq!(health.read().await.reset_count(), 1);
        assert_eq!(health.read().await.consecutive_failures(), 0);

        // Inside the cooldown another run of failures does not reconnect again.
        handle.drop_link();
        for _ in 0..6 {
            poller.poll_once().await;
        }
        assert!(!handle.is_open());
        assert_eq!(health.read().await.reset_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_waits_out_the_cooldown() {
        let (mut poller, handle, _session, health, link) = setup().await;
        handle.drop_link();
        handle.refuse_connect(true);

        for _ in 0..5 {
            poller.poll_once().await;
        }
        let report = health.read().await.report(Instant::now());
        assert_eq!(report.reset_count, 0);
        assert_eq!(report.reconnect_attempts, 1);
        assert!(report.last_error.is_some());
        assert!(!health.read().await.is_connected());
        assert!(!link.is_open());

        // The port is back, but the last attempt is still inside the cooldown.
        handle.refuse_connect(false);
        poller.poll_once().await;
        assert!(!handle.is_open());
        assert_eq!(health.read().await.reset_count(), 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        poller.poll_once().await;
        assert!(handle.is_open());
        assert!(link.is_open());
        assert_eq!(health.read().await.reset_count(), 1);

        let outcome = poller.poll_once().await;
        assert!(matches!(outcome, PollOutcome::Polled(_)));
        let health = health.read().await;
        assert_eq!(health.reset_count(), 1);
        assert_eq!(health.report(Instant::now()).reconnect_attempts, 0);
        assert!(health.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_is_skipped_while_link_is_claimed() {
        let (mut poller, handle, _session, _health, link) = setup().await;
        let _claim = link.try_claim().unwrap();
        handle.press_output_button(true);

        assert_eq!(poller.poll_once().await, PollOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_session_logs_points_each_poll() {
        let (mut poller, handle, session, _health, _link) = setup().await;
        handle.press_output_button(true);

        poller.poll_once().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        poller.poll_once().await;

        let points = session.data_points().await;
        assert_eq!(points.len(), 2);
        assert!(points[1].elapsed_s > points[0].elapsed_s);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_exits_on_shutdown() {
        let (poller, _handle, _session, _health, _link) = setup().await;
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(poller.run(rx));
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();

        task.await.unwrap();
    }
}
