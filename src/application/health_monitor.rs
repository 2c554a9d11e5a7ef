// Connection health monitor - Adaptive poll interval and reconnect decisions
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub interval_step: Duration,
    /// Consecutive failures after which the link is reported disconnected.
    pub disconnect_threshold: u32,
    /// Consecutive failures after which a reconnect is forced.
    pub reconnect_threshold: u32,
    /// Minimum time between two forced reconnects.
    pub reset_cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(2000),
            max_interval: Duration::from_millis(10_000),
            interval_step: Duration::from_millis(500),
            disconnect_threshold: 3,
            reconnect_threshold: 5,
            reset_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    policy: HealthPolicy,
    consecutive_failures: u32,
    connected: bool,
    last_success: Option<Instant>,
    last_error: Option<String>,
    interval: Duration,
    reconnect_attempts: u32,
    reset_count: u32,
    last_reset: Option<Instant>,
}

/// Serializable view of the health state for status reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub reset_count: u32,
    pub update_interval: f64,
    pub seconds_since_success: Option<f64>,
}

impl ConnectionHealth {
    pub fn new(policy: HealthPolicy) -> Self {
        let interval = policy.min_interval;
        Self {
            policy,
            consecutive_failures: 0,
            connected: false,
            last_success: None,
            last_error: None,
            interval,
            reconnect_attempts: 0,
            reset_count: 0,
            last_reset: None,
        }
    }

    pub fn record_success(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.connected = true;
        self.last_success = Some(now);
        self.last_error = None;
        if self.interval > self.policy.min_interval {
            self.interval = self
                .interval
                .saturating_sub(self.policy.interval_step)
                .max(self.policy.min_interval);
        }
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
        self.interval = (self.interval + self.policy.interval_step).min(self.policy.max_interval);

        if self.consecutive_failures >= self.policy.disconnect_threshold {
            self.connected = false;
        }

        tracing::warn!(
            failures = self.consecutive_failures,
            interval_s = self.interval.as_secs_f64(),
            "Instrument call failed"
        );
    }

    /// Record the outcome of one instrument exchange.
    pub fn record<T, E: Display>(&mut self, outcome: &Result<T, E>, now: Instant) {
        match outcome {
            Ok(_) => self.record_success(now),
            Err(e) => self.record_failure(e.to_string()),
        }
    }

    pub fn should_force_reconnect(&self, now: Instant) -> bool {
        if self.consecutive_failures < self.policy.reconnect_threshold {
            return false;
        }
        match self.last_reset {
            Some(last) => now.saturating_duration_since(last) >= self.policy.reset_cooldown,
            None => true,
        }
    }

    /// Mark the start of a forced reconnect; starts the cooldown window.
    pub fn begin_reconnect(&mut self, now: Instant) {
        self.last_reset = Some(now);
        self.reconnect_attempts += 1;
    }

    pub fn reconnect_succeeded(&mut self, now: Instant) {
        self.reset_count += 1;
        self.reconnect_attempts = 0;
        self.consecutive_failures = 0;
        self.connected = true;
        self.last_success = Some(now);
        self.last_error = None;
    }

    pub fn reconnect_failed(&mut self, error: impl Into<String>) {
        self.connected = false;
        self.last_error = Some(error.into());
    }

    /// Note an error that did not come from the poll cycle, e.g. a status read.
    pub fn note_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn current_interval(&self) -> Duration {
        self.interval
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reset_count(&self) -> u32 {
        self.reset_count
    }

    pub fn report(&self, now: Instant) -> HealthReport {
        HealthReport {
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
            reconnect_attempts: self.reconnect_attempts,
            reset_count: self.reset_count,
            update_interval: self.interval.as_secs_f64(),
            seconds_since_success: self
                .last_success
                .map(|at| now.saturating_duration_since(at).as_secs_f64()),
        }
    }
}

/// Health state shared between the poller and the command surface.
#[derive(Clone)]
pub struct SharedHealth {
    inner: Arc<RwLock<ConnectionHealth>>,
}

impl SharedHealth {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ConnectionHealth::new(policy))),
        }
    }

    pub async fn read(&self) -> ConnectionHealth {
        self.inner.read().await.clone()
    }

    pub async fn update<R>(&self, f: impl FnOnce(&mut ConnectionHealth) -> R) -> R {
        let mut health = self.inner.write().await;
        f(&mut health)
    }
}
