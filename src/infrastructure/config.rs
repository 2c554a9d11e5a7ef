// Configuration loading - File and environment layers
use crate::application::controller::ControllerSettings;
use crate::application::cycle_executor::ExecutorSettings;
use crate::application::health_monitor::HealthPolicy;
use crate::application::poller::PollerSettings;
use crate::application::test_monitor::MonitorSettings;
use crate::infrastructure::simulated_load::SimulatedLoadConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub device: DeviceSection,
    pub polling: PollingConfig,
    pub monitor: MonitorConfig,
    pub cycles: CyclesConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Simulated,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeviceSection {
    pub kind: DeviceKind,
    pub call_timeout_ms: u64,
    pub simulated: SimulatedLoadConfig,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            kind: DeviceKind::Simulated,
            call_timeout_ms: 2000,
            simulated: SimulatedLoadConfig::default(),
        }
    }
}

impl DeviceSection {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub interval_step_ms: u64,
    pub disconnect_threshold: u32,
    pub reconnect_threshold: u32,
    pub reset_cooldown_s: u64,
    pub error_backoff_ms: u64,
    pub flush_settle_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 2000,
            max_interval_ms: 10_000,
            interval_step_ms: 500,
            disconnect_threshold: 3,
            reconnect_threshold: 5,
            reset_cooldown_s: 30,
            error_backoff_ms: 500,
            flush_settle_ms: 200,
        }
    }
}

impl PollingConfig {
    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms.max(self.min_interval_ms)),
            interval_step: Duration::from_millis(self.interval_step_ms),
            disconnect_threshold: self.disconnect_threshold,
            reconnect_threshold: self.reconnect_threshold,
            reset_cooldown: Duration::from_secs(self.reset_cooldown_s),
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            error_backoff: Duration::from_millis(self.error_backoff_ms),
            flush_settle: Duration::from_millis(self.flush_settle_ms),
            ..PollerSettings::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConfig {
    pub heartbeat_timeout_s: u64,
    pub validity_floor_v: f64,
    pub window: usize,
    pub low_voltage_margin_v: f64,
    pub command_spacing_ms: u64,
    pub stabilise_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_s: 15,
            validity_floor_v: 1.0,
            window: 60,
            low_voltage_margin_v: 0.2,
            command_spacing_ms: 300,
            stabilise_ms: 1000,
        }
    }
}

impl MonitorConfig {
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            command_spacing: Duration::from_millis(self.command_spacing_ms),
            stabilise: Duration::from_millis(self.stabilise_ms),
            monitor: MonitorSettings {
                heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_s),
                validity_floor_v: self.validity_floor_v,
                window: self.window.max(1),
                low_voltage_margin_v: self.low_voltage_margin_v,
                ..MonitorSettings::default()
            },
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CyclesConfig {
    pub catalog_path: PathBuf,
    pub export_dir: PathBuf,
}

impl Default for CyclesConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("config/test_cycles_18650.json"),
            export_dir: PathBuf::from("."),
        }
    }
}

impl CyclesConfig {
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            export_dir: self.export_dir.clone(),
            ..ExecutorSettings::default()
        }
    }
}

/// `config/loadctl.toml` if present, then `LOADCTL__SECTION__KEY` variables.
pub fn load_app_config() -> anyhow::Result<AppConfig> {
    load_app_config_from(Path::new("config/loadctl"))
}

pub fn load_app_config_from(file: &Path) -> anyhow::Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(file).required(false))
        .add_source(
            config::Environment::with_prefix("LOADCTL")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}
