// Telemetry domain models
use chrono::{DateTime, Local};
use serde::Serialize;

/// Below this current the resistance reading is meaningless and reported as 0.
const RESISTANCE_MIN_CURRENT_A: f64 = 0.001;

/// Full instrument state as returned by a single read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DeviceState {
    pub voltage_v: f64,
    pub current_a: f64,
    pub charge_mah: f64,
    pub energy_mwh: f64,
    pub temperature_c: f64,
    pub output_on: bool,
    pub current_limit_a: f64,
    pub cutoff_v: f64,
}

/// Point-in-time view of the load, replaced wholesale on every poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub resistance: f64,
    pub capacity: f64,
    pub energy: f64,
    pub temperature: f64,
    pub runtime: f64,
}

impl TelemetrySnapshot {
    pub fn from_state(state: &DeviceState, runtime_s: f64) -> Self {
        let voltage = state.voltage_v.max(0.0);
        let current = state.current_a.max(0.0);
        let resistance = if current > RESISTANCE_MIN_CURRENT_A {
            voltage / current
        } else {
            0.0
        };

        Self {
            voltage,
            current,
            power: voltage * current,
            resistance,
            capacity: state.charge_mah,
            energy: state.energy_mwh,
            temperature: state.temperature_c,
            runtime: runtime_s,
        }
    }
}

/// One row of the live-test log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoggedDataPoint {
    pub timestamp: DateTime<Local>,
    #[serde(rename = "time")]
    pub elapsed_s: f64,
    pub voltage: f64,
    pub current: f64,
    pub capacity: f64,
}

impl LoggedDataPoint {
    pub fn new(timestamp: DateTime<Local>, snapshot: &TelemetrySnapshot) -> Self {
        Self {
            timestamp,
            elapsed_s: snapshot.runtime,
            voltage: snapshot.voltage,
            current: snapshot.current,
            capacity: snapshot.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_derives_power_and_resistance() {
        let state = DeviceState {
            voltage_v: 3.6,
            current_a: 1.2,
            charge_mah: 150.0,
            energy_mwh: 540.0,
            temperature_c: 27.5,
            output_on: true,
            current_limit_a: 1.2,
            cutoff_v: 3.0,
        };

        let snapshot = TelemetrySnapshot::from_state(&state, 12.0);

        assert!((snapshot.power - 4.32).abs() < 1e-9);
        assert!((snapshot.resistance - 3.0).abs() < 1e-9);
        assert_eq!(snapshot.capacity, 150.0);
        assert_eq!(snapshot.runtime, 12.0);
    }

    #[test]
    fn test_resistance_is_zero_below_one_milliamp() {
        let state = DeviceState {
            voltage_v: 4.1,
            current_a: 0.0005,
            ..DeviceState::default()
        };

        let snapshot = TelemetrySnapshot::from_state(&state, 0.0);
        assert_eq!(snapshot.resistance, 0.0);
    }
}
