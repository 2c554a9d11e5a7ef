// Test cycle domain models
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_cutoff_voltage() -> f64 {
    2.5
}

fn default_log_interval() -> f64 {
    5.0
}

fn default_ramp_steps() -> u32 {
    30
}

/// A named collection of test cycles, keyed by the name used to run them.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CycleCatalog {
    #[serde(default)]
    pub test_cycles: BTreeMap<String, TestCycleDefinition>,
}

impl CycleCatalog {
    pub fn names(&self) -> Vec<String> {
        self.test_cycles.keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&TestCycleDefinition> {
        self.test_cycles.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TestCycleDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub duration_estimate: String,
    pub phases: Vec<TestPhaseDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TestPhaseDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub kind: PhaseKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PhaseKind {
    Rest {
        duration: f64,
    },
    Discharge {
        current: f64,
        #[serde(default = "default_cutoff_voltage")]
        cutoff_voltage: f64,
        #[serde(default)]
        max_time: Option<f64>,
        /// Fixed run time; when present voltage and max_time are ignored.
        #[serde(default)]
        duration: Option<f64>,
        #[serde(default = "default_log_interval")]
        log_interval: f64,
    },
    Ramp {
        start_current: f64,
        end_current: f64,
        duration: f64,
        #[serde(default = "default_ramp_steps")]
        steps: u32,
    },
}

impl PhaseKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            PhaseKind::Rest { .. } => "rest",
            PhaseKind::Discharge { .. } => "discharge",
            PhaseKind::Ramp { .. } => "ramp",
        }
    }
}

/// Current setpoint for step `step` of a linear ramp of `steps` steps.
///
/// The last step stops one increment short of `end`.
pub fn ramp_setpoint(start: f64, end: f64, steps: u32, step: u32) -> f64 {
    if steps == 0 {
        return start;
    }
    start + f64::from(step) * (end - start) / f64::from(steps)
}

/// Lifecycle of a scripted run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    #[default]
    Idle,
    Running,
    Aborted,
    Completed,
}

/// One row of a scripted-run log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CyclePoint {
    pub timestamp: DateTime<Local>,
    pub elapsed_s: f64,
    pub phase: String,
    pub phase_type: &'static str,
    pub voltage_v: f64,
    pub current_a: f64,
    pub capacity_mah: f64,
    pub energy_mwh: f64,
    pub temperature_c: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "test_cycles": {
            "capacity_check": {
                "name": "Capacity check",
                "description": "Rest then discharge to cutoff",
                "duration_estimate": "3-4 hours",
                "phases": [
                    {"name": "Settle", "description": "Let the cell relax",
                     "type": "rest", "duration": 300},
                    {"name": "Discharge", "type": "discharge",
                     "current": 1.0, "cutoff_voltage": 3.0},
                    {"name": "Pulse", "type": "discharge",
                     "current": 2.0, "duration": 10, "log_interval": 1},
                    {"name": "Sweep", "type": "ramp",
                     "start_current": 0.5, "end_current": 2.0, "duration": 60}
                ]
            }
        }
    }"#;

    #[test]
    fn test_catalog_parses_phase_variants_with_defaults() {
        let catalog: CycleCatalog = serde_json::from_str(CATALOG).unwrap();
        let cycle = catalog.get("capacity_check").unwrap();

        assert_eq!(cycle.phases.len(), 4);
        assert_eq!(cycle.phases[0].kind, PhaseKind::Rest { duration: 300.0 });
        assert_eq!(
            cycle.phases[1].kind,
            PhaseKind::Discharge {
                current: 1.0,
                cutoff_voltage: 3.0,
                max_time: None,
                duration: None,
                log_interval: 5.0,
            }
        );
        match &cycle.phases[2].kind {
            PhaseKind::Discharge { cutoff_voltage, duration, log_interval, .. } => {
                assert_eq!(*cutoff_voltage, 2.5);
                assert_eq!(*duration, Some(10.0));
                assert_eq!(*log_interval, 1.0);
            }
            other => panic!("unexpected phase {:?}", other),
        }
        match &cycle.phases[3].kind {
            PhaseKind::Ramp { steps, .. } => assert_eq!(*steps, 30),
            other => panic!("unexpected phase {:?}", other),
        }
        assert_eq!(catalog.names(), vec!["capacity_check".to_string()]);
    }

    #[test]
    fn test_unknown_phase_type_is_rejected() {
        let json = r#"{"name": "x", "type": "charge", "duration": 5}"#;
        assert!(serde_json::from_str::<TestPhaseDefinition>(json).is_err());
    }

    #[test]
    fn test_ramp_setpoints_are_linear() {
        let setpoints: Vec<f64> = (0..10).map(|i| ramp_setpoint(0.5, 2.0, 10, i)).collect();
        let expected = [0.5, 0.65, 0.8, 0.95, 1.1, 1.25, 1.4, 1.55, 1.7, 1.85];

        for (got, want) in setpoints.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{} != {}", got, want);
        }
    }
}
