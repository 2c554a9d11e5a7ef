// Simulated load - Battery model behind the Instrument trait
use crate::application::instrument::{Instrument, InstrumentError};
use crate::domain::telemetry::DeviceState;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatedLoadConfig {
    pub capacity_mah: f64,
    pub full_voltage: f64,
    pub empty_voltage: f64,
    pub internal_resistance_ohm: f64,
    pub ambient_c: f64,
    /// Highest current setpoint the device accepts.
    pub max_current_a: f64,
    /// Answer every n-th read with an empty reply, as a flaky cable does.
    pub empty_reply_every: Option<u64>,
}

impl Default for SimulatedLoadConfig {
    fn default() -> Self {
        Self {
            capacity_mah: 2500.0,
            full_voltage: 4.2,
            empty_voltage: 3.0,
            internal_resistance_ohm: 0.05,
            ambient_c: 25.0,
            max_current_a: 20.0,
            empty_reply_every: None,
        }
    }
}

/// A command the controller sent to the load, in the order it was sent.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadCommand {
    Connect,
    Close,
    SetCurrent(f64),
    SetCutoff(f64),
    SetOutput(bool),
    ResetAccumulators,
    Flush,
}

#[derive(Debug, Default)]
struct SimState {
    open: bool,
    output_on: bool,
    current_limit: f64,
    cutoff: f64,
    charge_mah: f64,
    energy_mwh: f64,
    drawn_mah: f64,
    last_update: Option<Instant>,
    voltage_override: Option<f64>,
    voltage_script: VecDeque<f64>,
    faults: VecDeque<InstrumentError>,
    stall: Option<Duration>,
    refuse_connect: bool,
    reads: u64,
    commands: Vec<LoadCommand>,
}

impl SimState {
    fn open_circuit_voltage(&self, config: &SimulatedLoadConfig) -> f64 {
        let depth = if config.capacity_mah > 0.0 {
            (self.drawn_mah / config.capacity_mah).clamp(0.0, 1.0)
        } else {
            1.0
        };
        config.full_voltage - (config.full_voltage - config.empty_voltage) * depth
    }

    fn terminal_voltage(&self, config: &SimulatedLoadConfig) -> f64 {
        if let Some(volts) = self.voltage_override {
            return volts;
        }
        let drop = if self.output_on {
            self.current_limit * config.internal_resistance_ohm
        } else {
            0.0
        };
        (self.open_circuit_voltage(config) - drop).max(0.0)
    }

    fn advance(&mut self, config: &SimulatedLoadConfig, now: Instant) {
        let Some(last) = self.last_update.replace(now) else {
            return;
        };
        if !self.output_on {
            return;
        }

        let hours = now.saturating_duration_since(last).as_secs_f64() / 3600.0;
        let voltage = self.terminal_voltage(config);
        let drawn = self.current_limit * hours * 1000.0;
        self.charge_mah += drawn;
        self.drawn_mah += drawn;
        self.energy_mwh += voltage * self.current_limit * hours * 1000.0;

        if self.voltage_override.is_none()
            && self.cutoff > 0.0
            && self.terminal_voltage(config) <= self.cutoff
        {
            tracing::debug!("Simulated load reached its cutoff, output off");
            self.output_on = false;
        }
    }
}

/// A single cell discharged through a constant-current load.
///
/// Open-circuit voltage falls linearly from `full_voltage` to `empty_voltage`
/// with depth of discharge, minus an `I·R` drop while the output is on. The
/// load turns its own output off at the configured cutoff, like the real device.
pub struct SimulatedLoad {
    config: SimulatedLoadConfig,
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`SimulatedLoad`]: recorded commands and fault injection.
#[cfg(test)]
#[derive(Clone)]
pub struct SimulatedLoadHandle {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedLoad {
    pub fn new(config: SimulatedLoadConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    #[cfg(test)]
    pub fn with_handle(config: SimulatedLoadConfig) -> (Self, SimulatedLoadHandle) {
        let load = Self::new(config);
        let handle = SimulatedLoadHandle {
            state: load.state.clone(),
        };
        (load, handle)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    /// Common prologue of every device exchange: link check, stall, fault.
    async fn exchange(&self) -> Result<(), InstrumentError> {
        let stall = {
            let mut state = self.state();
            if !state.open {
                return Err(InstrumentError::NotConnected);
            }
            state.stall.take()
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        match self.state().faults.pop_front() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    async fn command(&self, command: LoadCommand) -> Result<(), InstrumentError> {
        self.exchange().await?;
        let now = Instant::now();
        let mut state = self.state();
        state.advance(&self.config, now);
        match &command {
            LoadCommand::SetCurrent(amps) if !(0.0..=self.config.max_current_a).contains(amps) => {
                return Err(InstrumentError::Protocol(format!(
                    "setpoint {amps} A outside 0..={} A",
                    self.config.max_current_a
                )));
            }
            LoadCommand::SetCurrent(amps) => state.current_limit = *amps,
            LoadCommand::SetCutoff(volts) => state.cutoff = *volts,
            LoadCommand::SetOutput(on) => state.output_on = *on,
            LoadCommand::ResetAccumulators => {
                state.charge_mah = 0.0;
                state.energy_mwh = 0.0;
            }
            LoadCommand::Flush | LoadCommand::Connect | LoadCommand::Close => {}
        }
        state.commands.push(command);
        Ok(())
    }
}

#[async_trait]
impl Instrument for SimulatedLoad {
    async fn connect(&mut self) -> Result<(), InstrumentError> {
        let mut state = self.state();
        if state.refuse_connect {
            return Err(InstrumentError::Io("simulated port unavailable".into()));
        }
        state.open = true;
        state.commands.push(LoadCommand::Connect);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), InstrumentError> {
        let mut state = self.state();
        state.open = false;
        state.commands.push(LoadCommand::Close);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    async fn refresh(&mut self) -> Result<(), InstrumentError> {
        self.exchange().await
    }

    async fn read_state(&mut self) -> Result<DeviceState, InstrumentError> {
        self.exchange().await?;
        let now = Instant::now();
        let mut state = self.state();
        state.advance(&self.config, now);
        state.reads += 1;
        if let Some(every) = self.config.empty_reply_every.filter(|n| *n > 0) {
            if state.reads % every == 0 {
                return Err(InstrumentError::Empty);
            }
        }

        let voltage = match state.voltage_script.pop_front() {
            Some(volts) => volts,
            None => state.terminal_voltage(&self.config),
        };
        let current = if state.output_on { state.current_limit } else { 0.0 };

        Ok(DeviceState {
            voltage_v: voltage,
            current_a: current,
            charge_mah: state.charge_mah,
            energy_mwh: state.energy_mwh,
            temperature_c: self.config.ambient_c + 4.0 * current,
            output_on: state.output_on,
            current_limit_a: state.current_limit,
            cutoff_v: state.cutoff,
        })
    }

    async fn set_current(&mut self, amps: f64) -> Result<(), InstrumentError> {
        self.command(LoadCommand::SetCurrent(amps)).await
    }

    async fn set_cutoff(&mut self, volts: f64) -> Result<(), InstrumentError> {
        self.command(LoadCommand::SetCutoff(volts)).await
    }

    async fn set_output(&mut self, on: bool) -> Result<(), InstrumentError> {
        self.command(LoadCommand::SetOutput(on)).await
    }

    async fn reset_accumulators(&mut self) -> Result<(), InstrumentError> {
        self.command(LoadCommand::ResetAccumulators).await
    }

    async fn flush(&mut self) -> Result<(), InstrumentError> {
        self.command(LoadCommand::Flush).await
    }
}

#[cfg(test)]
impl SimulatedLoadHandle {
    pub fn commands(&self) -> Vec<LoadCommand> {
        lock(&self.state).commands.clone()
    }

    /// Every current setpoint sent, in order.
    pub fn setpoints(&self) -> Vec<f64> {
        lock(&self.state)
            .commands
            .iter()
            .filter_map(|c| match c {
                LoadCommand::SetCurrent(amps) => Some(*amps),
                _ => None,
            })
            .collect()
    }

    pub fn last_output_command(&self) -> Option<bool> {
        lock(&self.state).commands.iter().rev().find_map(|c| match c {
            LoadCommand::SetOutput(on) => Some(*on),
            _ => None,
        })
    }

    pub fn output_on(&self) -> bool {
        lock(&self.state).output_on
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Make the next device exchange fail with `fault`. Faults queue up.
    pub fn fail_next(&self, fault: InstrumentError) {
        lock(&self.state).faults.push_back(fault);
    }

    pub fn stall_next_call(&self, delay: Duration) {
        lock(&self.state).stall = Some(delay);
    }

    /// Pin the reported voltage, bypassing the cell model.
    pub fn set_voltage(&self, volts: Option<f64>) {
        lock(&self.state).voltage_override = volts;
    }

    /// Voltages returned by the next reads, one per read.
    pub fn script_voltages(&self, volts: impl IntoIterator<Item = f64>) {
        lock(&self.state).voltage_script.extend(volts);
    }

    pub fn refuse_connect(&self, refuse: bool) {
        lock(&self.state).refuse_connect = refuse;
    }

    /// Drop the link from the device side, as an unplugged cable would.
    pub fn drop_link(&self) {
        lock(&self.state).open = false;
    }

    /// Switch the output from the front panel, without a controller command.
    pub fn press_output_button(&self, on: bool) {
        lock(&self.state).output_on = on;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_discharge_accumulates_charge() {
        let (mut load, _handle) = SimulatedLoad::with_handle(SimulatedLoadConfig::default());
        load.connect().await.unwrap();
        load.set_current(1.0).await.unwrap();
        load.set_output(true).await.unwrap();
        load.read_state().await.unwrap();

        tokio::time::advance(Duration::from_secs(360)).await;
        let state = load.read_state().await.unwrap();

        assert!((state.charge_mah - 100.0).abs() < 1e-6);
        assert!(state.voltage_v < 4.2);
        assert!(state.output_on);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_cutoff_turns_output_off() {
        let config = SimulatedLoadConfig {
            capacity_mah: 10.0,
            ..SimulatedLoadConfig::default()
        };
        let (mut load, handle) = SimulatedLoad::with_handle(config);
        load.connect().await.unwrap();
        load.set_cutoff(3.2).await.unwrap();
        load.set_current(1.0).await.unwrap();
        load.set_output(true).await.unwrap();
        load.read_state().await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        let state = load.read_state().await.unwrap();

        assert!(!state.output_on);
        assert!(!handle.output_on());
    }

    #[tokio::test]
    async fn test_closed_link_reports_not_connected() {
        let (mut load, _handle) = SimulatedLoad::with_handle(SimulatedLoadConfig::default());
        assert_eq!(load.read_state().await, Err(InstrumentError::NotConnected));
    }

    #[tokio::test]
    async fn test_injected_fault_is_returned_once() {
        let (mut load, handle) = SimulatedLoad::with_handle(SimulatedLoadConfig::default());
        load.connect().await.unwrap();
        handle.fail_next(InstrumentError::Empty);

        assert_eq!(load.refresh().await, Err(InstrumentError::Empty));
        assert!(load.refresh().await.is_ok());
    }

    #[tokio::test]
    async fn test_out_of_range_setpoint_is_a_protocol_error() {
        let (mut load, handle) = SimulatedLoad::with_handle(SimulatedLoadConfig::default());
        load.connect().await.unwrap();

        let result = load.set_current(25.0).await;

        assert!(matches!(result, Err(InstrumentError::Protocol(_))));
        assert!(result.unwrap_err().is_link_fault());
        assert!(handle.setpoints().is_empty());
        load.set_current(20.0).await.unwrap();
        assert_eq!(handle.setpoints(), vec![20.0]);
    }

    #[tokio::test]
    async fn test_flaky_link_answers_every_nth_read_empty() {
        let config = SimulatedLoadConfig {
            empty_reply_every: Some(3),
            ..SimulatedLoadConfig::default()
        };
        let mut load = SimulatedLoad::new(config);
        load.connect().await.unwrap();

        let mut results = Vec::new();
        for _ in 0..6 {
            results.push(load.read_state().await.err());
        }

        let empty = Some(InstrumentError::Empty);
        assert_eq!(results, vec![None, None, empty.clone(), None, None, empty]);
    }
}
