// Instrument trait - The capability surface of the electronic load
use crate::domain::telemetry::DeviceState;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single instrument call, classified where it happens.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InstrumentError {
    #[error("instrument link is not open")]
    NotConnected,

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device signalled data but returned none")]
    Empty,

    #[error("link I/O error: {0}")]
    Io(String),
}

impl InstrumentError {
    /// True for failures of the communication channel itself, after which the
    /// link buffers are worth flushing.
    pub fn is_link_fault(&self) -> bool {
        matches!(
            self,
            InstrumentError::Timeout(_)
                | InstrumentError::Protocol(_)
                | InstrumentError::Empty
                | InstrumentError::Io(_)
        )
    }
}

impl From<std::io::Error> for InstrumentError {
    fn from(err: std::io::Error) -> Self {
        InstrumentError::Io(err.to_string())
    }
}

/// An electronic load reachable over some command channel.
///
/// Every method talks to the device; callers serialise access through
/// [`InstrumentLink`](super::link::InstrumentLink), which also bounds each
/// call with a timeout.
#[async_trait]
pub trait Instrument: Send {
    /// Open the underlying channel.
    async fn connect(&mut self) -> Result<(), InstrumentError>;

    /// Close the underlying channel. Closing a closed link is not an error.
    async fn close(&mut self) -> Result<(), InstrumentError>;

    fn is_open(&self) -> bool;

    /// Pull whatever raw data the device has pushed since the last call.
    async fn refresh(&mut self) -> Result<(), InstrumentError>;

    async fn read_state(&mut self) -> Result<DeviceState, InstrumentError>;

    async fn set_current(&mut self, amps: f64) -> Result<(), InstrumentError>;

    async fn set_cutoff(&mut self, volts: f64) -> Result<(), InstrumentError>;

    async fn set_output(&mut self, on: bool) -> Result<(), InstrumentError>;

    /// Zero the accumulated charge and energy counters.
    async fn reset_accumulators(&mut self) -> Result<(), InstrumentError>;

    /// Discard anything buffered in either direction.
    async fn flush(&mut self) -> Result<(), InstrumentError>;
}
