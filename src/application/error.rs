// Errors surfaced to callers of the command surface
use crate::application::instrument::InstrumentError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Device error: {0}")]
    Device(#[from] InstrumentError),

    #[error("Test already running")]
    AlreadyRunning,

    #[error("No test running")]
    NotRunning,

    #[error("Unknown test cycle: {0}")]
    UnknownCycle(String),

    #[error("No data to export")]
    NoData,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Export failed: {0}")]
    Export(String),
}

impl From<csv::Error> for ControllerError {
    fn from(err: csv::Error) -> Self {
        ControllerError::Export(err.to_string())
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(err: std::io::Error) -> Self {
        ControllerError::Export(err.to_string())
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;
