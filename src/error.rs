//! Error types for the RTSA streaming crate

use thiserror::Error;

use crate::protocol::DeviceState;
use crate::status::Status;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Device session errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("{operation} failed: {status}")]
    Call {
        operation: &'static str,
        status: Status,
    },

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Config item not found: {0}")]
    ConfigNotFound(String),

    #[error("Invalid device type: {0}")]
    InvalidKind(String),

    #[error("Timed out waiting for state {expected} (last seen {last:?})")]
    StateTimeout {
        expected: DeviceState,
        last: Option<DeviceState>,
    },
}

impl DeviceError {
    /// Status word behind a failed driver call
    pub fn status(&self) -> Option<Status> {
        match self {
            DeviceError::Call { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Streaming engine errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Send failed at packet {index}: {source}")]
    Send {
        index: usize,
        #[source]
        source: DeviceError,
    },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Device is not running (state {0:?})")]
    NotRunning(Option<DeviceState>),

    #[error("Streaming cancelled")]
    Cancelled,

    #[error("Device clock reading is not finite: {0}")]
    InvalidClock(f64),

    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("Sample block {index} holds {got} floats, expected at least {expected}")]
    BlockSize {
        index: usize,
        got: usize,
        expected: usize,
    },
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
