//! Custom error types for the camera daemon.
//!
//! This module defines the primary error type, `CamdError`, shared by the chip
//! abstraction, the state machine and the data pipeline. Using the `thiserror`
//! crate, it provides a single taxonomy for everything that can go wrong between
//! a client request and the sensor.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidParameter`**: a request was malformed (unsupported binning, bad
//!   chip id, negative exposure). Rejected synchronously, no state change.
//! - **`OutOfRange`**: a region of interest does not fit on the chip.
//! - **`HardwareFault`**: the driver reported a fault while exposing or reading
//!   out. Aborts the cycle and drains the chip's queue.
//! - **`TransientIo`**: one readout step could not complete this tick. Retried by
//!   the poll loop, never surfaced to clients unless a driver escalates it.
//! - **`ProtocolViolation`**: a channel was asked to send data outside of an
//!   active readout, or a command arrived in a state that cannot serve it.
//! - **`NotSupported`**: an optional collaborator (cooler, filter wheel) is absent.
//! - **`Cancelled`**: a queued or running exposure was discarded by a stop or
//!   kill request.
//!
//! Configuration and I/O failures convert into `CamdError`
//! with the `?` operator.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the daemon error type.
pub type CamdResult<T> = std::result::Result<T, CamdError>;

/// Errors produced by the camera acquisition core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CamdError {
    /// A request carried an invalid value.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A region of interest exceeds the chip geometry.
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// The driver reported a hardware fault.
    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    /// A single I/O step did not complete and may be retried.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// The request does not fit the current readout/exposure state.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The camera has no collaborator for this operation.
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// The exposure was discarded by a stop or kill request.
    #[error("Exposure cancelled: {0}")]
    Cancelled(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// File or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<ConfigError> for CamdError {
    fn from(err: ConfigError) -> Self {
        CamdError::Config(err.to_string())
    }
}

impl From<std::io::Error> for CamdError {
    fn from(err: std::io::Error) -> Self {
        CamdError::Io(err.to_string())
    }
}

impl CamdError {
    /// True when the failed step may simply be tried again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, CamdError::TransientIo(_))
    }
}
