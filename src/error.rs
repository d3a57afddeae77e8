//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the acquisition service.
//! Using the `thiserror` crate, it provides a centralized way to report the failures the
//! core can surface to its callers, from configuration problems to storage faults.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while extracting the settings.
//! - **`Configuration`**: Semantic errors in otherwise well-formed settings, caught by
//!   `Settings::validate`.
//! - **`Io`**: Wraps `std::io::Error` from the backing medium and serial port.
//! - **`Serialization`**: JSON encode/decode failures of the persisted log.
//! - **`Instrument`**: Errors from instrument drivers that escape the `Option` contract of
//!   `SensorLink::read` (e.g. a serial port that cannot be opened).
//! - **`Storage`**: Persistence failures that are not plain I/O (e.g. a corrupt log file).
//! - **`InvalidSetpoint`**: A rejected wind-speed setpoint.
//!
//! Transient instrument errors, connection loss and subscriber delivery failures are not
//! represented here: the acquisition loop absorbs them (skip, reconnect, evict) and only logs.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Failures surfaced by the acquisition core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings could not be extracted from the TOML and environment layers
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings parsed but failed `Settings::validate`
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or port I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode of records
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An instrument could not be opened or configured
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Persisted log is unusable (corrupt file, rejected write)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Setpoint that is negative or not finite
    #[error("Invalid wind speed setpoint: {0}")]
    InvalidSetpoint(f64),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Whether the operation may succeed if retried later without operator action.
    ///
    /// Storage and I/O faults are retried by the store on the next flush trigger;
    /// configuration problems are not.
    pub fn can_recover(&self) -> bool {
        match self {
            DaqError::Io(_) | DaqError::Storage(_) | DaqError::Instrument(_) => true,
            DaqError::Config(_)
            | DaqError::Configuration(_)
            | DaqError::Serialization(_)
            | DaqError::InvalidSetpoint(_) => false,
        }
    }
}
