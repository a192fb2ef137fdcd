//! Error handling for the polling service

use meter_protocols::{DeviceId, ProtocolError};
use thiserror::Error;

/// Polling service error type
#[derive(Error, Debug, Clone)]
pub enum PollSrvError {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Register map, decode and device communication errors
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A cumulative counter went backwards
    #[error(
        "Non-monotonic counter on device {device}: field '{field}' went from {previous} to {current}"
    )]
    NonMonotonicCounter {
        device: DeviceId,
        field: String,
        previous: f64,
        current: f64,
    },

    /// A cumulative counter is NaN or infinite
    #[error("Invalid counter on device {device}: field '{field}' is {value}")]
    InvalidCounter {
        device: DeviceId,
        field: String,
        value: f64,
    },

    /// The reference counter is too old to interpolate from
    #[error(
        "Stale reference on device {device}: {missed} intervals missed (limit {limit})"
    )]
    StaleReference {
        device: DeviceId,
        missed: i64,
        limit: i64,
    },

    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Input/Output errors
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type alias for the polling service
pub type Result<T> = std::result::Result<T, PollSrvError>;

impl PollSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        PollSrvError::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        PollSrvError::Storage(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        PollSrvError::Io(msg.into())
    }

    /// Rejected by reconciliation rather than failed to poll
    pub fn is_reconciliation_rejection(&self) -> bool {
        matches!(
            self,
            Self::NonMonotonicCounter { .. }
                | Self::InvalidCounter { .. }
                | Self::StaleReference { .. }
        )
    }
}

impl From<sqlx::Error> for PollSrvError {
    fn from(err: sqlx::Error) -> Self {
        PollSrvError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for PollSrvError {
    fn from(err: std::io::Error) -> Self {
        PollSrvError::Io(err.to_string())
    }
}

impl From<figment::Error> for PollSrvError {
    fn from(err: figment::Error) -> Self {
        PollSrvError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for PollSrvError {
    fn from(err: serde_json::Error) -> Self {
        PollSrvError::Storage(format!("serialization: {err}"))
    }
}
