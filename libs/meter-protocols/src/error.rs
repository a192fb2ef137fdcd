//! Protocol Error Types
//!
//! Error taxonomy shared by the register map compiler, the decoder and the
//! device client.

use thiserror::Error;

/// Result type for meter-protocols operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while compiling register maps or talking to a device
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Malformed or missing register schema field
    #[error("Schema error: {0}")]
    Schema(String),

    /// Raw register words do not match the block layout
    #[error("Decode error: block at {address} expects {expected} registers, got {actual}")]
    Decode {
        address: u16,
        expected: u16,
        actual: usize,
    },

    /// A register decoded to NaN or infinity, the "value not available"
    /// marker of many meters
    #[error("Decode error: '{attribute}' at address {address} is not a finite number")]
    NonFinite { attribute: String, address: u16 },

    /// Device configured with a transport the client cannot speak
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Transport connect failure
    #[error("Connection error: {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// Block read failure (I/O, timeout, exception response, malformed frame)
    #[error("Read error at address {address} (count {count}): {reason}")]
    Read {
        address: u16,
        count: u16,
        reason: String,
    },
}

impl ProtocolError {
    pub fn schema(msg: impl Into<String>) -> Self {
        ProtocolError::Schema(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        ProtocolError::UnsupportedProtocol(msg.into())
    }

    pub fn connection(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        ProtocolError::Connection {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    pub fn read(address: u16, count: u16, reason: impl Into<String>) -> Self {
        ProtocolError::Read {
            address,
            count,
            reason: reason.into(),
        }
    }

    /// Schema and decode errors point at a configuration defect rather than a
    /// transient device problem.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Schema(_) | Self::Decode { .. })
    }
}
