//! Modbus wire layer
//!
//! PDU construction, MBAP framing and the TCP/UDP connections the device
//! client reads registers over.

pub mod connection;
pub mod constants;
pub mod pdu;
pub mod transport;

use thiserror::Error;

pub use connection::ModbusConnection;
pub use pdu::ModbusPdu;
pub use transport::ModbusFrameProcessor;

/// Failure of a single request/response exchange
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid protocol ID: expected 0, got {0}")]
    ProtocolId(u16),

    #[error("Invalid frame length: header says {declared}, got {actual}")]
    Length { declared: usize, actual: usize },

    #[error("Transaction ID mismatch: sent {sent:04X}, received {received:04X}")]
    TransactionMismatch { sent: u16, received: u16 },

    #[error("Unit ID mismatch: sent {sent}, received {received}")]
    UnitMismatch { sent: u8, received: u8 },

    #[error("Function code mismatch: sent {sent:02X}, received {received:02X}")]
    FunctionMismatch { sent: u8, received: u8 },

    #[error("Modbus exception {code:02X} ({description})")]
    Exception { code: u8, description: &'static str },

    #[error("PDU exceeds {0} bytes")]
    PduOverflow(usize),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(String),
}
