//! Modbus PDU
//!
//! Fixed-capacity buffer holding a function code and its data, plus the
//! request builder and response parser for FC03/FC04 register reads.

use tracing::{debug, warn};

use super::constants::{EXCEPTION_FLAG, MAX_PDU_SIZE};
use super::FrameError;
use crate::types::ReadFunction;

/// Modbus Protocol Data Unit
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, FrameError> {
        let mut pdu = Self::new();
        pdu.extend(data)?;
        Ok(pdu)
    }

    /// Build a Read Holding/Input Registers request
    pub fn read_request(function: ReadFunction, address: u16, count: u16) -> Self {
        let mut pdu = Self::new();
        let fc = function.function_code();
        let [addr_hi, addr_lo] = address.to_be_bytes();
        let [qty_hi, qty_lo] = count.to_be_bytes();
        pdu.data[..5].copy_from_slice(&[fc, addr_hi, addr_lo, qty_hi, qty_lo]);
        pdu.len = 5;
        debug!("PDU built: FC={:02X}, addr={}, qty={}", fc, address, count);
        pdu
    }

    pub fn push(&mut self, byte: u8) -> Result<(), FrameError> {
        if self.len >= MAX_PDU_SIZE {
            return Err(FrameError::PduOverflow(MAX_PDU_SIZE));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        if self.len + bytes.len() > MAX_PDU_SIZE {
            return Err(FrameError::PduOverflow(MAX_PDU_SIZE));
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.as_slice().get(1).copied()
        } else {
            None
        }
    }

    /// Parse a register read response sent for function code `expected_fc`.
    ///
    /// Returns every complete register in the payload. A byte count that
    /// disagrees with the payload is logged and the shorter of the two is
    /// used; the decoder rejects the result if the word count is wrong.
    pub fn parse_read_response(&self, expected_fc: u8) -> Result<Vec<u16>, FrameError> {
        let data = self.as_slice();
        let Some(&fc) = data.first() else {
            return Err(FrameError::TooShort(0));
        };

        if fc & EXCEPTION_FLAG != 0 {
            let code = self.exception_code().unwrap_or(0);
            return Err(FrameError::Exception {
                code,
                description: exception_description(code),
            });
        }
        if fc != expected_fc {
            return Err(FrameError::FunctionMismatch {
                sent: expected_fc,
                received: fc,
            });
        }
        if data.len() < 2 {
            return Err(FrameError::TooShort(data.len()));
        }

        let byte_count = usize::from(data[1]);
        let payload = &data[2..];
        if byte_count != payload.len() {
            warn!(
                "Byte count mismatch: header={}, payload={}",
                byte_count,
                payload.len()
            );
        }

        let usable = byte_count.min(payload.len());
        Ok(payload[..usable]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable Modbus exception code
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
