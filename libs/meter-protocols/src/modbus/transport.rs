//! MBAP framing
//!
//! Wraps PDUs in the Modbus TCP application header and validates responses
//! against the request they answer. UDP uses the same framing, one frame per
//! datagram.

use bytes::{BufMut, BytesMut};
use tracing::debug;

use super::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use super::pdu::ModbusPdu;
use super::FrameError;

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Byte count of unit ID + PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Read the header from the first seven bytes of a frame
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < MBAP_HEADER_LEN + 1 {
            return Err(FrameError::TooShort(data.len()));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        })
    }

    /// Total frame size announced by this header
    pub fn frame_len(&self) -> usize {
        MBAP_HEADER_LEN + usize::from(self.length)
    }
}

/// Per-connection frame builder and response validator
#[derive(Debug)]
pub struct ModbusFrameProcessor {
    next_transaction_id: u16,
}

impl ModbusFrameProcessor {
    pub fn new() -> Self {
        Self {
            next_transaction_id: 1,
        }
    }

    /// Next transaction ID; wraps from 0xFFFF to 0x0000
    pub fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    /// Build a request frame, returning its transaction ID and bytes
    pub fn build_frame(&mut self, unit_id: u8, pdu: &ModbusPdu) -> (u16, Vec<u8>) {
        let transaction_id = self.next_transaction_id();
        (transaction_id, encode_frame(transaction_id, unit_id, pdu.as_slice()))
    }

    /// Validate a response frame against the request it should answer
    pub fn parse_frame(
        &self,
        data: &[u8],
        transaction_id: u16,
        unit_id: u8,
    ) -> Result<ModbusPdu, FrameError> {
        let header = MbapHeader::parse(data)?;
        debug!(
            "MBAP header: trans_id={:04X}, protocol_id={:04X}, length={}, unit_id={}",
            header.transaction_id, header.protocol_id, header.length, header.unit_id
        );

        if header.protocol_id != 0 {
            return Err(FrameError::ProtocolId(header.protocol_id));
        }
        if usize::from(header.length) > MAX_MBAP_LENGTH || data.len() != header.frame_len() {
            return Err(FrameError::Length {
                declared: header.frame_len(),
                actual: data.len(),
            });
        }
        if header.transaction_id != transaction_id {
            return Err(FrameError::TransactionMismatch {
                sent: transaction_id,
                received: header.transaction_id,
            });
        }
        if header.unit_id != unit_id {
            return Err(FrameError::UnitMismatch {
                sent: unit_id,
                received: header.unit_id,
            });
        }

        ModbusPdu::from_slice(&data[MBAP_HEADER_LEN + 1..])
    }
}

impl Default for ModbusFrameProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix `pdu` with an MBAP header
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    frame.to_vec()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::types::ReadFunction;

    #[test]
    fn test_frame_build_parse() {
        let mut processor = ModbusFrameProcessor::new();
        let pdu = ModbusPdu::read_request(ReadFunction::Holding, 100, 2);
        let (tid, frame) = processor.build_frame(7, &pdu);

        assert_eq!(tid, 1);
        assert_eq!(
            frame,
            vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x07, 0x03, 0x00, 0x64, 0x00, 0x02]
        );

        let response = encode_frame(tid, 7, &[0x03, 0x04, 0x00, 0x01, 0x00, 0x02]);
        let parsed = processor.parse_frame(&response, tid, 7).unwrap();
        assert_eq!(parsed.parse_read_response(0x03).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_transaction_id_wrap_around() {
        let mut processor = ModbusFrameProcessor {
            next_transaction_id: 0xFFFF,
        };
        assert_eq!(processor.next_transaction_id(), 0xFFFF);
        assert_eq!(processor.next_transaction_id(), 0x0000);
        assert_eq!(processor.next_transaction_id(), 0x0001);
    }

    #[test]
    fn test_validation_errors() {
        let processor = ModbusFrameProcessor::new();

        assert_eq!(
            processor.parse_frame(&[0x00, 0x01, 0x00], 1, 1).unwrap_err(),
            FrameError::TooShort(3)
        );

        let mut bad_protocol = encode_frame(1, 1, &[0x03, 0x00]);
        bad_protocol[3] = 0x01;
        assert_eq!(
            processor.parse_frame(&bad_protocol, 1, 1).unwrap_err(),
            FrameError::ProtocolId(1)
        );

        let frame = encode_frame(5, 1, &[0x03, 0x00]);
        assert!(matches!(
            processor.parse_frame(&frame, 6, 1),
            Err(FrameError::TransactionMismatch { sent: 6, received: 5 })
        ));
        assert!(matches!(
            processor.parse_frame(&frame, 5, 2),
            Err(FrameError::UnitMismatch { sent: 2, received: 1 })
        ));

        let mut truncated = encode_frame(5, 1, &[0x03, 0x02, 0x00, 0x01]);
        truncated.pop();
        assert!(matches!(
            processor.parse_frame(&truncated, 5, 1),
            Err(FrameError::Length { .. })
        ));
    }
}
