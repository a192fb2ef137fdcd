//! Modbus protocol limits

/// Transaction ID + protocol ID + length field
pub const MBAP_HEADER_LEN: usize = 6;

/// Largest value of the MBAP length field (unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 254;

/// Largest PDU (function code + data)
pub const MAX_PDU_SIZE: usize = 253;

/// Registers a single FC03/FC04 request may ask for
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

/// Receive buffer large enough for any MBAP frame
pub const MODBUS_RESPONSE_BUFFER_SIZE: usize = MBAP_HEADER_LEN + MAX_MBAP_LENGTH;

/// Exception flag set in a response's function code
pub const EXCEPTION_FLAG: u8 = 0x80;
