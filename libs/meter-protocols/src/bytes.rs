//! Byte and word order handling for multi-register values
//!
//! Modbus transfers 16-bit words, each big-endian on the wire. Meters differ in
//! how they lay a 32/64-bit value across those words:
//!
//! - **Word order**: whether the most significant word comes first.
//! - **Byte order**: whether the two bytes inside each word are swapped.
//!
//! For 32-bit value `0x12345678` stored in registers:
//! - `BigEndian (ABCD)`: [0x1234, 0x5678]
//! - `LittleEndian (DCBA)`: [0x7856, 0x3412]
//! - `BigEndianSwap (CDAB)`: [0x5678, 0x1234]
//! - `LittleEndianSwap (BADC)`: [0x3412, 0x7856]

use serde::{Deserialize, Serialize};

/// Endianness parsed from a schema hint string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

impl Endian {
    /// Parse a register-schema order hint.
    ///
    /// Hints of the `msb...` and `f2...` families select little-endian; every
    /// other hint (including an empty cell) selects big-endian.
    pub fn from_hint(hint: &str) -> Self {
        let normalized = hint.trim().to_ascii_lowercase();
        if normalized.starts_with("msb") || normalized.starts_with("f2") {
            Self::Little
        } else {
            Self::Big
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Big => "big",
            Self::Little => "little",
        }
    }
}

/// Combined byte/word order of a multi-register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// ABCD: most significant word first, bytes as transmitted
    #[default]
    BigEndian,
    /// DCBA: least significant word first, bytes swapped
    LittleEndian,
    /// CDAB: least significant word first, bytes as transmitted
    BigEndianSwap,
    /// BADC: most significant word first, bytes swapped
    LittleEndianSwap,
}

impl ByteOrder {
    /// Combine a byte order and a word order into the ABCD notation
    pub fn from_endians(byte_order: Endian, word_order: Endian) -> Self {
        match (byte_order, word_order) {
            (Endian::Big, Endian::Big) => Self::BigEndian,
            (Endian::Little, Endian::Little) => Self::LittleEndian,
            (Endian::Big, Endian::Little) => Self::BigEndianSwap,
            (Endian::Little, Endian::Big) => Self::LittleEndianSwap,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
        }
    }

    fn swaps_words(&self) -> bool {
        matches!(self, Self::LittleEndian | Self::BigEndianSwap)
    }

    fn swaps_bytes(&self) -> bool {
        matches!(self, Self::LittleEndian | Self::LittleEndianSwap)
    }
}

impl std::fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convert registers to big-endian value bytes according to `order`.
///
/// The returned bytes can be fed straight into `from_be_bytes`.
pub fn regs_to_bytes(regs: &[u16], order: ByteOrder) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(regs.len() * 2);
    let mut push = |reg: u16| {
        let [hi, lo] = reg.to_be_bytes();
        if order.swaps_bytes() {
            bytes.extend_from_slice(&[lo, hi]);
        } else {
            bytes.extend_from_slice(&[hi, lo]);
        }
    };

    if order.swaps_words() {
        regs.iter().rev().copied().for_each(&mut push);
    } else {
        regs.iter().copied().for_each(&mut push);
    }
    bytes
}

/// Inverse of [`regs_to_bytes`]: lay big-endian value bytes out as registers.
///
/// `bytes.len()` must be even; a trailing odd byte is ignored.
pub fn bytes_to_regs(bytes: &[u8], order: ByteOrder) -> Vec<u16> {
    let mut regs: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if order.swaps_bytes() {
                u16::from_be_bytes([pair[1], pair[0]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();

    if order.swaps_words() {
        regs.reverse();
    }
    regs
}
