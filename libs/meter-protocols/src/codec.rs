//! Protocol Decoder
//!
//! Converts raw register words of a [`RegisterBlock`] into engineering
//! values. Floating-point values are rounded to two decimals, the precision
//! required by the metering standards the readings are reported under.

use tracing::trace;

use crate::bytes::{bytes_to_regs, regs_to_bytes, ByteOrder};
use crate::error::{ProtocolError, Result};
use crate::types::{RegisterBlock, ValueType};

/// Round to two decimals
#[inline]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Decode a single value from exactly `value_type.word_count()` registers.
///
/// The caller guarantees the slice length; the block decoder checks it.
pub(crate) fn decode_value(words: &[u16], value_type: ValueType, order: ByteOrder) -> f64 {
    let bytes = regs_to_bytes(words, order);
    let value = match value_type {
        ValueType::Int16 => f64::from(i16::from_be_bytes([bytes[0], bytes[1]])),
        ValueType::Uint16 => f64::from(u16::from_be_bytes([bytes[0], bytes[1]])),
        ValueType::Int32 => f64::from(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        ValueType::Uint32 => f64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        ValueType::Int64 => i64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]) as f64,
        ValueType::Uint64 => u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]) as f64,
        ValueType::Float32 => round2(f64::from(f32::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        ValueType::Float64 => round2(f64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ])),
    };

    trace!(
        "Decoded {}: registers={:04X?}, order={}, value={}",
        value_type,
        words,
        order,
        value
    );
    value
}

/// Decode a block's raw words into `(attribute, value)` pairs in block order.
///
/// Fails with [`ProtocolError::Decode`] if the word count differs from the
/// block's declared size, and with [`ProtocolError::NonFinite`] if a float
/// register holds NaN or infinity.
pub fn decode_block(block: &RegisterBlock, words: &[u16]) -> Result<Vec<(String, f64)>> {
    if words.len() != usize::from(block.size) {
        return Err(ProtocolError::Decode {
            address: block.start_address,
            expected: block.size,
            actual: words.len(),
        });
    }

    let width = usize::from(block.value_type.word_count());
    if block.attributes.len() * width != words.len() {
        return Err(ProtocolError::Decode {
            address: block.start_address,
            expected: (block.attributes.len() * width) as u16,
            actual: words.len(),
        });
    }

    let order = block.order();
    let mut values = Vec::with_capacity(block.attributes.len());
    let chunks = block.attributes.iter().zip(words.chunks_exact(width));
    for (i, (attribute, chunk)) in chunks.enumerate() {
        let value = decode_value(chunk, block.value_type, order);
        if !value.is_finite() {
            return Err(ProtocolError::NonFinite {
                attribute: attribute.clone(),
                address: block.start_address + (i * width) as u16,
            });
        }
        values.push((attribute.clone(), value));
    }
    Ok(values)
}

/// Encode a value into registers, the inverse of `decode_value`.
///
/// Used by simulators and test harnesses; integers are rounded and saturate
/// at the target type's bounds.
pub fn encode_value(value: f64, value_type: ValueType, order: ByteOrder) -> Vec<u16> {
    let bytes: Vec<u8> = match value_type {
        ValueType::Int16 => (value.round() as i16).to_be_bytes().to_vec(),
        ValueType::Uint16 => (value.round() as u16).to_be_bytes().to_vec(),
        ValueType::Int32 => (value.round() as i32).to_be_bytes().to_vec(),
        ValueType::Uint32 => (value.round() as u32).to_be_bytes().to_vec(),
        ValueType::Int64 => (value.round() as i64).to_be_bytes().to_vec(),
        ValueType::Uint64 => (value.round() as u64).to_be_bytes().to_vec(),
        ValueType::Float32 => (value as f32).to_be_bytes().to_vec(),
        ValueType::Float64 => value.to_be_bytes().to_vec(),
    };
    bytes_to_regs(&bytes, order)
}
