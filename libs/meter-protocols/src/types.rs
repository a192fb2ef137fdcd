//! Meter data types
//!
//! Register descriptors, compiled register blocks, device endpoints and the
//! decoded readings they produce.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bytes::{ByteOrder, Endian};
use crate::error::ProtocolError;
use crate::transform::TransformTable;

/// Device identifier as assigned by the device registry
pub type DeviceId = u32;

/// Numeric layout of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl ValueType {
    /// Number of 16-bit registers one value occupies
    pub fn word_count(&self) -> u16 {
        match self {
            Self::Int16 | Self::Uint16 => 1,
            Self::Int32 | Self::Uint32 | Self::Float32 => 2,
            Self::Int64 | Self::Uint64 | Self::Float64 => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Int64 => "int64",
            Self::Uint64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl FromStr for ValueType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int16" | "i16" => Ok(Self::Int16),
            "uint16" | "u16" => Ok(Self::Uint16),
            "int32" | "i32" => Ok(Self::Int32),
            "uint32" | "u32" => Ok(Self::Uint32),
            "int64" | "i64" => Ok(Self::Int64),
            "uint64" | "u64" => Ok(Self::Uint64),
            "float32" | "f32" | "float" => Ok(Self::Float32),
            "float64" | "f64" | "double" => Ok(Self::Float64),
            other => Err(ProtocolError::schema(format!(
                "unknown value type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Register table a block is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadFunction {
    /// Read Holding Registers (FC 0x03)
    Holding,
    /// Read Input Registers (FC 0x04)
    Input,
}

impl ReadFunction {
    /// Modbus function code sent on the wire
    pub fn function_code(&self) -> u8 {
        match self {
            Self::Holding => 0x03,
            Self::Input => 0x04,
        }
    }
}

impl FromStr for ReadFunction {
    type Err = ProtocolError;

    /// Accepts symbolic names, the schema's own tokens (`1` holding, `2`
    /// input) and the Modbus function codes (`3`, `4`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "holding" | "hr" | "read_holding_registers" | "1" | "3" | "0x03" => Ok(Self::Holding),
            "input" | "ir" | "read_input_registers" | "2" | "4" | "0x04" => Ok(Self::Input),
            other => Err(ProtocolError::schema(format!(
                "unknown read function '{other}'"
            ))),
        }
    }
}

/// Measurement class of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataGroup {
    /// Point-in-time values (voltage, current, power)
    Instant,
    /// Monotonically increasing counters (energy totals)
    Cumulative,
}

impl DataGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instant => "instant",
            Self::Cumulative => "cumulative",
        }
    }
}

impl FromStr for DataGroup {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "instant" => Ok(Self::Instant),
            "cumulative" => Ok(Self::Cumulative),
            other => Err(ProtocolError::schema(format!("unknown data group '{other}'"))),
        }
    }
}

impl fmt::Display for DataGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical register's metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub address: u16,
    /// Word count
    pub size: u16,
    pub value_type: ValueType,
    pub byte_order: Endian,
    pub word_order: Endian,
    pub function: ReadFunction,
    /// Logical attribute name (e.g. `active_energy_import`)
    pub attribute: String,
    pub group: DataGroup,
}

/// A contiguous run of registers fetched with a single request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterBlock {
    pub start_address: u16,
    /// Total word count of the block
    pub size: u16,
    pub value_type: ValueType,
    pub byte_order: Endian,
    pub word_order: Endian,
    pub function: ReadFunction,
    /// Attribute names in address order
    pub attributes: Vec<String>,
}

impl RegisterBlock {
    /// Combined order used to assemble each value's words
    pub fn order(&self) -> ByteOrder {
        ByteOrder::from_endians(self.byte_order, self.word_order)
    }

    /// First address past the end of the block
    pub fn end_address(&self) -> u32 {
        u32::from(self.start_address) + u32::from(self.size)
    }
}

/// Transport spoken by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Tcp,
    Udp,
    Rtu,
    Tls,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Rtu => "rtu",
            Self::Tls => "tls",
        }
    }

    /// Transports the device client can open
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity status of a polled device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[default]
    Active,
    Broken,
    Disabled,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Broken => "broken",
            Self::Disabled => "disabled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A polled device and its compiled register maps
#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
    pub id: DeviceId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub protocol: ProtocolKind,
    pub unit_id: u8,
    /// Device model whose register schema was compiled into the blocks
    pub model: String,
    pub instant_blocks: Arc<Vec<RegisterBlock>>,
    pub cumulative_blocks: Arc<Vec<RegisterBlock>>,
    pub transforms: Arc<TransformTable>,
    pub status: DeviceStatus,
    pub notes: Option<String>,
}

impl DeviceEndpoint {
    /// Blocks to read for `group`
    pub fn blocks(&self, group: DataGroup) -> &[RegisterBlock] {
        match group {
            DataGroup::Instant => &self.instant_blocks,
            DataGroup::Cumulative => &self.cumulative_blocks,
        }
    }

    /// `host:port` used in connection errors and logs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One poll's decoded values for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedReading {
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub group: DataGroup,
    pub values: HashMap<String, f64>,
}

impl DecodedReading {
    pub fn new(device_id: DeviceId, timestamp: DateTime<Utc>, group: DataGroup) -> Self {
        Self {
            device_id,
            timestamp,
            group,
            values: HashMap::new(),
        }
    }

    pub fn get(&self, attribute: &str) -> Option<f64> {
        self.values.get(attribute).copied()
    }
}
