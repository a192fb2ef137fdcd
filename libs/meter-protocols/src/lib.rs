//! Meter protocols
//!
//! Register maps, value decoding and the Modbus TCP/UDP device client used by
//! the polling service.
//!
//! - [`register_map`]: CSV register schema to contiguous read blocks
//! - [`codec`]: raw register words to engineering values
//! - [`transform`]: per-attribute post-processing of decoded values
//! - [`modbus`]: PDU, MBAP framing and connections
//! - [`client`]: one-connection-per-poll device client
//! - [`simulator`]: in-memory Modbus meter for tests

pub mod bytes;
pub mod client;
pub mod codec;
pub mod error;
pub mod modbus;
pub mod register_map;
pub mod simulator;
pub mod transform;
pub mod types;

pub use client::{Connector, DeviceClient, ModbusConnector, ModbusTransport, Transport};
pub use error::{ProtocolError, Result};
pub use register_map::{compile_blocks, load_schema_csv, parse_schema_csv, RegisterMap, SchemaRow};
pub use transform::{TransformTable, ValueTransform};
pub use types::{
    DataGroup, DecodedReading, DeviceEndpoint, DeviceId, DeviceStatus, ProtocolKind,
    ReadFunction, RegisterBlock, RegisterDescriptor, ValueType,
};
