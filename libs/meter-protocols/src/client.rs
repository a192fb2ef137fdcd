//! Device Client
//!
//! Opens one transport connection per poll, reads a group's register blocks
//! in order and decodes them into a single [`DecodedReading`]. The
//! connection is closed before `poll` returns, whatever the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::codec::decode_block;
use crate::error::{ProtocolError, Result};
use crate::modbus::constants::MODBUS_MAX_READ_REGISTERS;
use crate::modbus::{ModbusConnection, ModbusFrameProcessor, ModbusPdu};
use crate::types::{DataGroup, DecodedReading, DeviceEndpoint, ProtocolKind, ReadFunction};

/// An open connection able to read register ranges
#[async_trait]
pub trait Transport: Send {
    /// Read `count` registers starting at `address`.
    ///
    /// Any failure is reported as [`ProtocolError::Read`].
    async fn read_registers(
        &mut self,
        function: ReadFunction,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    /// Release the connection
    async fn close(&mut self);
}

/// Factory for transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `endpoint`.
    ///
    /// Fails with [`ProtocolError::Connection`] when the device is unreachable.
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn Transport>>;
}

/// Modbus TCP/UDP connector
#[derive(Debug, Clone)]
pub struct ModbusConnector {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl ModbusConnector {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

impl Default for ModbusConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(3))
    }
}

#[async_trait]
impl Connector for ModbusConnector {
    async fn connect(&self, endpoint: &DeviceEndpoint) -> Result<Box<dyn Transport>> {
        let addr = endpoint.address();
        let connection = match endpoint.protocol {
            ProtocolKind::Tcp => ModbusConnection::connect_tcp(&addr, self.connect_timeout).await,
            ProtocolKind::Udp => ModbusConnection::connect_udp(&addr, self.connect_timeout).await,
            other => return Err(ProtocolError::unsupported(other.as_str())),
        }
        .map_err(|reason| ProtocolError::connection(&addr, reason))?;

        Ok(Box::new(ModbusTransport {
            connection: Some(connection),
            frames: ModbusFrameProcessor::new(),
            unit_id: endpoint.unit_id,
            read_timeout: self.read_timeout,
        }))
    }
}

/// A live Modbus connection to one device
#[derive(Debug)]
pub struct ModbusTransport {
    connection: Option<ModbusConnection>,
    frames: ModbusFrameProcessor,
    unit_id: u8,
    read_timeout: Duration,
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn read_registers(
        &mut self,
        function: ReadFunction,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        if count == 0 || count > MODBUS_MAX_READ_REGISTERS {
            return Err(ProtocolError::read(
                address,
                count,
                format!("register count must be 1..={MODBUS_MAX_READ_REGISTERS}"),
            ));
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(ProtocolError::read(address, count, "connection closed"));
        };

        let pdu = ModbusPdu::read_request(function, address, count);
        let (transaction_id, request) = self.frames.build_frame(self.unit_id, &pdu);
        let response = connection
            .exchange(&request, self.read_timeout)
            .await
            .map_err(|e| ProtocolError::read(address, count, e.to_string()))?;

        self.frames
            .parse_frame(&response, transaction_id, self.unit_id)
            .and_then(|pdu| pdu.parse_read_response(function.function_code()))
            .map_err(|e| ProtocolError::read(address, count, e.to_string()))
    }

    async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}

/// Polls one device per call through a [`Connector`]
#[derive(Clone)]
pub struct DeviceClient {
    connector: Arc<dyn Connector>,
}

impl DeviceClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Read and decode every block of `group` for `endpoint`.
    ///
    /// Partial results are discarded if any block fails. Value transforms run
    /// once all blocks are merged.
    pub async fn poll(
        &self,
        endpoint: &DeviceEndpoint,
        group: DataGroup,
        collected_at: DateTime<Utc>,
    ) -> Result<DecodedReading> {
        if !endpoint.protocol.is_supported() {
            return Err(ProtocolError::unsupported(format!(
                "device {} uses {}",
                endpoint.id, endpoint.protocol
            )));
        }

        let mut transport = self.connector.connect(endpoint).await?;
        let result = read_blocks(transport.as_mut(), endpoint, group).await;
        transport.close().await;

        let mut values = result?;
        endpoint.transforms.apply(&mut values);
        debug!(
            "Device {} {} poll: {} values",
            endpoint.id,
            group,
            values.len()
        );

        Ok(DecodedReading {
            device_id: endpoint.id,
            timestamp: collected_at,
            group,
            values,
        })
    }
}

async fn read_blocks(
    transport: &mut dyn Transport,
    endpoint: &DeviceEndpoint,
    group: DataGroup,
) -> Result<HashMap<String, f64>> {
    let mut values = HashMap::new();
    for block in endpoint.blocks(group) {
        let words = transport
            .read_registers(block.function, block.start_address, block.size)
            .await
            .inspect_err(|e| warn!("Device {} read failed: {}", endpoint.id, e))?;
        values.extend(decode_block(block, &words)?);
    }
    Ok(values)
}
