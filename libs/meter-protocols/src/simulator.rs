//! Modbus TCP/UDP meter simulator
//!
//! In-memory register tables served over MBAP for integration tests and
//! local development. Reads of unmapped registers return an Illegal Data
//! Address exception.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::bytes::ByteOrder;
use crate::codec::encode_value;
use crate::modbus::constants::{
    EXCEPTION_FLAG, MBAP_HEADER_LEN, MODBUS_MAX_READ_REGISTERS, MODBUS_RESPONSE_BUFFER_SIZE,
};
use crate::modbus::transport::{encode_frame, MbapHeader};
use crate::types::{ReadFunction, ValueType};

/// Simulated meter
#[derive(Clone, Default)]
pub struct MeterSimulator {
    holding_registers: Arc<RwLock<HashMap<u16, u16>>>,
    input_registers: Arc<RwLock<HashMap<u16, u16>>>,
    open_connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    silent: Arc<AtomicBool>,
}

impl MeterSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw words starting at `address`
    pub async fn set_registers(&self, function: ReadFunction, address: u16, words: &[u16]) {
        let mut table = self.table(function).write().await;
        for (offset, word) in words.iter().enumerate() {
            table.insert(address + offset as u16, *word);
        }
    }

    /// Encode `value` and store it starting at `address`
    pub async fn set_value(
        &self,
        function: ReadFunction,
        address: u16,
        value: f64,
        value_type: ValueType,
        order: ByteOrder,
    ) {
        let words = encode_value(value, value_type, order);
        self.set_registers(function, address, &words).await;
    }

    /// Stop answering requests (connections stay open)
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// TCP connections currently open
    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    /// Requests received over all transports
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn table(&self, function: ReadFunction) -> &Arc<RwLock<HashMap<u16, u16>>> {
        match function {
            ReadFunction::Holding => &self.holding_registers,
            ReadFunction::Input => &self.input_registers,
        }
    }

    /// Listen for Modbus TCP on an ephemeral localhost port
    pub async fn start_tcp(&self) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        info!("Meter simulator listening on tcp://{}", local_addr);

        let sim = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("New connection from {}", peer);
                        let sim = sim.clone();
                        sim.open_connections.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(async move {
                            if let Err(e) = sim.handle_connection(stream).await {
                                debug!("Connection error: {}", e);
                            }
                            sim.open_connections.fetch_sub(1, Ordering::SeqCst);
                        });
                    },
                    Err(e) => {
                        error!("Accept error: {}", e);
                        break;
                    },
                }
            }
        });

        Ok(local_addr)
    }

    /// Listen for Modbus over UDP on an ephemeral localhost port
    pub async fn start_udp(&self) -> io::Result<SocketAddr> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let local_addr = socket.local_addr()?;
        info!("Meter simulator listening on udp://{}", local_addr);

        let sim = self.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MODBUS_RESPONSE_BUFFER_SIZE];
            loop {
                let (n, peer) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                        break;
                    },
                };
                if let Some(response) = sim.respond(&buffer[..n]).await {
                    if let Err(e) = socket.send_to(&response, peer).await {
                        debug!("UDP send error: {}", e);
                    }
                }
            }
        });

        Ok(local_addr)
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> io::Result<()> {
        let mut header = [0u8; MBAP_HEADER_LEN + 1];
        loop {
            match stream.read_exact(&mut header).await {
                Ok(_) => {},
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            let mut frame = header.to_vec();
            frame.resize(MBAP_HEADER_LEN + length.max(1), 0);
            stream.read_exact(&mut frame[MBAP_HEADER_LEN + 1..]).await?;

            if let Some(response) = self.respond(&frame).await {
                stream.write_all(&response).await?;
            }
        }
    }

    /// Build the response frame for one request frame
    async fn respond(&self, frame: &[u8]) -> Option<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.silent.load(Ordering::SeqCst) {
            return None;
        }

        let header = MbapHeader::parse(frame).ok()?;
        let pdu = frame.get(MBAP_HEADER_LEN + 1..)?;
        if header.protocol_id != 0 || pdu.len() < 5 {
            return None;
        }

        let fc = pdu[0];
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let count = u16::from_be_bytes([pdu[3], pdu[4]]);
        let reply = |body: &[u8]| encode_frame(header.transaction_id, header.unit_id, body);

        let function = match fc {
            0x03 => ReadFunction::Holding,
            0x04 => ReadFunction::Input,
            _ => return Some(reply(&[fc | EXCEPTION_FLAG, 0x01])),
        };
        if count == 0 || count > MODBUS_MAX_READ_REGISTERS {
            return Some(reply(&[fc | EXCEPTION_FLAG, 0x03]));
        }

        let table = self.table(function).read().await;
        let mut body = vec![fc, (count * 2) as u8];
        for offset in 0..count {
            match table.get(&address.wrapping_add(offset)) {
                Some(word) => body.extend_from_slice(&word.to_be_bytes()),
                None => return Some(reply(&[fc | EXCEPTION_FLAG, 0x02])),
            }
        }
        Some(reply(&body))
    }
}
