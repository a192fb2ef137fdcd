//! Modbus connections
//!
//! TCP streams and connected UDP sockets carrying MBAP frames.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::constants::{MBAP_HEADER_LEN, MODBUS_RESPONSE_BUFFER_SIZE};
use super::transport::MbapHeader;
use super::FrameError;

/// An open Modbus connection
#[derive(Debug)]
pub enum ModbusConnection {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl ModbusConnection {
    /// Open a TCP connection within `connect_timeout`
    pub async fn connect_tcp(addr: &str, connect_timeout: Duration) -> Result<Self, String> {
        debug!("TCP connecting: {}", addr);
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                debug!("TCP connected: {}", addr);
                Ok(Self::Tcp(stream))
            },
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                Err(format!("timed out after {}ms", connect_timeout.as_millis()))
            },
        }
    }

    /// Bind an ephemeral UDP socket and connect it to `addr`
    pub async fn connect_udp(addr: &str, connect_timeout: Duration) -> Result<Self, String> {
        debug!("UDP connecting: {}", addr);
        let open = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(addr).await?;
            Ok::<_, std::io::Error>(socket)
        };
        match timeout(connect_timeout, open).await {
            Ok(Ok(socket)) => Ok(Self::Udp(socket)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}ms", connect_timeout.as_millis())),
        }
    }

    /// Send one request frame and receive one response frame within
    /// `read_timeout`.
    pub async fn exchange(
        &mut self,
        request: &[u8],
        read_timeout: Duration,
    ) -> Result<Vec<u8>, FrameError> {
        match timeout(read_timeout, self.exchange_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(FrameError::Timeout(format!(
                "no response within {}ms",
                read_timeout.as_millis()
            ))),
        }
    }

    async fn exchange_inner(&mut self, request: &[u8]) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Tcp(stream) => {
                stream
                    .write_all(request)
                    .await
                    .map_err(|e| FrameError::Io(format!("TCP send error: {e}")))?;
                debug!("TCP TX: {}B", request.len());

                let mut frame = vec![0u8; MBAP_HEADER_LEN + 1];
                stream
                    .read_exact(&mut frame)
                    .await
                    .map_err(|e| FrameError::Io(format!("TCP receive error: {e}")))?;

                let header = MbapHeader::parse(&frame)?;
                let total = header.frame_len();
                if total < frame.len() || total > MODBUS_RESPONSE_BUFFER_SIZE {
                    return Err(FrameError::Length {
                        declared: total,
                        actual: frame.len(),
                    });
                }

                frame.resize(total, 0);
                stream
                    .read_exact(&mut frame[MBAP_HEADER_LEN + 1..])
                    .await
                    .map_err(|e| FrameError::Io(format!("TCP receive error: {e}")))?;
                debug!("TCP RX: {}B", frame.len());
                Ok(frame)
            },
            Self::Udp(socket) => {
                socket
                    .send(request)
                    .await
                    .map_err(|e| FrameError::Io(format!("UDP send error: {e}")))?;
                debug!("UDP TX: {}B", request.len());

                let mut buffer = vec![0u8; MODBUS_RESPONSE_BUFFER_SIZE];
                let received = socket
                    .recv(&mut buffer)
                    .await
                    .map_err(|e| FrameError::Io(format!("UDP receive error: {e}")))?;
                buffer.truncate(received);
                debug!("UDP RX: {}B", received);
                Ok(buffer)
            },
        }
    }

    /// Close the connection; TCP sends FIN, UDP just drops the socket
    pub async fn close(self) {
        if let Self::Tcp(mut stream) = self {
            if let Err(e) = stream.shutdown().await {
                debug!("TCP shutdown: {}", e);
            }
        }
    }
}
