//! # Modbus TCP Transport
//!
//! MBAP framing over a single TCP stream to the PLC.
//!
//! ```text
//! | Transaction ID (2) | Protocol ID (2) = 0 | Length (2) | Unit ID (1) | PDU ... |
//! ```
//!
//! The transport owns the socket exclusively. A failed send or read drops the
//! stream so the connection is never reused in an unknown state; the next
//! request (or an explicit [`reconnect`](ModbusTransport::reconnect)) dials again.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use crate::error::{GatewayError, GatewayResult};
use crate::logging::format_hex_packet;
use crate::protocol::{ModbusRequest, ModbusResponse};

/// Transport layer abstraction for Modbus request/response exchanges.
pub trait ModbusTransport: Send + Sync {
    /// Send a request and wait for its response.
    ///
    /// Exception responses are returned as [`GatewayError::Exception`].
    fn request(
        &mut self,
        request: &ModbusRequest,
    ) -> impl Future<Output = GatewayResult<ModbusResponse>> + Send;

    /// Drop the current connection (if any) and dial again.
    fn reconnect(&mut self) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Whether the transport currently holds an open stream.
    fn is_connected(&self) -> bool;

    /// Close the connection and release the socket.
    fn close(&mut self) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Communication counters.
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub reconnects: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Modbus TCP transport implementation
pub struct TcpTransport {
    stream: Option<TcpStream>,
    address: SocketAddr,
    timeout: Duration,
    transaction_id: u16,
    stats: TransportStats,
    packet_logging: bool,
}

impl TcpTransport {
    /// Dial `address`, failing if the connection is not up within `timeout`.
    pub async fn new(address: SocketAddr, timeout: Duration) -> GatewayResult<Self> {
        let stream = Self::dial(address, timeout).await?;
        Ok(Self {
            stream: Some(stream),
            address,
            timeout,
            transaction_id: 0,
            stats: TransportStats::default(),
            packet_logging: false,
        })
    }

    /// Enable or disable hex logging of every frame.
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    async fn dial(address: SocketAddr, limit: Duration) -> GatewayResult<TcpStream> {
        match timeout(limit, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(GatewayError::connection(format!(
                "failed to connect to {}: {}",
                address, e
            ))),
            Err(_) => Err(GatewayError::timeout(
                format!("connect to {}", address),
                limit.as_millis() as u64,
            )),
        }
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    /// Wrap the request PDU in an MBAP header.
    fn encode_request(&mut self, request: &ModbusRequest) -> (u16, BytesMut) {
        let transaction_id = self.next_transaction_id();
        let pdu = request.encode_pdu();

        let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
        frame.put_u16(transaction_id);
        frame.put_u16(0);
        frame.put_u16((pdu.len() + 1) as u16);
        frame.put_u8(request.slave_id);
        frame.put_slice(&pdu);
        (transaction_id, frame)
    }

    fn log_packet(&self, direction: &str, data: &[u8]) {
        if self.packet_logging {
            info!("[MODBUS-TCP] {} {}", direction, format_hex_packet(data));
        }
    }

    /// Record a failure; connection-level faults also drop the stream.
    fn fail(&mut self, error: GatewayError) -> GatewayError {
        self.stats.errors += 1;
        if matches!(error, GatewayError::Timeout { .. }) {
            self.stats.timeouts += 1;
        }
        if error.is_connection_fault() {
            self.stream = None;
        }
        error
    }

    async fn exchange(&mut self, request: &ModbusRequest) -> GatewayResult<ModbusResponse> {
        let (transaction_id, frame) = self.encode_request(request);
        self.log_packet("send", &frame);
        let limit = self.timeout;
        let limit_ms = limit.as_millis() as u64;

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| GatewayError::connection("not connected"))?;

        match timeout(limit, stream.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(GatewayError::Io(e)),
            Err(_) => return Err(GatewayError::timeout("send request", limit_ms)),
        }
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        let mut header = [0u8; MBAP_HEADER_LEN];
        match timeout(limit, stream.read_exact(&mut header)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(GatewayError::Io(e)),
            Err(_) => return Err(GatewayError::timeout("read response header", limit_ms)),
        }

        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length < 2 || length > MAX_MBAP_LENGTH {
            return Err(GatewayError::frame(format!("invalid MBAP length {}", length)));
        }

        let mut body = vec![0u8; length];
        match timeout(limit, stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(GatewayError::Io(e)),
            Err(_) => return Err(GatewayError::timeout("read response body", limit_ms)),
        }

        self.stats.responses_received += 1;
        self.stats.bytes_received += (MBAP_HEADER_LEN + length) as u64;
        if self.packet_logging {
            let mut full = header.to_vec();
            full.extend_from_slice(&body);
            self.log_packet("receive", &full);
        }

        let received_id = u16::from_be_bytes([header[0], header[1]]);
        if received_id != transaction_id {
            return Err(GatewayError::frame(format!(
                "transaction id mismatch: sent {}, received {}",
                transaction_id, received_id
            )));
        }
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        if protocol_id != 0 {
            return Err(GatewayError::frame(format!("unexpected protocol id {}", protocol_id)));
        }
        if header[6] != request.slave_id {
            return Err(GatewayError::frame(format!(
                "unit id mismatch: sent {}, received {}",
                request.slave_id, header[6]
            )));
        }

        let response = ModbusResponse::from_pdu(body[0], &body[1..])?;
        if response.function != request.function {
            return Err(GatewayError::protocol(format!(
                "response function {:#04x} does not match request {:#04x}",
                response.function.to_u8(),
                request.function.to_u8()
            )));
        }
        Ok(response)
    }
}

impl ModbusTransport for TcpTransport {
    async fn request(&mut self, request: &ModbusRequest) -> GatewayResult<ModbusResponse> {
        request.validate()?;

        if self.stream.is_none() {
            self.reconnect().await?;
        }

        let response = match self.exchange(request).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e)),
        };

        if let Some(error) = response.get_exception() {
            self.stats.errors += 1;
            return Err(error);
        }
        Ok(response)
    }

    async fn reconnect(&mut self) -> GatewayResult<()> {
        self.close().await?;
        self.stats.reconnects += 1;
        debug!("reconnecting to PLC at {}", self.address);
        let stream = Self::dial(self.address, self.timeout).await?;
        self.stream = Some(stream);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> GatewayResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ModbusFunction;
    use tokio::net::TcpListener;

    /// Answer one request with `reply(pdu) -> response pdu`, echoing the MBAP header.
    async fn serve_once<F>(listener: TcpListener, reply: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut header = [0u8; 7];
        socket.read_exact(&mut header).await.unwrap();
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length - 1];
        socket.read_exact(&mut pdu).await.unwrap();

        let answer = reply(&pdu);
        let mut frame = Vec::new();
        frame.extend_from_slice(&header[..4]);
        frame.extend_from_slice(&((answer.len() + 1) as u16).to_be_bytes());
        frame.push(header[6]);
        frame.extend_from_slice(&answer);
        socket.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_input_registers_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, |pdu| {
            assert_eq!(pdu, &[0x04, 0x04, 0x08, 0x00, 0x02]);
            vec![0x04, 0x04, 0x01, 0xF4, 0x03, 0x52]
        }));

        let mut transport = TcpTransport::new(addr, Duration::from_secs(1)).await.unwrap();
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadInputRegisters, 1032, 2);
        let response = transport.request(&request).await.unwrap();
        assert_eq!(response.parse_registers().unwrap(), vec![500, 850]);

        let stats = transport.get_stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_exception_keeps_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_once(listener, |_| vec![0x85, 0x02]));

        let mut transport = TcpTransport::new(addr, Duration::from_secs(1)).await.unwrap();
        let request = ModbusRequest {
            slave_id: 1,
            function: ModbusFunction::WriteSingleCoil,
            address: 8888,
            quantity: 1,
            data: vec![0xFF, 0x00],
        };
        let err = transport.request(&request).await.unwrap_err();
        assert!(matches!(err, GatewayError::Exception { code: 0x02, .. }));
        assert!(transport.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unit_id_mismatch_is_frame_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            socket.read_exact(&mut request).await.unwrap();
            let mut frame = request[..4].to_vec();
            frame.extend_from_slice(&[0x00, 0x04, 0x07, 0x01, 0x01, 0x01]);
            socket.write_all(&frame).await.unwrap();
        });

        let mut transport = TcpTransport::new(addr, Duration::from_secs(1)).await.unwrap();
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadCoils, 0, 8);
        let err = transport.request(&request).await.unwrap_err();
        assert!(matches!(err, GatewayError::Frame { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_drops_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut transport = TcpTransport::new(addr, Duration::from_secs(1)).await.unwrap();
        server.await.unwrap();
        let request = ModbusRequest::new_read(1, ModbusFunction::ReadCoils, 0, 8);
        let err = transport.request(&request).await.unwrap_err();
        assert!(err.is_connection_fault());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpTransport::new(addr, Duration::from_millis(500)).await;
        assert!(matches!(
            result,
            Err(GatewayError::Connection { .. }) | Err(GatewayError::Timeout { .. })
        ));
    }
}
