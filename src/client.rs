//! Function-code level Modbus client
//!
//! [`GenericModbusClient`] builds requests for the function codes the gateway
//! needs and parses their responses, delegating framing to any
//! [`ModbusTransport`]. The higher-level batching and retry policy lives in
//! [`gateway`](crate::gateway).
//!
//! | Function Code | Method |
//! |---------------|--------|
//! | 0x01 | `read_01()` read coils |
//! | 0x02 | `read_02()` read discrete inputs |
//! | 0x03 | `read_03()` read holding registers |
//! | 0x04 | `read_04()` read input registers |
//! | 0x05 | `write_05()` write single coil |
//! | 0x06 | `write_06()` write single register |
//! | 0x10 | `write_10()` write multiple registers |

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use crate::constants::{COIL_OFF, COIL_ON};
use crate::error::GatewayResult;
use crate::logging::format_hex_packet;
use crate::protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
use crate::transport::{ModbusTransport, TcpTransport, TransportStats};

/// Async Modbus client operations.
///
/// Implemented by [`GenericModbusClient`]; tests substitute their own
/// implementations to script failures.
pub trait ModbusClient: Send + Sync {
    /// Read coils (function code 0x01). Returns exactly `quantity` values.
    fn read_01(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = GatewayResult<Vec<bool>>> + Send;

    /// Read discrete inputs (function code 0x02). Returns exactly `quantity` values.
    fn read_02(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = GatewayResult<Vec<bool>>> + Send;

    /// Read holding registers (function code 0x03).
    fn read_03(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = GatewayResult<Vec<u16>>> + Send;

    /// Read input registers (function code 0x04).
    fn read_04(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = GatewayResult<Vec<u16>>> + Send;

    /// Write single coil (function code 0x05): `true` → 0xFF00, `false` → 0x0000.
    fn write_05(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Write single register (function code 0x06).
    fn write_06(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Write multiple registers (function code 0x10).
    fn write_10(
        &mut self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Drop the current connection and dial again.
    fn reconnect(&mut self) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Check if the client is connected
    fn is_connected(&self) -> bool;

    /// Close the client connection
    fn close(&mut self) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Get transport statistics
    fn get_stats(&self) -> TransportStats;
}

/// Client that works with any transport
pub struct GenericModbusClient<T: ModbusTransport> {
    transport: T,
}

/// The client used against a real PLC.
pub type ModbusTcpClient = GenericModbusClient<TcpTransport>;

impl<T: ModbusTransport> GenericModbusClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Execute a raw request
    pub async fn execute_request(&mut self, request: ModbusRequest) -> GatewayResult<ModbusResponse> {
        debug!(
            "request slave={} fc={:#04x} addr={} qty={} data=[{}]",
            request.slave_id,
            request.function.to_u8(),
            request.address,
            request.quantity,
            format_hex_packet(&request.data)
        );

        let response = self.transport.request(&request).await?;

        debug!(
            "response slave={} fc={:#04x} data=[{}]",
            response.slave_id,
            response.function.to_u8(),
            format_hex_packet(response.data())
        );
        Ok(response)
    }

    async fn read_bits(
        &mut self,
        slave_id: SlaveId,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> GatewayResult<Vec<bool>> {
        let request = ModbusRequest::new_read(slave_id, function, address, quantity);
        let response = self.execute_request(request).await?;
        let bits = response.parse_bits()?;
        Ok(bits.into_iter().take(quantity as usize).collect())
    }

    async fn read_registers(
        &mut self,
        slave_id: SlaveId,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> GatewayResult<Vec<u16>> {
        let request = ModbusRequest::new_read(slave_id, function, address, quantity);
        let response = self.execute_request(request).await?;
        response.parse_registers()
    }
}

impl ModbusTcpClient {
    /// Connect to a Modbus TCP server.
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> GatewayResult<Self> {
        let transport = TcpTransport::new(addr, timeout).await?;
        Ok(Self::new(transport))
    }

    pub fn server_address(&self) -> SocketAddr {
        self.transport.address()
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.transport.set_packet_logging(enabled);
    }
}

impl<T: ModbusTransport + Send + Sync> ModbusClient for GenericModbusClient<T> {
    async fn read_01(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> GatewayResult<Vec<bool>> {
        self.read_bits(slave_id, ModbusFunction::ReadCoils, address, quantity)
            .await
    }

    async fn read_02(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> GatewayResult<Vec<bool>> {
        self.read_bits(slave_id, ModbusFunction::ReadDiscreteInputs, address, quantity)
            .await
    }

    async fn read_03(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> GatewayResult<Vec<u16>> {
        self.read_registers(slave_id, ModbusFunction::ReadHoldingRegisters, address, quantity)
            .await
    }

    async fn read_04(&mut self, slave_id: SlaveId, address: u16, quantity: u16) -> GatewayResult<Vec<u16>> {
        self.read_registers(slave_id, ModbusFunction::ReadInputRegisters, address, quantity)
            .await
    }

    async fn write_05(&mut self, slave_id: SlaveId, address: u16, value: bool) -> GatewayResult<()> {
        let raw = if value { COIL_ON } else { COIL_OFF };
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteSingleCoil,
            address,
            quantity: 1,
            data: raw.to_be_bytes().to_vec(),
        };
        self.execute_request(request).await?;
        Ok(())
    }

    async fn write_06(&mut self, slave_id: SlaveId, address: u16, value: u16) -> GatewayResult<()> {
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteSingleRegister,
            address,
            quantity: 1,
            data: value.to_be_bytes().to_vec(),
        };
        self.execute_request(request).await?;
        Ok(())
    }

    async fn write_10(&mut self, slave_id: SlaveId, address: u16, values: &[u16]) -> GatewayResult<()> {
        let data = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        let request = ModbusRequest {
            slave_id,
            function: ModbusFunction::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            data,
        };
        self.execute_request(request).await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> GatewayResult<()> {
        self.transport.reconnect().await
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    async fn close(&mut self) -> GatewayResult<()> {
        self.transport.close().await
    }

    fn get_stats(&self) -> TransportStats {
        self.transport.get_stats()
    }
}
