//! Batched PLC operations with retry and reconnect
//!
//! [`ModbusGateway`] turns lists of point addresses into as few Modbus requests
//! as possible (see [`batcher`](crate::batcher)) and wraps every request in a
//! retry policy: on a connection-level fault the stale connection is closed,
//! the gateway pauses [`RECONNECT_PAUSE`], dials again and retries, up to
//! [`PLC_ATTEMPT_LIMIT`] attempts in total. Exception responses and malformed
//! requests are returned on the first attempt.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::batcher::{AnalogReadPlan, BitSpan};
use crate::bytes::{regs_to_u32, u32_to_regs};
use crate::client::ModbusClient;
use crate::constants::{
    GENSET_ARGUMENT_ADDRESS, GENSET_ARGUMENT_START, GENSET_ARGUMENT_STOP, GENSET_AUTO_START_COIL,
    GENSET_CODE_ADDRESS, GENSET_START_STOP_CODE, LOGO_UNIT_ID, MAX_READ_REGISTERS,
    PLC_ATTEMPT_LIMIT, RECONNECT_PAUSE,
};
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::SlaveId;

/// Generator start/stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GensetAction {
    Start,
    Stop,
}

impl GensetAction {
    /// `START` / `STOP`, case-insensitive.
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("START") {
            Some(Self::Start)
        } else if value.eq_ignore_ascii_case("STOP") {
            Some(Self::Stop)
        } else {
            None
        }
    }

    /// 32-bit argument written ahead of the start/stop code.
    pub fn argument(self) -> u32 {
        match self {
            Self::Start => GENSET_ARGUMENT_START,
            Self::Stop => GENSET_ARGUMENT_STOP,
        }
    }
}

/// How the generator is driven on the PLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GensetControl {
    /// Argument/code register sequence, verified by reading the argument back.
    Command,
    /// Automatic start/stop coil.
    Coil { address: u16 },
}

impl Default for GensetControl {
    fn default() -> Self {
        Self::Command
    }
}

impl GensetControl {
    pub fn coil() -> Self {
        Self::Coil {
            address: GENSET_AUTO_START_COIL,
        }
    }
}

/// PLC operations the polling engine depends on.
pub trait PlcIo: Send {
    /// Discrete inputs (FC02), one value per address in caller order.
    fn read_discrete_inputs(
        &mut self,
        addresses: &[u16],
    ) -> impl Future<Output = GatewayResult<Vec<bool>>> + Send;

    /// Coils (FC01), one value per address in caller order.
    fn read_coils(&mut self, addresses: &[u16])
        -> impl Future<Output = GatewayResult<Vec<bool>>> + Send;

    /// Input registers (FC04) as raw, unscaled floats.
    fn read_analog_inputs(
        &mut self,
        addresses: &[u16],
    ) -> impl Future<Output = GatewayResult<Vec<f32>>> + Send;

    fn write_coil(&mut self, address: u16, value: bool)
        -> impl Future<Output = GatewayResult<()>> + Send;

    /// Start or stop the generator.
    fn genset(&mut self, action: GensetAction) -> impl Future<Output = GatewayResult<()>> + Send;

    fn close(&mut self) -> impl Future<Output = GatewayResult<()>> + Send;
}

/// Run `$call` (an expression using `$client`) under the retry policy.
macro_rules! with_retry {
    ($gateway:ident, $operation:expr, |$client:ident| $call:expr) => {{
        let mut attempt = 1;
        loop {
            let result = {
                let $client = &mut $gateway.client;
                $call.await
            };
            match result {
                Ok(value) => break Ok(value),
                Err(e) if e.is_connection_fault() && attempt < PLC_ATTEMPT_LIMIT => {
                    warn!("{} failed (attempt {}): {}; reconnecting", $operation, attempt, e);
                    $gateway.reconnect().await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

/// Batched, retrying access to one PLC.
pub struct ModbusGateway<C: ModbusClient> {
    client: C,
    slave_id: SlaveId,
    genset: GensetControl,
    reconnect_pause: Duration,
    reconnects: u64,
}

impl<C: ModbusClient> ModbusGateway<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            slave_id: LOGO_UNIT_ID,
            genset: GensetControl::default(),
            reconnect_pause: RECONNECT_PAUSE,
            reconnects: 0,
        }
    }

    pub fn with_genset_control(mut self, genset: GensetControl) -> Self {
        self.genset = genset;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Reconnects performed by the retry policy so far.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Close, pause, dial again. A failed dial is only logged: the retried
    /// request then fails on its own.
    async fn reconnect(&mut self) {
        if self.client.is_connected() {
            if let Err(e) = self.client.close().await {
                debug!("closing stale PLC connection: {}", e);
            }
        }
        tokio::time::sleep(self.reconnect_pause).await;
        self.reconnects += 1;
        match self.client.reconnect().await {
            Ok(()) => info!("PLC connection re-established"),
            Err(e) => warn!("PLC reconnect failed: {}", e),
        }
    }

    pub async fn read_discrete_inputs(&mut self, addresses: &[u16]) -> GatewayResult<Vec<bool>> {
        let Some(span) = BitSpan::covering(addresses)? else {
            return Ok(Vec::new());
        };
        let slave = self.slave_id;
        let bits = with_retry!(self, "read discrete inputs", |client| client.read_02(
            slave,
            span.start,
            span.quantity
        ))?;
        Ok(span.extract(addresses, &bits))
    }

    pub async fn read_coils(&mut self, addresses: &[u16]) -> GatewayResult<Vec<bool>> {
        let Some(span) = BitSpan::covering(addresses)? else {
            return Ok(Vec::new());
        };
        let slave = self.slave_id;
        let bits = with_retry!(self, "read coils", |client| client.read_01(
            slave,
            span.start,
            span.quantity
        ))?;
        Ok(span.extract(addresses, &bits))
    }

    pub async fn read_analog_inputs(&mut self, addresses: &[u16]) -> GatewayResult<Vec<f32>> {
        let plan = AnalogReadPlan::new(addresses, MAX_READ_REGISTERS as u16);
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        let slave = self.slave_id;
        let mut registers = Vec::with_capacity(plan.register_count());
        for run in plan.runs() {
            let values = with_retry!(self, "read input registers", |client| client.read_04(
                slave,
                run.start,
                run.quantity
            ))?;
            if values.len() != usize::from(run.quantity) {
                return Err(GatewayError::invalid_data(format!(
                    "read {} registers at {}, got {}",
                    run.quantity,
                    run.start,
                    values.len()
                )));
            }
            registers.extend(values);
        }
        plan.resolve(addresses, &registers)
    }

    pub async fn write_coil(&mut self, address: u16, value: bool) -> GatewayResult<()> {
        let slave = self.slave_id;
        with_retry!(self, "write coil", |client| client.write_05(slave, address, value))
    }

    /// Write the 32-bit argument, then the command code, then read the
    /// argument registers back. Returns the read-back value.
    pub async fn execute_command(
        &mut self,
        cmd_address: u16,
        cmd_value: u16,
        arg_address: u16,
        arg_value: u32,
    ) -> GatewayResult<u32> {
        let slave = self.slave_id;
        let regs = u32_to_regs(arg_value);

        with_retry!(self, "write command argument", |client| client.write_10(
            slave,
            arg_address,
            &regs
        ))?;
        with_retry!(self, "write command code", |client| client.write_06(
            slave,
            cmd_address,
            cmd_value
        ))?;
        let echo = with_retry!(self, "read command result", |client| client.read_03(
            slave,
            arg_address,
            2
        ))?;

        let [high, low] = echo[..] else {
            return Err(GatewayError::frame(format!(
                "expected 2 result registers, got {}",
                echo.len()
            )));
        };
        Ok(regs_to_u32(&[high, low]))
    }

    pub async fn genset(&mut self, action: GensetAction) -> GatewayResult<()> {
        match self.genset {
            GensetControl::Command => {
                let expected = action.argument();
                let actual = self
                    .execute_command(
                        GENSET_CODE_ADDRESS,
                        GENSET_START_STOP_CODE,
                        GENSET_ARGUMENT_ADDRESS,
                        expected,
                    )
                    .await?;
                if actual != expected {
                    return Err(GatewayError::EchoMismatch { expected, actual });
                }
                Ok(())
            }
            GensetControl::Coil { address } => {
                self.write_coil(address, action == GensetAction::Start).await
            }
        }
    }

    pub async fn close(&mut self) -> GatewayResult<()> {
        info!(
            "closing PLC connection after {} reconnects, stats: {:?}",
            self.reconnects,
            self.client.get_stats()
        );
        self.client.close().await
    }
}

impl<C: ModbusClient> PlcIo for ModbusGateway<C> {
    async fn read_discrete_inputs(&mut self, addresses: &[u16]) -> GatewayResult<Vec<bool>> {
        ModbusGateway::read_discrete_inputs(self, addresses).await
    }

    async fn read_coils(&mut self, addresses: &[u16]) -> GatewayResult<Vec<bool>> {
        ModbusGateway::read_coils(self, addresses).await
    }

    async fn read_analog_inputs(&mut self, addresses: &[u16]) -> GatewayResult<Vec<f32>> {
        ModbusGateway::read_analog_inputs(self, addresses).await
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> GatewayResult<()> {
        ModbusGateway::write_coil(self, address, value).await
    }

    async fn genset(&mut self, action: GensetAction) -> GatewayResult<()> {
        ModbusGateway::genset(self, action).await
    }

    async fn close(&mut self) -> GatewayResult<()> {
        ModbusGateway::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportStats;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Read01(u16, u16),
        Read02(u16, u16),
        Read03(u16, u16),
        Read04(u16, u16),
        Write05(u16, bool),
        Write06(u16, u16),
        Write10(u16, Vec<u16>),
        Close,
        Reconnect,
    }

    enum Reply {
        Bits(Vec<bool>),
        Registers(Vec<u16>),
        Done,
        Fail(GatewayError),
    }

    /// Client double that logs calls and replays scripted replies.
    #[derive(Default)]
    struct ScriptedClient {
        calls: Vec<Call>,
        replies: VecDeque<Reply>,
    }

    impl ScriptedClient {
        fn reply(mut self, reply: Reply) -> Self {
            self.replies.push_back(reply);
            self
        }

        fn next(&mut self) -> GatewayResult<Reply> {
            match self.replies.pop_front() {
                Some(Reply::Fail(e)) => Err(e),
                Some(reply) => Ok(reply),
                None => Err(GatewayError::connection("script exhausted")),
            }
        }

        fn bits(&mut self) -> GatewayResult<Vec<bool>> {
            match self.next()? {
                Reply::Bits(bits) => Ok(bits),
                _ => Err(GatewayError::protocol("expected bits")),
            }
        }

        fn registers(&mut self) -> GatewayResult<Vec<u16>> {
            match self.next()? {
                Reply::Registers(regs) => Ok(regs),
                _ => Err(GatewayError::protocol("expected registers")),
            }
        }

        fn done(&mut self) -> GatewayResult<()> {
            self.next().map(|_| ())
        }
    }

    impl ModbusClient for ScriptedClient {
        async fn read_01(&mut self, _: SlaveId, address: u16, quantity: u16) -> GatewayResult<Vec<bool>> {
            self.calls.push(Call::Read01(address, quantity));
            self.bits()
        }

        async fn read_02(&mut self, _: SlaveId, address: u16, quantity: u16) -> GatewayResult<Vec<bool>> {
            self.calls.push(Call::Read02(address, quantity));
            self.bits()
        }

        async fn read_03(&mut self, _: SlaveId, address: u16, quantity: u16) -> GatewayResult<Vec<u16>> {
            self.calls.push(Call::Read03(address, quantity));
            self.registers()
        }

        async fn read_04(&mut self, _: SlaveId, address: u16, quantity: u16) -> GatewayResult<Vec<u16>> {
            self.calls.push(Call::Read04(address, quantity));
            self.registers()
        }

        async fn write_05(&mut self, _: SlaveId, address: u16, value: bool) -> GatewayResult<()> {
            self.calls.push(Call::Write05(address, value));
            self.done()
        }

        async fn write_06(&mut self, _: SlaveId, address: u16, value: u16) -> GatewayResult<()> {
            self.calls.push(Call::Write06(address, value));
            self.done()
        }

        async fn write_10(&mut self, _: SlaveId, address: u16, values: &[u16]) -> GatewayResult<()> {
            self.calls.push(Call::Write10(address, values.to_vec()));
            self.done()
        }

        async fn reconnect(&mut self) -> GatewayResult<()> {
            self.calls.push(Call::Reconnect);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&mut self) -> GatewayResult<()> {
            self.calls.push(Call::Close);
            Ok(())
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn gateway(client: ScriptedClient) -> ModbusGateway<ScriptedClient> {
        ModbusGateway::new(client)
    }

    fn calls(gw: &ModbusGateway<ScriptedClient>) -> &[Call] {
        &gw.client().calls
    }

    #[tokio::test]
    async fn test_empty_read_skips_wire() {
        let mut gw = gateway(ScriptedClient::default());
        assert!(gw.read_discrete_inputs(&[]).await.unwrap().is_empty());
        assert!(gw.read_coils(&[]).await.unwrap().is_empty());
        assert!(gw.read_analog_inputs(&[]).await.unwrap().is_empty());
        assert!(calls(&gw).is_empty());
    }

    #[tokio::test]
    async fn test_discrete_inputs_one_span_any_order() {
        let client = ScriptedClient::default()
            .reply(Reply::Bits(vec![true, false, false, false, true, false, true, false]));
        let mut gw = gateway(client);

        let values = gw.read_discrete_inputs(&[6, 0, 4, 1]).await.unwrap();
        assert_eq!(values, vec![true, true, true, false]);
        assert_eq!(calls(&gw), &[Call::Read02(0, 7)]);
    }

    #[tokio::test]
    async fn test_coils_use_fc01() {
        let client = ScriptedClient::default().reply(Reply::Bits(vec![false, true]));
        let mut gw = gateway(client);

        let values = gw.read_coils(&[8193, 8192]).await.unwrap();
        assert_eq!(values, vec![true, false]);
        assert_eq!(calls(&gw), &[Call::Read01(8192, 2)]);
    }

    #[tokio::test]
    async fn test_analog_contiguous_run() {
        let client = ScriptedClient::default().reply(Reply::Registers(vec![10, 20, 30]));
        let mut gw = gateway(client);

        let values = gw.read_analog_inputs(&[1032, 1033, 1034]).await.unwrap();
        assert_eq!(values, vec![10.0, 20.0, 30.0]);
        assert_eq!(calls(&gw), &[Call::Read04(1032, 3)]);
    }

    #[tokio::test]
    async fn test_analog_disjoint_runs_keep_caller_order() {
        let client = ScriptedClient::default()
            .reply(Reply::Registers(vec![1, 2]))
            .reply(Reply::Registers(vec![9]));
        let mut gw = gateway(client);

        let values = gw.read_analog_inputs(&[1040, 1032, 1033]).await.unwrap();
        assert_eq!(values, vec![9.0, 1.0, 2.0]);
        assert_eq!(calls(&gw), &[Call::Read04(1032, 2), Call::Read04(1040, 1)]);
    }

    #[tokio::test]
    async fn test_analog_short_run_is_error() {
        let client = ScriptedClient::default().reply(Reply::Registers(vec![1]));
        let mut gw = gateway(client);
        let result = gw.read_analog_inputs(&[0, 1]).await;
        assert!(matches!(result, Err(GatewayError::InvalidData { .. })));
        assert_eq!(gw.reconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ceiling_reconnects_once() {
        let client = ScriptedClient::default()
            .reply(Reply::Fail(GatewayError::timeout("read", 2500)))
            .reply(Reply::Fail(GatewayError::connection("reset")));
        let mut gw = gateway(client);

        let result = gw.read_coils(&[8192]).await;
        assert!(matches!(result, Err(GatewayError::Connection { .. })));
        assert_eq!(
            calls(&gw),
            &[Call::Read01(8192, 1), Call::Close, Call::Reconnect, Call::Read01(8192, 1)]
        );
        assert_eq!(gw.reconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_on_second_attempt() {
        let client = ScriptedClient::default()
            .reply(Reply::Fail(GatewayError::connection("broken pipe")))
            .reply(Reply::Done);
        let mut gw = gateway(client);

        gw.write_coil(8192, true).await.unwrap();
        assert_eq!(gw.reconnects(), 1);
    }

    #[tokio::test]
    async fn test_exception_not_retried() {
        let client = ScriptedClient::default().reply(Reply::Fail(GatewayError::exception(0x05, 0x02)));
        let mut gw = gateway(client);

        let result = gw.write_coil(9999, true).await;
        assert!(matches!(result, Err(GatewayError::Exception { code: 0x02, .. })));
        assert_eq!(calls(&gw), &[Call::Write05(9999, true)]);
        assert_eq!(gw.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_execute_command_sequence() {
        let client = ScriptedClient::default()
            .reply(Reply::Done)
            .reply(Reply::Done)
            .reply(Reply::Registers(vec![0x01FE, 0x0000]));
        let mut gw = gateway(client);

        let echo = gw.execute_command(4209, 0x01, 4207, 0x01FE_0000).await.unwrap();
        assert_eq!(echo, 0x01FE_0000);
        assert_eq!(
            calls(&gw),
            &[
                Call::Write10(4207, vec![0x01FE, 0x0000]),
                Call::Write06(4209, 0x01),
                Call::Read03(4207, 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_genset_echo_mismatch() {
        let client = ScriptedClient::default()
            .reply(Reply::Done)
            .reply(Reply::Done)
            .reply(Reply::Registers(vec![0, 0]));
        let mut gw = gateway(client);

        let result = gw.genset(GensetAction::Stop).await;
        assert!(matches!(
            result,
            Err(GatewayError::EchoMismatch { expected: 0x02FD_0000, actual: 0 })
        ));
    }

    #[tokio::test]
    async fn test_genset_coil_mode() {
        let client = ScriptedClient::default().reply(Reply::Done);
        let mut gw = gateway(client).with_genset_control(GensetControl::coil());

        gw.genset(GensetAction::Start).await.unwrap();
        assert_eq!(calls(&gw), &[Call::Write05(4700, true)]);
    }

    #[test]
    fn test_genset_action_parse() {
        assert_eq!(GensetAction::parse("start"), Some(GensetAction::Start));
        assert_eq!(GensetAction::parse("STOP"), Some(GensetAction::Stop));
        assert_eq!(GensetAction::parse("halt"), None);
    }
}
