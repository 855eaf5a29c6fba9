//! Wialon IPS telemetry link
//!
//! Frames are single CRLF-terminated lines:
//!
//! | Frame | Layout | Ack |
//! |-------|--------|-----|
//! | Login / ping | `#L#2.0;<device>;NA;<crc>` | `#AL#1` |
//! | Data | `#D#<ddmmyy>;<hhmmss>;NA;…;NA;;NA;<params>;<crc>` | `#AD#1` |
//! | Command (inbound) | `#M##<kind>#<value>#` | none |
//!
//! `<crc>` is CRC-16/ARC over everything between the `#X#` header and the
//! checksum itself, as four upper-case hex digits.
//!
//! [`TelemetryLink`] owns one TCP session behind an async mutex, so a command
//! read in the background listener never interleaves with an upload or ping.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crc::{Crc, CRC_16_ARC};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::constants::{
    WIALON_COMMAND_TIMEOUT, WIALON_DATA_ACK, WIALON_FRAME_END, WIALON_LOGIN_ACK,
    WIALON_MAX_LINE, WIALON_MESSAGE_HEADER, WIALON_PROTOCOL_VERSION, WIALON_RESPONSE_TIMEOUT,
};
use crate::error::{GatewayError, GatewayResult};

const CRC_ARC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Position-sensor fields the gateway never fills.
const UNUSED_DATA_FIELDS: usize = 11;

/// Frame checksum: CRC-16/ARC as four upper-case hex digits.
pub fn checksum(body: &str) -> String {
    format!("{:04X}", CRC_ARC.checksum(body.as_bytes()))
}

/// `#L#` frame, also used as the keep-alive ping.
pub fn login_frame(device_id: &str) -> String {
    let body = format!("{};{};NA;", WIALON_PROTOCOL_VERSION, device_id);
    format!("#L#{}{}{}", body, checksum(&body), WIALON_FRAME_END)
}

/// `#D#` frame stamped with `at` in UTC.
pub fn data_frame(payload: &str, at: DateTime<Utc>) -> String {
    let body = format!(
        "{};{};{};NA;{};",
        at.format("%d%m%y"),
        at.format("%H%M%S"),
        "NA;".repeat(UNUSED_DATA_FIELDS),
        payload
    );
    format!("#D#{}{}{}", body, checksum(&body), WIALON_FRAME_END)
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Nothing arrived within the command deadline.
    Timeout,
    /// Operator message: `kind` is e.g. `W` or `GS`.
    Message { kind: String, value: String },
}

/// Parse one `#M##<kind>#<value>#` line. Line endings are ignored.
pub fn parse_command_frame(line: &str) -> GatewayResult<Command> {
    let line = line.trim_end_matches(['\r', '\n']);
    let rest = match line.strip_prefix(WIALON_MESSAGE_HEADER) {
        Some(rest) if !rest.contains(WIALON_MESSAGE_HEADER) => rest,
        _ => {
            return Err(GatewayError::protocol(format!(
                "should contain {} once: {:?}",
                WIALON_MESSAGE_HEADER, line
            )))
        }
    };

    let parts: Vec<&str> = rest.split('#').collect();
    match parts[..] {
        ["", kind, value, _] => Ok(Command::Message {
            kind: kind.to_string(),
            value: value.to_string(),
        }),
        _ => Err(GatewayError::protocol(format!("incomplete message: {:?}", rest))),
    }
}

/// Observable state of a telemetry session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    LoggedIn,
    Idle,
    Sending,
    Receiving,
}

/// Telemetry operations used by the polling engine and the command listener.
pub trait TelemetryIo: Send + Sync + 'static {
    /// (Re)connect and log in.
    fn open(&self) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Keep-alive: resend the login frame on the open session.
    fn send_ping(&self) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Upload one parameter string.
    fn send_data(&self, payload: &str) -> impl Future<Output = GatewayResult<()>> + Send;

    /// Wait briefly for one inbound command.
    fn read_command(&self) -> impl Future<Output = GatewayResult<Command>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

struct Session {
    reader: BufReader<TcpStream>,
    /// Bytes of a line not yet terminated when a read timed out.
    pending: Vec<u8>,
    /// Command lines that arrived while waiting for an ack.
    deferred: VecDeque<String>,
}

impl Session {
    async fn write_frame(&mut self, frame: &str) -> GatewayResult<()> {
        debug!("telemetry send: {}", frame.trim_end());
        let stream = self.reader.get_mut();
        stream.write_all(frame.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Next complete line before `deadline`, or `None` on deadline.
    ///
    /// A line longer than [`WIALON_MAX_LINE`] is discarded with a protocol error.
    async fn read_line(&mut self, deadline: Instant) -> GatewayResult<Option<String>> {
        let room = WIALON_MAX_LINE.saturating_sub(self.pending.len()) as u64;
        let mut limited = (&mut self.reader).take(room);
        match timeout_at(deadline, limited.read_until(b'\n', &mut self.pending)).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(_)) if self.pending.last() == Some(&b'\n') => {
                let line = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                debug!("telemetry recv: {}", line.trim_end());
                Ok(Some(line))
            }
            Ok(Ok(_)) if self.pending.len() >= WIALON_MAX_LINE => {
                self.pending.clear();
                Err(GatewayError::protocol(format!(
                    "telemetry line longer than {} bytes",
                    WIALON_MAX_LINE
                )))
            }
            Ok(Ok(_)) => Err(GatewayError::connection("telemetry server closed the connection")),
        }
    }

    /// Ack line for a frame just written. Command lines seen meanwhile are
    /// kept for the next command read.
    async fn read_response(&mut self, timeout: Duration, operation: &str) -> GatewayResult<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(line) = self.read_line(deadline).await? else {
                return Err(GatewayError::timeout(operation, timeout.as_millis() as u64));
            };
            if line.starts_with(WIALON_MESSAGE_HEADER) {
                self.deferred.push_back(line);
                continue;
            }
            return Ok(line);
        }
    }
}

/// Live Wialon IPS session.
pub struct TelemetryLink {
    address: String,
    device_id: String,
    response_timeout: Duration,
    command_timeout: Duration,
    session: Mutex<Option<Session>>,
    state: StdMutex<LinkState>,
}

impl TelemetryLink {
    /// `address` is `host:port`; nothing is dialled until [`open`](TelemetryIo::open).
    pub fn new(address: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            device_id: device_id.into(),
            response_timeout: WIALON_RESPONSE_TIMEOUT,
            command_timeout: WIALON_COMMAND_TIMEOUT,
            session: Mutex::new(None),
            state: StdMutex::new(LinkState::Disconnected),
        }
    }

    pub fn with_timeouts(mut self, response: Duration, command: Duration) -> Self {
        self.response_timeout = response;
        self.command_timeout = command;
        self
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: LinkState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Record the outcome of an exchange; connection faults drop the session.
    fn settle<T>(&self, slot: &mut Option<Session>, result: GatewayResult<T>) -> GatewayResult<T> {
        match &result {
            Ok(_) => self.set_state(LinkState::Idle),
            Err(e) if e.is_connection_fault() => {
                *slot = None;
                self.set_state(LinkState::Disconnected);
            }
            Err(_) => self.set_state(LinkState::Idle),
        }
        result
    }

    async fn login(&self) -> GatewayResult<Session> {
        let stream = tokio::time::timeout(self.response_timeout, TcpStream::connect(self.address.as_str()))
            .await
            .map_err(|_| {
                GatewayError::timeout(
                    format!("connect to {}", self.address),
                    self.response_timeout.as_millis() as u64,
                )
            })?
            .map_err(|e| GatewayError::connection(format!("opening socket to {}: {}", self.address, e)))?;

        let mut session = Session {
            reader: BufReader::new(stream),
            pending: Vec::new(),
            deferred: VecDeque::new(),
        };
        session.write_frame(&login_frame(&self.device_id)).await?;
        let response = session.read_response(self.response_timeout, "login").await?;
        if !response.contains(WIALON_LOGIN_ACK) {
            return Err(GatewayError::LoginRejected {
                response: response.trim_end().to_string(),
            });
        }
        Ok(session)
    }
}

impl TelemetryIo for TelemetryLink {
    async fn open(&self) -> GatewayResult<()> {
        let mut slot = self.session.lock().await;
        if let Some(mut old) = slot.take() {
            let _ = old.reader.get_mut().shutdown().await;
        }
        self.set_state(LinkState::Disconnected);

        let session = self.login().await?;
        *slot = Some(session);
        self.set_state(LinkState::LoggedIn);
        info!("logged in to telemetry server {}", self.address);
        Ok(())
    }

    async fn send_ping(&self) -> GatewayResult<()> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Err(GatewayError::connection("ping: telemetry session not open"));
        };
        self.set_state(LinkState::Sending);
        let result = async {
            session.write_frame(&login_frame(&self.device_id)).await?;
            session.read_response(self.response_timeout, "ping").await
        }
        .await;
        self.settle(&mut slot, result).map(|_| ())
    }

    /// Logs in again first when the session was dropped, so a sample taken
    /// after a disconnect still reaches the server.
    async fn send_data(&self, payload: &str) -> GatewayResult<()> {
        let mut slot = self.session.lock().await;
        if slot.is_none() {
            debug!("telemetry session closed, logging in before upload");
            *slot = Some(self.login().await?);
            self.set_state(LinkState::LoggedIn);
        }
        let Some(session) = slot.as_mut() else {
            return Err(GatewayError::connection(format!(
                "send data: telemetry session not open, payload: {}",
                payload
            )));
        };
        self.set_state(LinkState::Sending);
        let result = async {
            session.write_frame(&data_frame(payload, Utc::now())).await?;
            let response = session.read_response(self.response_timeout, "data upload").await?;
            if response.contains(WIALON_DATA_ACK) {
                Ok(response)
            } else {
                Err(GatewayError::DataRejected {
                    payload: payload.to_string(),
                    response: response.trim_end().to_string(),
                })
            }
        }
        .await;

        let response = self.settle(&mut slot, result)?;
        info!("sent {}, got {}", payload, response.trim_end());
        Ok(())
    }

    async fn read_command(&self) -> GatewayResult<Command> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Err(GatewayError::connection("read command: telemetry session not open"));
        };

        if let Some(line) = session.deferred.pop_front() {
            return parse_command_frame(&line);
        }

        self.set_state(LinkState::Receiving);
        let deadline = Instant::now() + self.command_timeout;
        let result = session.read_line(deadline).await;
        match self.settle(&mut slot, result)? {
            None => Ok(Command::Timeout),
            Some(line) => parse_command_frame(&line),
        }
    }

    async fn close(&self) {
        let mut slot = self.session.lock().await;
        if let Some(mut session) = slot.take() {
            if let Err(e) = session.reader.get_mut().shutdown().await {
                debug!("closing telemetry socket: {}", e);
            }
        }
        self.set_state(LinkState::Disconnected);
    }
}

/// Stand-in link that logs frames instead of sending them.
pub struct DryRunLink {
    device_id: String,
    idle: Duration,
}

impl DryRunLink {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            idle: WIALON_COMMAND_TIMEOUT,
        }
    }
}

impl TelemetryIo for DryRunLink {
    async fn open(&self) -> GatewayResult<()> {
        info!("dry run, login: {}", login_frame(&self.device_id).trim_end());
        Ok(())
    }

    async fn send_ping(&self) -> GatewayResult<()> {
        debug!("dry run, ping");
        Ok(())
    }

    async fn send_data(&self, payload: &str) -> GatewayResult<()> {
        info!("dry run, sending {}", data_frame(payload, Utc::now()).trim_end());
        Ok(())
    }

    async fn read_command(&self) -> GatewayResult<Command> {
        tokio::time::sleep(self.idle).await;
        Ok(Command::Timeout)
    }

    async fn close(&self) {
        debug!("dry run, closing link");
    }
}
