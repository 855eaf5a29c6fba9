//! Error types for the gateway
//!
//! Every fallible operation returns [`GatewayResult`]. Errors fall into three groups:
//!
//! | Group | Variants | Handling |
//! |-------|----------|----------|
//! | Connection faults | `Connection`, `Timeout`, `Io`, `Frame` | retried with reconnect, then counted against a failure budget |
//! | Protocol faults | `Protocol`, `Exception`, `EchoMismatch`, `LoginRejected`, `DataRejected`, `InvalidData` | surfaced immediately |
//! | Configuration faults | `Config` | fatal at startup |
//!
//! Idle periods on the command channel are not errors; see
//! [`Command::Timeout`](crate::telemetry::Command::Timeout).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors produced by the PLC side, the telemetry side and configuration parsing.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Dial failed, connection reset or session not open.
    #[error("connection error: {message}")]
    Connection { message: String },

    /// An operation did not complete within its deadline.
    #[error("timeout during {operation} after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Raw socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame on either wire.
    #[error("frame error: {message}")]
    Frame { message: String },

    /// Well-formed frame carrying something unexpected.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The PLC answered with a Modbus exception.
    #[error("modbus exception {code:#04x} on function {function:#04x}: {message}")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Multi-step command read back an unexpected value.
    #[error("command echo mismatch: expected {expected:#010x}, got {actual:#010x}")]
    EchoMismatch { expected: u32, actual: u32 },

    /// Server refused the login frame.
    #[error("login unsuccessful, got: {response:?}")]
    LoginRejected { response: String },

    /// Server did not acknowledge a data frame.
    #[error("data frame not accepted, got: {response:?}, sent: {payload}")]
    DataRejected { payload: String, response: String },

    /// Request arguments outside what the protocol can carry.
    #[error("invalid data: {message}")]
    InvalidData { message: String },

    /// Malformed configuration.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl GatewayError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Build an exception error from the raw exception code.
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function,
            code,
            message: exception_description(code).to_string(),
        }
    }

    /// Whether the fault is transport-level and worth a reconnect.
    ///
    /// A short or garbled MBAP frame usually means the stream is out of sync,
    /// so frame errors count as connection faults too.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Io(_) | Self::Frame { .. }
        )
    }
}

fn exception_description(code: u8) -> &'static str {
    use crate::constants::*;

    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "illegal function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "illegal data address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "illegal data value",
        EXCEPTION_SERVER_DEVICE_FAILURE => "server device failure",
        EXCEPTION_SERVER_DEVICE_BUSY => "server device busy",
        EXCEPTION_GATEWAY_PATH_UNAVAILABLE => "gateway path unavailable",
        EXCEPTION_GATEWAY_TARGET_FAILED => "gateway target failed to respond",
        _ => "unknown exception",
    }
}
