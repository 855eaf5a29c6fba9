//! # LOGO! Wialon Gateway
//!
//! Bridges a Modbus/TCP PLC (Siemens LOGO!-class, unit id 1) to a telemetry
//! server speaking the Wialon IPS line protocol.
//!
//! ## Layers
//!
//! | Layer | Module | Role |
//! |-------|--------|------|
//! | Wire | [`protocol`], [`transport`] | PDUs, MBAP framing over TCP |
//! | Client | [`client`] | one method per function code |
//! | Gateway | [`gateway`], [`batcher`] | batched reads, retry and reconnect, command sequences |
//! | Telemetry | [`telemetry`] | login, ping, data upload, command read |
//! | Engine | [`engine`] | sampling tick, dead-band, command dispatch, failure budgets |
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Used for |
//! |------|----------|----------|
//! | 0x01 | Read Coils | `Q` points |
//! | 0x02 | Read Discrete Inputs | `I` points |
//! | 0x03 | Read Holding Registers | command read-back |
//! | 0x04 | Read Input Registers | analog points |
//! | 0x05 | Write Single Coil | `W` commands, generator coil |
//! | 0x06 | Write Single Register | command code |
//! | 0x10 | Write Multiple Registers | command argument |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use logo_wialon_gateway::{
//!     AddressMap, EngineSettings, ExitProcess, GatewayResult, ModbusGateway, ModbusTcpClient,
//!     PointMaps, PollingEngine, TelemetryIo, TelemetryLink,
//! };
//!
//! #[tokio::main]
//! async fn main() -> GatewayResult<()> {
//!     let client = ModbusTcpClient::connect("192.168.0.3:502".parse().unwrap(), Duration::from_millis(2500)).await?;
//!     let link = Arc::new(TelemetryLink::new("wialon.example.net:20332", "861230045678901"));
//!     link.open().await?;
//!
//!     let maps = PointMaps {
//!         read: AddressMap::parse("I,I1,0\nQ,Q1,8192")?,
//!         write: AddressMap::parse("Q,Q1,8192")?,
//!         analog: AddressMap::parse("AI,TEMP,1032")?,
//!     };
//!     let engine = PollingEngine::new(
//!         ModbusGateway::new(client),
//!         link,
//!         maps,
//!         EngineSettings::default(),
//!         Arc::new(ExitProcess),
//!     );
//!     engine.run(async { let _ = tokio::signal::ctrl_c().await; }).await;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error types and result handling
pub mod error;

/// Protocol constants and gateway defaults
pub mod constants;

/// Modbus PDU definitions
pub mod protocol;

/// MBAP transport over TCP
pub mod transport;

/// Function-code level Modbus client
pub mod client;

/// Subscriber setup and packet formatting
pub mod logging;

/// Bit and register conversions
pub mod bytes;

// ============================================================================
// Gateway modules
// ============================================================================

/// `class,name,address` point tables
pub mod address_map;

/// Read planning for bit spans and register runs
pub mod batcher;

/// Batched PLC operations with retry
pub mod gateway;

/// Wialon IPS link
pub mod telemetry;

/// Sampling loop and command dispatch
pub mod engine;

/// Command line and environment settings
pub mod config;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use tokio;

// === Modbus ===
pub use client::{GenericModbusClient, ModbusClient, ModbusTcpClient};
pub use protocol::{ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
pub use transport::{ModbusTransport, TcpTransport, TransportStats};

// === Error handling ===
pub use error::{GatewayError, GatewayResult};

// === Gateway ===
pub use address_map::{AddressMap, Point, PointKind};
pub use gateway::{GensetAction, GensetControl, ModbusGateway, PlcIo};

// === Telemetry ===
pub use telemetry::{Command, DryRunLink, LinkState, TelemetryIo, TelemetryLink};

// === Engine ===
pub use engine::{
    BudgetSide, CycleOutcome, EngineSettings, ExhaustionPolicy, ExitProcess, FailureBudget,
    PointMaps, PollingEngine, ReadingSnapshot,
};

// === Configuration ===
pub use config::{Cli, GatewayConfig, GensetMode};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
