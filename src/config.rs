//! Process configuration
//!
//! Every setting can come from the command line or the environment (a `.env`
//! file is loaded by the binary first). [`Cli`] is the raw clap surface;
//! [`GatewayConfig`] is the validated result the rest of the crate consumes.

use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};

use crate::address_map::AddressMap;
use crate::constants::DEFAULT_PLC_TIMEOUT;
use crate::engine::{EngineSettings, PointMaps};
use crate::error::{GatewayError, GatewayResult};
use crate::gateway::GensetControl;

/// Generator control flavour selected by `GENSET_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GensetMode {
    /// Argument/code register sequence.
    Command,
    /// Automatic start/stop coil.
    Coil,
}

impl From<GensetMode> for GensetControl {
    fn from(mode: GensetMode) -> Self {
        match mode {
            GensetMode::Command => GensetControl::Command,
            GensetMode::Coil => GensetControl::coil(),
        }
    }
}

/// LOGO! Modbus/TCP to Wialon IPS gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "logo-gateway", version, about)]
pub struct Cli {
    /// Device identifier sent in the login frame
    #[arg(long, env = "IMEI")]
    pub imei: String,

    /// Log frames instead of talking to the telemetry server
    #[arg(long, env = "MOCK", value_parser = BoolishValueParser::new(), action = ArgAction::Set, default_value = "false")]
    pub mock: bool,

    /// PLC (or Modbus gateway) host
    #[arg(long = "modbus-addr", env = "ADDR_MODBUS")]
    pub modbus_addr: String,

    /// PLC Modbus/TCP port
    #[arg(long = "modbus-port", env = "PORT_MODBUS", default_value_t = crate::DEFAULT_TCP_PORT)]
    pub modbus_port: u16,

    /// Telemetry server host
    #[arg(long = "wialon-url", env = "URL_WAILON")]
    pub wialon_url: Option<String>,

    /// Telemetry server port
    #[arg(long = "wialon-port", env = "PORT_WAILON")]
    pub wialon_port: Option<u16>,

    /// `class,name,address` lines of points to sample
    #[arg(long = "registers-read", env = "REGISTERS_READ")]
    pub registers_read: String,

    /// `class,name,address` lines of coils operators may write
    #[arg(long = "registers-write", env = "REGISTERS_WRITE")]
    pub registers_write: String,

    /// `class,name,address` lines of input registers to sample
    #[arg(long = "registers-analog", env = "REGISTERS_ANALOG", default_value = "")]
    pub registers_analog: String,

    /// PLC request timeout in milliseconds
    #[arg(long = "timeout-modbus", env = "TIMEOUT_MODBUS", default_value_t = DEFAULT_PLC_TIMEOUT.as_millis() as u64)]
    pub timeout_modbus: u64,

    /// Accept generator start/stop commands
    #[arg(long = "genset-commands", env = "GENSET_COMMANDS", value_parser = BoolishValueParser::new(), action = ArgAction::Set, default_value = "false")]
    pub genset_commands: bool,

    /// How generator commands reach the PLC
    #[arg(long = "genset-mode", env = "GENSET_MODE", value_enum, default_value_t = GensetMode::Command)]
    pub genset_mode: GensetMode,

    /// Log every Modbus frame as hex
    #[arg(long = "modbus-packet-log", env = "MODBUS_PACKET_LOG", value_parser = BoolishValueParser::new(), action = ArgAction::Set, default_value = "false")]
    pub modbus_packet_log: bool,

    /// Default log filter when RUST_LOG is unset
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Sampling period in seconds
    #[arg(long, default_value_t = 10)]
    pub period: u64,

    /// Longest gap between uploads in minutes
    #[arg(long = "upload-min", alias = "uploadMin", default_value_t = 10)]
    pub upload_min: u64,
}

/// Validated settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub device_id: String,
    pub dry_run: bool,
    /// `host:port` of the PLC.
    pub plc_endpoint: String,
    pub plc_timeout: Duration,
    pub packet_log: bool,
    /// `host:port` of the telemetry server; empty in dry-run mode.
    pub telemetry_endpoint: String,
    pub genset: GensetControl,
    pub log_level: String,
    pub maps: PointMaps,
    pub engine: EngineSettings,
}

fn parse_map(variable: &str, text: &str) -> GatewayResult<AddressMap> {
    AddressMap::parse(text).map_err(|e| GatewayError::config(format!("malformed {}: {}", variable, e)))
}

impl GatewayConfig {
    pub fn from_cli(cli: Cli) -> GatewayResult<Self> {
        if cli.imei.trim().is_empty() {
            return Err(GatewayError::config("IMEI must not be empty"));
        }
        if cli.modbus_addr.trim().is_empty() {
            return Err(GatewayError::config("ADDR_MODBUS must not be empty"));
        }
        if cli.period == 0 || cli.upload_min == 0 || cli.timeout_modbus == 0 {
            return Err(GatewayError::config(
                "period, upload interval and Modbus timeout must be positive",
            ));
        }

        let telemetry_endpoint = match (&cli.wialon_url, cli.wialon_port) {
            (Some(url), Some(port)) if !url.trim().is_empty() => format!("{}:{}", url.trim(), port),
            _ if cli.mock => String::new(),
            _ => {
                return Err(GatewayError::config(
                    "URL_WAILON and PORT_WAILON are required unless MOCK=1",
                ))
            }
        };

        let maps = PointMaps {
            read: parse_map("REGISTERS_READ", &cli.registers_read)?,
            write: parse_map("REGISTERS_WRITE", &cli.registers_write)?,
            analog: parse_map("REGISTERS_ANALOG", &cli.registers_analog)?,
        };

        let engine = EngineSettings {
            period: Duration::from_secs(cli.period),
            max_upload_interval: Duration::from_secs(cli.upload_min * 60),
            genset_enabled: cli.genset_commands,
            ..EngineSettings::default()
        };

        Ok(Self {
            device_id: cli.imei.trim().to_string(),
            dry_run: cli.mock,
            plc_endpoint: format!("{}:{}", cli.modbus_addr.trim(), cli.modbus_port),
            plc_timeout: Duration::from_millis(cli.timeout_modbus),
            packet_log: cli.modbus_packet_log,
            telemetry_endpoint,
            genset: cli.genset_mode.into(),
            log_level: cli.log_level,
            maps,
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GENSET_AUTO_START_COIL;

    fn args(extra: &[&str]) -> Vec<String> {
        let mut all = vec![
            "logo-gateway",
            "--imei",
            "861230045678901",
            "--modbus-addr",
            "192.168.0.3",
            "--wialon-url",
            "wialon.example.net",
            "--wialon-port",
            "20332",
            "--registers-read",
            "I,I1,0\nQ,Q1,8192",
            "--registers-write",
            "Q,Q1,8192",
        ];
        all.extend_from_slice(extra);
        all.into_iter().map(String::from).collect()
    }

    fn config(extra: &[&str]) -> GatewayResult<GatewayConfig> {
        let cli = Cli::try_parse_from(args(extra)).unwrap();
        GatewayConfig::from_cli(cli)
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.plc_endpoint, "192.168.0.3:502");
        assert_eq!(cfg.telemetry_endpoint, "wialon.example.net:20332");
        assert_eq!(cfg.plc_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.engine.period, Duration::from_secs(10));
        assert_eq!(cfg.engine.max_upload_interval, Duration::from_secs(600));
        assert!(!cfg.engine.genset_enabled);
        assert_eq!(cfg.genset, GensetControl::Command);
        assert_eq!(cfg.maps.read.len(), 2);
        assert!(cfg.maps.analog.is_empty());
        assert!(!cfg.dry_run);
    }

    #[test]
    fn test_flags() {
        let cfg = config(&[
            "--period",
            "5",
            "--uploadMin",
            "2",
            "--genset-commands",
            "1",
            "--genset-mode",
            "coil",
            "--mock",
            "1",
        ])
        .unwrap();
        assert_eq!(cfg.engine.period, Duration::from_secs(5));
        assert_eq!(cfg.engine.max_upload_interval, Duration::from_secs(120));
        assert!(cfg.engine.genset_enabled);
        assert_eq!(
            cfg.genset,
            GensetControl::Coil {
                address: GENSET_AUTO_START_COIL
            }
        );
        assert!(cfg.dry_run);
    }

    #[test]
    fn test_malformed_map_is_config_error() {
        let result = config(&["--registers-analog", "AI,T"]);
        assert!(matches!(result, Err(GatewayError::Config { .. })));
    }

    #[test]
    fn test_zero_period_rejected() {
        assert!(config(&["--period", "0"]).is_err());
    }

    #[test]
    fn test_telemetry_endpoint_optional_in_dry_run() {
        let cli = Cli::try_parse_from([
            "logo-gateway",
            "--imei",
            "1",
            "--modbus-addr",
            "plc",
            "--registers-read",
            "",
            "--registers-write",
            "",
            "--mock",
            "true",
        ])
        .unwrap();
        let cfg = GatewayConfig::from_cli(cli.clone()).unwrap();
        assert!(cfg.telemetry_endpoint.is_empty());

        let live = Cli { mock: false, ..cli };
        assert!(GatewayConfig::from_cli(live).is_err());
    }
}
