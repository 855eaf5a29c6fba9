//! Logging setup
//!
//! The library only emits `tracing` events; the binary installs the subscriber.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{GatewayError, GatewayResult};

/// Install a formatting subscriber.
///
/// `RUST_LOG` wins over `level` when set.
pub fn init(level: &str) -> GatewayResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| GatewayError::config(format!("logging already initialized: {}", e)))
}

/// Format raw bytes as a hex string for packet logging
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[0x00, 0x01, 0xFF]), "00 01 FF");
        assert_eq!(format_hex_packet(&[]), "");
    }
}
