//! LOGO! to Wialon IPS gateway
//!
//! Samples the PLC every `--period` seconds, uploads significant changes (or
//! at least every `--upload-min` minutes) and relays operator commands back.
//!
//! Exit status: 0 after Ctrl-C, 1 when a failure budget runs out, 2 when the
//! configuration is invalid or a startup connection fails.
//!
//! Usage: logo-gateway [--period 10] [--upload-min 10]
//! (all other settings from the environment or `.env`)

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info};

use logo_wialon_gateway::{
    logging, Cli, DryRunLink, ExitProcess, GatewayConfig, GatewayError, GatewayResult,
    ModbusGateway, ModbusTcpClient, PollingEngine, TelemetryIo, TelemetryLink, VERSION,
};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.log_level) {
        eprintln!("{}", e);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("startup failed: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> GatewayResult<()> {
    let config = GatewayConfig::from_cli(cli)?;
    info!("logo-gateway {} starting", VERSION);

    let plc_address = tokio::net::lookup_host(config.plc_endpoint.as_str())
        .await?
        .next()
        .ok_or_else(|| GatewayError::config(format!("cannot resolve {}", config.plc_endpoint)))?;
    let mut client = ModbusTcpClient::connect(plc_address, config.plc_timeout).await?;
    client.set_packet_logging(config.packet_log);
    info!("connected to PLC at {}", plc_address);

    let gateway = ModbusGateway::new(client).with_genset_control(config.genset);

    if config.dry_run {
        let link = Arc::new(DryRunLink::new(config.device_id.clone()));
        serve(gateway, link, config).await
    } else {
        let link = Arc::new(TelemetryLink::new(
            config.telemetry_endpoint.clone(),
            config.device_id.clone(),
        ));
        serve(gateway, link, config).await
    }
}

async fn serve<T: TelemetryIo>(
    gateway: ModbusGateway<ModbusTcpClient>,
    link: Arc<T>,
    config: GatewayConfig,
) -> GatewayResult<()> {
    link.open().await?;
    info!("connected to {}", config.telemetry_endpoint);

    let engine = PollingEngine::new(gateway, link, config.maps, config.engine, Arc::new(ExitProcess));
    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("stopped");
    Ok(())
}
