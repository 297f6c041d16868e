//! IoT ingestion bridge - main entry point
//!
//! Loads configuration, starts the bridge and keeps it running until SIGINT or
//! SIGTERM, then drains in-flight deliveries before exiting.

use clap::{Parser, Subcommand};
use iot_ingest_bridge::config::BridgeConfig;
use iot_ingest_bridge::observability::init_default_logging;
use iot_ingest_bridge::Bridge;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info};

/// MQTT to HTTP ingestion bridge for IoT device telemetry
#[derive(Parser)]
#[command(name = "iot-bridge")]
#[command(about = "Forwards device telemetry from MQTT to the dashboard ingestion API")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until interrupted
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration with secrets redacted
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!(target: "bridge", "Starting iot-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match BridgeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(target: "bridge", error = %e, "Failed to load configuration");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(target: "bridge", error = %e, "Command failed");
        process::exit(1);
    }

    info!(target: "bridge", "Application shutdown complete");
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut bridge = Bridge::new(config)?;
    bridge.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(target: "bridge", "Bridge is running and forwarding device telemetry...");

    tokio::select! {
        _ = sigint.recv() => {
            info!(target: "bridge", "Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!(target: "bridge", "Received SIGTERM, shutting down gracefully...");
        }
    }

    let report = bridge.stop().await?;
    if report.aborted > 0 {
        error!(
            target: "bridge",
            aborted = report.aborted,
            "Some deliveries were still in flight at shutdown"
        );
    }
    Ok(())
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }

    info!(target: "bridge", "Configuration validation complete");
    Ok(())
}
