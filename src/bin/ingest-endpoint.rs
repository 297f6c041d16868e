//! Reference ingestion endpoint
//!
//! Serves `POST /api/internal/data` backed by an in-memory device list, so the
//! bridge can be exercised end to end without the dashboard backend.
//!
//! ## Usage
//!
//! ```bash
//! # Devices from a JSON file: [{"id": "...", "deviceToken": "...", "deviceName": "..."}]
//! ingest-endpoint --devices devices.json
//!
//! # Ad-hoc devices, ids generated
//! ingest-endpoint --device 550e8400-e29b-41d4-a716-446655440001 --bind 127.0.0.1:3000
//! ```

use clap::Parser;
use iot_ingest_bridge::endpoint::{serve, DeviceRecord, InMemoryDeviceRegistry, IngestState};
use iot_ingest_bridge::observability::init_default_logging;
use iot_ingest_bridge::shutdown::ShutdownTrigger;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "ingest-endpoint",
    about = "Run the reference ingestion endpoint with a fixed device list"
)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// Shared secret expected in X-Internal-API-Key
    #[arg(
        long,
        env = "INTERNAL_API_KEY",
        default_value = "dev-internal-key-change-in-production"
    )]
    api_key: String,

    /// JSON file holding an array of device records
    #[arg(long, value_name = "FILE")]
    devices: Option<PathBuf>,

    /// Device token to register as active (repeatable)
    #[arg(long = "device", value_name = "TOKEN")]
    device_tokens: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_default_logging();

    if let Err(e) = run(args).await {
        error!(target: "ingest_endpoint", error = %e, "Ingestion endpoint failed");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut devices = match &args.devices {
        Some(path) => load_devices(path)?,
        None => Vec::new(),
    };
    devices.extend(args.device_tokens.iter().map(|token| DeviceRecord {
        id: Uuid::new_v4().to_string(),
        device_token: token.clone(),
        device_name: format!("device-{}", token.chars().take(8).collect::<String>()),
        is_active: true,
        last_seen: None,
    }));

    for device in &devices {
        info!(
            target: "ingest_endpoint",
            device_id = %device.id,
            device_token = %device.device_token,
            active = device.is_active,
            "Registered device"
        );
    }

    let registry = Arc::new(InMemoryDeviceRegistry::with_devices(devices));
    let state = Arc::new(IngestState::new(args.api_key, registry)?);

    let trigger = ShutdownTrigger::new();
    let mut server = tokio::spawn(serve(state, args.bind, trigger.subscribe()));

    tokio::select! {
        finished = &mut server => {
            // Only reachable when binding failed
            finished??;
            return Ok(());
        }
        interrupted = signal::ctrl_c() => {
            interrupted?;
            info!(target: "ingest_endpoint", "Received SIGINT, shutting down...");
        }
    }

    trigger.trigger();
    server.await??;
    Ok(())
}

fn load_devices(path: &Path) -> Result<Vec<DeviceRecord>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
