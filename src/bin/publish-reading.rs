//! Device simulator
//!
//! Publishes one JSON reading to `iot/{deviceToken}/data` the way a sensor
//! would, for manual end-to-end checks against a running bridge.
//!
//! ## Usage
//!
//! ```bash
//! # Reading with the default payload
//! publish-reading --device-token 550e8400-e29b-41d4-a716-446655440001
//!
//! # Custom payload, repeated every two seconds
//! publish-reading --device-token 550e8400-e29b-41d4-a716-446655440001 \
//!   --data '{"temperature": 21.5, "humidity": 48}' --count 10 --interval-ms 2000
//! ```

use clap::Parser;
use iot_ingest_bridge::config::MqttSection;
use iot_ingest_bridge::protocol::build_telemetry_topic;
use iot_ingest_bridge::transport::mqtt::connection::configure_mqtt_options;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, ConnectionError, Event, EventLoop};
use serde_json::{json, Value};
use std::process;
use tokio::time::{sleep, timeout, Duration};

/// How long to wait for ConnAck and PubAck
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(
    name = "publish-reading",
    about = "Publish a simulated device reading to the telemetry topic"
)]
struct Args {
    /// Device token, used as the middle topic segment
    #[arg(long, required = true)]
    device_token: String,

    /// Reading payload as a JSON string
    #[arg(long)]
    data: Option<String>,

    /// Number of readings to publish
    #[arg(long, default_value = "1")]
    count: u32,

    /// Pause between readings
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// MQTT broker URL
    #[arg(long, env = "MQTT_BROKER_URL", default_value = "mqtt://localhost:1883")]
    broker_url: String,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    password: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let data = match args.data.as_deref() {
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(data) => data,
            Err(e) => {
                eprintln!("✗ Invalid reading JSON: {e}");
                process::exit(1);
            }
        },
        None => json!({"temperature": 25, "humidity": 60}),
    };

    if let Err(e) = run(&args, &data).await {
        eprintln!("✗ Failed to publish reading: {e}");
        process::exit(1);
    }
}

async fn run(args: &Args, data: &Value) -> Result<(), Box<dyn std::error::Error>> {
    let section = MqttSection {
        broker_url: args.broker_url.clone(),
        username: args.username.clone(),
        password: args.password.clone(),
        client_id_prefix: "iot-simulator".to_string(),
        ..MqttSection::default()
    };
    let options = configure_mqtt_options(&section)?;
    let (client, mut event_loop) = AsyncClient::new(options, 10);

    println!("Connecting to MQTT broker {}...", args.broker_url);
    wait_for(&mut event_loop, |packet| matches!(packet, Packet::ConnAck(_))).await?;

    let topic = build_telemetry_topic(&args.device_token);
    let payload = serde_json::to_vec(data)?;

    for sequence in 1..=args.count {
        client
            .publish(topic.clone(), QoS::AtLeastOnce, false, payload.clone())
            .await?;
        wait_for(&mut event_loop, |packet| matches!(packet, Packet::PubAck(_))).await?;
        println!("📤 [{sequence}/{}] {topic} {data}", args.count);

        if sequence < args.count {
            sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    client.disconnect().await?;
    // Flush DISCONNECT; the loop errors out once the broker closes the socket
    let _ = timeout(Duration::from_millis(500), async {
        while event_loop.poll().await.is_ok() {}
    })
    .await;

    println!("✓ Published {} reading(s)", args.count);
    Ok(())
}

/// Poll the event loop until an incoming packet matches `done`
async fn wait_for(
    event_loop: &mut EventLoop,
    done: impl Fn(&Packet) -> bool,
) -> Result<(), Box<dyn std::error::Error>> {
    timeout(ACK_TIMEOUT, poll_until(event_loop, done))
        .await
        .map_err(|_| "timed out waiting for broker acknowledgement")??;
    Ok(())
}

async fn poll_until(
    event_loop: &mut EventLoop,
    done: impl Fn(&Packet) -> bool,
) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(packet) = event_loop.poll().await? {
            if done(&packet) {
                return Ok(());
            }
        }
    }
}
