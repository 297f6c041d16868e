//! Test helpers and utilities for integration tests

use iot_ingest_bridge::config::BridgeConfig;
use iot_ingest_bridge::delivery::RetryPolicy;
use iot_ingest_bridge::protocol::InboundMessage;
use serde_json::Value;
use std::time::Duration;

/// Device token of the reference reading
#[allow(dead_code)]
pub const DEVICE_TOKEN: &str = "550e8400-e29b-41d4-a716-446655440001";

/// A second, independent device
#[allow(dead_code)]
pub const OTHER_DEVICE_TOKEN: &str = "6fa459ea-ee8a-3ca4-894e-db77e160355e";

#[allow(dead_code)]
pub const API_KEY: &str = "test-internal-key";

/// Configuration pointing the bridge at `api_base_url`, health server off
#[allow(dead_code)]
pub fn test_config(api_base_url: &str) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.ingest.api_base_url = api_base_url.to_string();
    config.ingest.internal_api_key = API_KEY.to_string();
    config.ingest.request_timeout_ms = 2000;
    config.health.enabled = false;
    config
}

/// The default 5 attempt policy with millisecond delays
#[allow(dead_code)]
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(
        5,
        Duration::from_millis(10),
        Duration::from_millis(80),
        2.0,
    )
    .unwrap()
}

/// An inbound publish on the telemetry topic of `device_token`
#[allow(dead_code)]
pub fn telemetry(device_token: &str, payload: Value) -> InboundMessage {
    InboundMessage::new(
        format!("iot/{device_token}/data"),
        payload.to_string(),
        1,
        false,
    )
}
