//! IoT ingestion bridge
//!
//! Subscribes to device telemetry on an MQTT broker and forwards every valid
//! reading to the dashboard's internal HTTP ingestion endpoint, with bounded
//! exponential-backoff retries and a graceful drain on shutdown.
//!
//! # Overview
//!
//! - [`transport::mqtt`] - broker connection, wildcard subscription, reconnects
//! - [`processing`] - topic routing and payload decoding
//! - [`delivery`] - retry policy, HTTP client, per-reading delivery tasks
//! - [`devices`] - dashboard to device updates over the same connection
//! - [`endpoint`] - reference implementation of the ingestion endpoint
//! - [`bridge`] - composition root tying the pieces together
//!
//! # Quick Start
//!
//! ```rust
//! use iot_ingest_bridge::processing::decode;
//! use iot_ingest_bridge::protocol::InboundMessage;
//!
//! let message = InboundMessage::new(
//!     "iot/550e8400-e29b-41d4-a716-446655440001/data",
//!     r#"{"temperature": 25, "humidity": 60}"#,
//!     1,
//!     false,
//! );
//!
//! let reading = decode(&message).unwrap();
//! assert_eq!(reading.device_token, "550e8400-e29b-41d4-a716-446655440001");
//!
//! let body = serde_json::to_value(reading.into_request()).unwrap();
//! assert_eq!(body["data"]["temperature"], 25);
//! assert!(body["metadata"]["messageId"].as_str().unwrap().starts_with("mqtt-"));
//! ```

pub mod bridge;
pub mod config;
pub mod delivery;
pub mod devices;
pub mod endpoint;
pub mod error;
pub mod observability;
pub mod processing;
pub mod protocol;
pub mod shutdown;
pub mod testing;
pub mod transport;

pub use bridge::Bridge;
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult};
pub use protocol::*;
pub use transport::mqtt::MqttClient;
pub use transport::Publisher;
