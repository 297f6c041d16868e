//! Wire and in-flight message types for the ingestion bridge
//!
//! [`InboundMessage`] is what the broker hands us, [`DecodedReading`] is what
//! survives topic and payload checks, and [`IngestRequest`] is the body POSTed
//! to the ingestion endpoint. Response bodies of that endpoint live here too so
//! the client and the reference endpoint agree on one definition.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One publish received from the broker. Consumed once by the router.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Broker QoS level of the received publish (0, 1 or 2)
    pub qos: u8,
    pub retain: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: u8, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            received_at: Utc::now(),
        }
    }
}

/// Metadata synthesized for every decoded reading
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadingMetadata {
    pub qos: u8,
    pub retain: bool,
    pub message_id: String,
}

/// A telemetry reading that passed topic and payload checks
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReading {
    pub device_token: String,
    pub topic: String,
    /// Arbitrary JSON sensor data, passed through uninterpreted
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub metadata: ReadingMetadata,
}

impl DecodedReading {
    /// Wrap this reading into the canonical ingestion request body
    pub fn into_request(self) -> IngestRequest {
        IngestRequest {
            device_token: self.device_token,
            topic: self.topic,
            data: self.data,
            timestamp: format_timestamp(&self.timestamp),
            metadata: self.metadata,
        }
    }
}

/// Body of `POST {apiBaseUrl}/api/internal/data`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub device_token: String,
    pub topic: String,
    pub data: Value,
    /// ISO-8601 / RFC-3339 timestamp with millisecond precision
    pub timestamp: String,
    pub metadata: ReadingMetadata,
}

/// Successful ingestion response (`200`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Error response body (`400`, `401`, `403`, `404`, `429`, `500`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<ValidationDetail>>,
}

impl IngestErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }
}

/// One schema violation reported by the ingestion endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationDetail {
    pub path: String,
    pub message: String,
}

/// Payload pushed to a device for widget or dashboard updates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceUpdate {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget: Option<String>,
    pub data: Value,
}

/// Render a timestamp the way the ingestion endpoint expects it
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// True when `value` is a JSON object with at least one key
pub fn is_non_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(|map| !map.is_empty())
}
