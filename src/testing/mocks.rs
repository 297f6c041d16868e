//! Mock implementations for testing
//!
//! Provides scripted IngestClient, recording Publisher and failing
//! DeviceRegistry implementations so the bridge can be exercised without a
//! broker or a live ingestion endpoint.

use crate::delivery::{IngestAck, IngestClient, SendError};
use crate::endpoint::registry::{DeviceRecord, DeviceRegistry, RegistryError};
use crate::protocol::{IngestRequest, ReadingMetadata};
use crate::transport::mqtt::{ConnectionState, DisconnectReason, MqttError};
use crate::transport::Publisher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A minimal, well-formed ingestion request for `device_token`
pub fn sample_request(device_token: &str) -> IngestRequest {
    IngestRequest {
        device_token: device_token.to_string(),
        topic: format!("iot/{device_token}/data"),
        data: json!({"temperature": 25, "humidity": 60}),
        timestamp: "2024-05-01T12:30:00.000Z".to_string(),
        metadata: ReadingMetadata {
            qos: 1,
            retain: false,
            message_id: "mqtt-1714566600000-abc123def".to_string(),
        },
    }
}

/// Scripted answer of [`MockIngestClient`]
#[derive(Debug, Clone, PartialEq)]
pub enum MockResponse {
    Ok { device_id: String },
    Status(u16),
    Transport(String),
    Timeout,
    /// Never answers
    Hang,
}

impl MockResponse {
    pub fn ok(device_id: impl Into<String>) -> Self {
        MockResponse::Ok {
            device_id: device_id.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        MockResponse::Status(status)
    }

    pub fn hang() -> Self {
        MockResponse::Hang
    }
}

/// A request seen by [`MockIngestClient`], stamped with the tokio clock
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: IngestRequest,
    pub at: Instant,
}

/// Mock ingestion client
///
/// Answers from a per-device script if one is registered, otherwise from the
/// default script. The last entry of a script repeats forever.
#[derive(Debug)]
pub struct MockIngestClient {
    default_script: Mutex<VecDeque<MockResponse>>,
    device_scripts: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockIngestClient {
    pub fn always(response: MockResponse) -> Self {
        Self::sequence(vec![response])
    }

    pub fn sequence(responses: Vec<MockResponse>) -> Self {
        Self {
            default_script: Mutex::new(responses.into()),
            device_scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_device_script(
        mut self,
        device_token: impl Into<String>,
        responses: Vec<MockResponse>,
    ) -> Self {
        self.device_scripts
            .get_mut()
            .insert(device_token.into(), responses.into());
        self
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn requests_for(&self, device_token: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|recorded| recorded.request.device_token == device_token)
            .cloned()
            .collect()
    }

    async fn next_response(&self, device_token: &str) -> MockResponse {
        let mut device_scripts = self.device_scripts.lock().await;
        if let Some(script) = device_scripts.get_mut(device_token) {
            return next_from(script);
        }
        drop(device_scripts);

        next_from(&mut *self.default_script.lock().await)
    }
}

fn next_from(script: &mut VecDeque<MockResponse>) -> MockResponse {
    if script.len() > 1 {
        script.pop_front().unwrap_or(MockResponse::Status(500))
    } else {
        script.front().cloned().unwrap_or(MockResponse::Status(500))
    }
}

#[async_trait]
impl IngestClient for MockIngestClient {
    async fn send(&self, request: &IngestRequest) -> Result<IngestAck, SendError> {
        self.requests.lock().await.push(RecordedRequest {
            request: request.clone(),
            at: Instant::now(),
        });

        match self.next_response(&request.device_token).await {
            MockResponse::Ok { device_id } => Ok(IngestAck {
                status: 200,
                device_id: Some(device_id),
            }),
            MockResponse::Status(status) => Err(SendError::Rejected {
                status,
                body_preview: json!({"error": "mock rejection"}).to_string(),
            }),
            MockResponse::Transport(message) => Err(SendError::Transport {
                message,
                timeout: false,
            }),
            MockResponse::Timeout => Err(SendError::Transport {
                message: "operation timed out".to_string(),
                timeout: true,
            }),
            MockResponse::Hang => std::future::pending().await,
        }
    }
}

/// One publish seen by [`MockPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Mock publisher for testing
#[derive(Debug, Default)]
pub struct MockPublisher {
    published: Mutex<Vec<PublishedMessage>>,
    should_fail: bool,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn get_published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    ) -> Result<(), MqttError> {
        if self.should_fail {
            return Err(MqttError::NotConnected {
                state: ConnectionState::Disconnected(DisconnectReason::Lost(
                    "Mock disconnection".to_string(),
                )),
            });
        }

        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }
}

/// Registry whose every call fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingDeviceRegistry;

#[async_trait]
impl DeviceRegistry for FailingDeviceRegistry {
    async fn find_active_by_token(
        &self,
        _device_token: &str,
    ) -> Result<Option<DeviceRecord>, RegistryError> {
        Err(RegistryError::Unavailable(
            "mock registry offline".to_string(),
        ))
    }

    async fn touch_last_seen(
        &self,
        _device_id: &str,
        _at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        Err(RegistryError::Unavailable(
            "mock registry offline".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_last_entry_repeats() {
        let client = MockIngestClient::sequence(vec![
            MockResponse::status(503),
            MockResponse::ok("device-id-123"),
        ]);
        let request = sample_request("dev-1");

        assert!(client.send(&request).await.is_err());
        assert!(client.send(&request).await.is_ok());
        assert!(client.send(&request).await.is_ok());
        assert_eq!(client.request_count().await, 3);
    }

    #[tokio::test]
    async fn test_device_script_overrides_default() {
        let client = MockIngestClient::always(MockResponse::ok("device-id-123"))
            .with_device_script("dev-bad", vec![MockResponse::status(404)]);

        assert!(client.send(&sample_request("dev-good")).await.is_ok());
        let error = client.send(&sample_request("dev-bad")).await.unwrap_err();
        assert_eq!(error.status(), Some(404));
        assert_eq!(client.requests_for("dev-bad").await.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_publisher_records_and_fails() {
        let publisher = MockPublisher::new();
        publisher
            .publish("devices/a/widget/w/update", b"{}".to_vec(), 1, true)
            .await
            .unwrap();
        let published = publisher.get_published().await;
        assert_eq!(published.len(), 1);
        assert!(published[0].retain);

        assert!(MockPublisher::with_failure()
            .publish("t", Vec::new(), 0, false)
            .await
            .is_err());
    }
}
