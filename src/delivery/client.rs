//! One HTTP attempt against the ingestion endpoint
//!
//! [`IngestClient`] is the seam the retry engine drives; [`HttpIngestClient`]
//! is the reqwest implementation and `testing::mocks::MockIngestClient` the
//! scripted one.

use crate::config::IngestSection;
use crate::error::{payload_preview, sanitize_message};
use crate::protocol::{IngestRequest, IngestResponse};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Header carrying the shared internal secret
pub const API_KEY_HEADER: &str = "X-Internal-API-Key";

/// Path of the ingestion endpoint below the API base URL
pub const INGEST_PATH: &str = "/api/internal/data";

/// Result of one successful attempt
#[derive(Debug, Clone, PartialEq)]
pub struct IngestAck {
    pub status: u16,
    /// Absent when the 2xx body did not parse
    pub device_id: Option<String>,
}

/// Why one attempt failed
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SendError {
    #[error("ingestion endpoint returned HTTP {status}: {body_preview}")]
    Rejected { status: u16, body_preview: String },
    #[error("request failed: {message}")]
    Transport { message: String, timeout: bool },
}

impl SendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            SendError::Rejected { status, .. } => Some(*status),
            SendError::Transport { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SendError::Transport { timeout: true, .. })
    }
}

#[async_trait]
pub trait IngestClient: Send + Sync {
    /// POST one request; 2xx is success, anything else an error
    async fn send(&self, request: &IngestRequest) -> Result<IngestAck, SendError>;
}

pub struct HttpIngestClient {
    client: reqwest::Client,
    endpoint_url: String,
    api_key: String,
}

impl HttpIngestClient {
    pub fn new(config: &IngestSection) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            client,
            endpoint_url: config.endpoint_url(),
            api_key: config.internal_api_key.clone(),
        })
    }

    /// Client against an explicit base URL
    pub fn with_base_url(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint_url: format!("{}{}", base_url.trim_end_matches('/'), INGEST_PATH),
            api_key: api_key.into(),
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    async fn send(&self, request: &IngestRequest) -> Result<IngestAck, SendError> {
        let response = self
            .client
            .post(&self.endpoint_url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| SendError::Transport {
                message: sanitize_message(&e.to_string()),
                timeout: e.is_timeout(),
            })?;

        let status = response.status();
        // An unreadable body only loses the preview or the device id
        let body = response.bytes().await.unwrap_or_default();

        if status.is_success() {
            let device_id = serde_json::from_slice::<IngestResponse>(&body)
                .ok()
                .and_then(|parsed| parsed.device_id);
            debug!(
                target: "delivery",
                status = status.as_u16(),
                device_id = device_id.as_deref().unwrap_or("unknown"),
                "Ingestion endpoint accepted reading"
            );
            Ok(IngestAck {
                status: status.as_u16(),
                device_id,
            })
        } else {
            Err(SendError::Rejected {
                status: status.as_u16(),
                body_preview: payload_preview(&body),
            })
        }
    }
}
