//! Pure decoding of inbound publishes into readings
//!
//! No logging and no metrics here; [`super::router::TopicRouter`] decides what
//! to do with a [`DecodeError`].

use crate::error::payload_preview;
use crate::protocol::{parse_device_topic, DecodedReading, InboundMessage, ReadingMetadata, TopicError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Length of the random suffix in generated message identifiers
const MESSAGE_ID_SUFFIX_LEN: usize = 9;

/// Why an inbound publish never reaches delivery
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("invalid topic '{topic}': {source}")]
    InvalidTopic {
        topic: String,
        #[source]
        source: TopicError,
    },
    #[error("invalid JSON payload: {reason} (payload: {preview})")]
    InvalidPayload { reason: String, preview: String },
}

/// Decode one inbound publish.
///
/// The topic must be `iot/{deviceToken}/data` and the payload must be valid
/// JSON; the JSON itself is passed through without interpretation.
pub fn decode(message: &InboundMessage) -> Result<DecodedReading, DecodeError> {
    let device_token =
        parse_device_topic(&message.topic).map_err(|source| DecodeError::InvalidTopic {
            topic: message.topic.clone(),
            source,
        })?;

    let data: Value =
        serde_json::from_slice(&message.payload).map_err(|e| DecodeError::InvalidPayload {
            reason: e.to_string(),
            preview: payload_preview(&message.payload),
        })?;

    Ok(DecodedReading {
        device_token: device_token.to_string(),
        topic: message.topic.clone(),
        data,
        timestamp: message.received_at,
        metadata: ReadingMetadata {
            qos: message.qos,
            retain: message.retain,
            message_id: generate_message_id(Utc::now()),
        },
    })
}

/// `mqtt-{epoch_ms}-{9 hex chars}`; the suffix comes from a v4 UUID
pub fn generate_message_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "mqtt-{}-{}",
        now.timestamp_millis(),
        &random[..MESSAGE_ID_SUFFIX_LEN]
    )
}
