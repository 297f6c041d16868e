//! Topic router: decode, log and count
//!
//! Malformed topics are expected noise and logged at warn; unparseable
//! payloads are logged at error with a bounded preview. Neither ever reaches
//! the delivery pipeline.

use super::decoder::{decode, DecodeError};
use crate::observability::BridgeMetrics;
use crate::protocol::{DecodedReading, InboundMessage};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct TopicRouter {
    metrics: Arc<BridgeMetrics>,
}

impl TopicRouter {
    pub fn new(metrics: Arc<BridgeMetrics>) -> Self {
        Self { metrics }
    }

    /// Decode `message`, or log and discard it
    pub fn route(&self, message: &InboundMessage) -> Option<DecodedReading> {
        match decode(message) {
            Ok(reading) => {
                debug!(
                    target: "decoder",
                    device_token = %reading.device_token,
                    message_id = %reading.metadata.message_id,
                    "Decoded reading"
                );
                Some(reading)
            }
            Err(DecodeError::InvalidTopic { topic, source }) => {
                self.metrics.discarded_invalid_topic();
                warn!(target: "decoder", topic = %topic, reason = %source, "Discarding message with unexpected topic");
                None
            }
            Err(DecodeError::InvalidPayload { reason, preview }) => {
                self.metrics.discarded_invalid_payload();
                error!(
                    target: "decoder",
                    topic = %message.topic,
                    reason = %reason,
                    payload_preview = %preview,
                    "Discarding message with unparseable payload"
                );
                None
            }
        }
    }
}
