//! Terminal-failure hand-off
//!
//! Every delivery that ends without success is handed to a [`DeadLetterSink`]
//! so the embedding process can persist, spill or alert on it.

use super::engine::FailureReason;
use crate::protocol::IngestRequest;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, warn};

/// A reading the bridge gave up on
#[derive(Debug, Clone, PartialEq)]
pub struct FailedDelivery {
    pub request: IngestRequest,
    pub attempts: u32,
    pub reason: FailureReason,
    pub failed_at: DateTime<Utc>,
}

impl FailedDelivery {
    pub fn new(request: IngestRequest, attempts: u32, reason: FailureReason) -> Self {
        Self {
            request,
            attempts,
            reason,
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, failed: FailedDelivery);
}

/// Default sink: one error log entry per failed delivery
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn record(&self, failed: FailedDelivery) {
        error!(
            target: "delivery",
            device_token = %failed.request.device_token,
            message_id = %failed.request.metadata.message_id,
            attempts = failed.attempts,
            reason = %failed.reason,
            failed_at = %failed.failed_at.to_rfc3339(),
            "Reading dead-lettered"
        );
    }
}

/// Forwards failed deliveries to a channel consumer
///
/// Never waits on the consumer: when the channel is full the failed delivery
/// is logged at error level instead, so a slow consumer cannot hold delivery
/// tasks open until the shutdown drain aborts them.
#[derive(Debug, Clone)]
pub struct ChannelDeadLetterSink {
    tx: mpsc::Sender<FailedDelivery>,
}

impl ChannelDeadLetterSink {
    pub fn new(tx: mpsc::Sender<FailedDelivery>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving half of a channel with `capacity` slots
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FailedDelivery>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl DeadLetterSink for ChannelDeadLetterSink {
    async fn record(&self, failed: FailedDelivery) {
        match self.tx.try_send(failed) {
            Ok(()) => {}
            Err(TrySendError::Full(failed)) => {
                error!(
                    target: "delivery",
                    device_token = %failed.request.device_token,
                    message_id = %failed.request.metadata.message_id,
                    attempts = failed.attempts,
                    reason = %failed.reason,
                    "Dead-letter channel full, failed delivery lost"
                );
            }
            Err(TrySendError::Closed(failed)) => {
                warn!(
                    target: "delivery",
                    device_token = %failed.request.device_token,
                    "Dead-letter consumer gone, failed delivery lost"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::sample_request;

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelDeadLetterSink::channel(4);
        sink.record(FailedDelivery::new(
            sample_request("dev-1"),
            5,
            FailureReason::Cancelled,
        ))
        .await;

        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.request.device_token, "dev-1");
        assert_eq!(failed.attempts, 5);
        assert_eq!(failed.reason, FailureReason::Cancelled);
    }

    #[tokio::test]
    async fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelDeadLetterSink::channel(1);
        drop(rx);
        sink.record(FailedDelivery::new(
            sample_request("dev-2"),
            1,
            FailureReason::Cancelled,
        ))
        .await;
    }

    #[tokio::test]
    async fn test_channel_sink_does_not_wait_for_full_channel() {
        let (sink, mut rx) = ChannelDeadLetterSink::channel(1);
        for token in ["dev-1", "dev-2"] {
            tokio::time::timeout(
                std::time::Duration::from_millis(100),
                sink.record(FailedDelivery::new(
                    sample_request(token),
                    5,
                    FailureReason::Cancelled,
                )),
            )
            .await
            .expect("record must not block on a full channel");
        }

        assert_eq!(rx.recv().await.unwrap().request.device_token, "dev-1");
        assert!(rx.try_recv().is_err());
    }
}
