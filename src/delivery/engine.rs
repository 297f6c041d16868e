//! Retry engine: drive one request to a terminal outcome
//!
//! The loop is iterative: classify each attempt, sleep the policy delay
//! (interruptible by shutdown) and try again until success, a terminal
//! status, an exhausted budget or cancellation.

use super::client::{IngestClient, SendError};
use super::policy::RetryPolicy;
use crate::observability::BridgeMetrics;
use crate::protocol::IngestRequest;
use crate::shutdown::{interruptible_sleep, ShutdownReceiver};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Classification of one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success { device_id: Option<String> },
    /// Failed, will retry after `delay`
    Retryable { error: SendError, delay: Duration },
    /// Failed, no further attempts
    TerminalFailure { error: SendError, reason: TerminalKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    /// Attempt budget used up
    Exhausted,
    /// Status listed as non-retryable
    NonRetryableStatus,
}

/// State of one delivery across its attempts
#[derive(Debug, Clone)]
pub struct DeliveryAttempt<'a> {
    /// 1-based
    pub number: u32,
    pub request: &'a IngestRequest,
    pub outcome: Option<AttemptOutcome>,
}

impl<'a> DeliveryAttempt<'a> {
    pub fn first(request: &'a IngestRequest) -> Self {
        Self {
            number: 1,
            request,
            outcome: None,
        }
    }

    /// Classify the result of this attempt under `policy`
    pub fn record(
        &mut self,
        policy: &RetryPolicy,
        result: Result<Option<String>, SendError>,
    ) -> AttemptOutcome {
        let outcome = classify(policy, self.number, result);
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Delay before the next attempt, if one is due
    pub fn next_delay(&self) -> Option<Duration> {
        match &self.outcome {
            Some(AttemptOutcome::Retryable { delay, .. }) => Some(*delay),
            _ => None,
        }
    }

    /// Move on to the next attempt
    pub fn advance(&mut self) {
        self.number += 1;
        self.outcome = None;
    }
}

/// Pure classification of one attempt's result
pub fn classify(
    policy: &RetryPolicy,
    attempt: u32,
    result: Result<Option<String>, SendError>,
) -> AttemptOutcome {
    match result {
        Ok(device_id) => AttemptOutcome::Success { device_id },
        Err(error) => {
            if error.status().is_some_and(|s| policy.is_terminal_status(s)) {
                AttemptOutcome::TerminalFailure {
                    error,
                    reason: TerminalKind::NonRetryableStatus,
                }
            } else if policy.is_exhausted(attempt) {
                AttemptOutcome::TerminalFailure {
                    error,
                    reason: TerminalKind::Exhausted,
                }
            } else {
                AttemptOutcome::Retryable {
                    error,
                    delay: policy.delay_for(attempt),
                }
            }
        }
    }
}

/// Final result of a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered {
        attempts: u32,
        device_id: Option<String>,
    },
    Failed {
        attempts: u32,
        reason: FailureReason,
    },
}

impl DeliveryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts, .. } | DeliveryOutcome::Failed { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Exhausted { last_error: SendError },
    Terminal { error: SendError },
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Exhausted { last_error } => {
                write!(f, "retries exhausted, last error: {last_error}")
            }
            FailureReason::Terminal { error } => write!(f, "non-retryable response: {error}"),
            FailureReason::Cancelled => write!(f, "cancelled by shutdown"),
        }
    }
}

pub struct RetryEngine {
    client: Arc<dyn IngestClient>,
    policy: RetryPolicy,
    metrics: Arc<BridgeMetrics>,
}

impl RetryEngine {
    pub fn new(
        client: Arc<dyn IngestClient>,
        policy: RetryPolicy,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            client,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver `request`, retrying per policy until a terminal outcome.
    ///
    /// The first attempt always goes out. Shutdown is observed only by the
    /// backoff sleep, so no retry starts once `shutdown_rx` is set and an
    /// attempt already on the wire is allowed to finish.
    pub async fn send(
        &self,
        request: &IngestRequest,
        shutdown_rx: &mut ShutdownReceiver,
    ) -> DeliveryOutcome {
        let mut attempt = DeliveryAttempt::first(request);

        loop {
            self.metrics.delivery_attempt();
            debug!(
                target: "delivery",
                device_token = %request.device_token,
                message_id = %request.metadata.message_id,
                attempt = attempt.number,
                "Sending reading to ingestion endpoint"
            );

            let result = self.client.send(request).await.map(|ack| ack.device_id);

            match attempt.record(&self.policy, result) {
                AttemptOutcome::Success { device_id } => {
                    return DeliveryOutcome::Delivered {
                        attempts: attempt.number,
                        device_id,
                    };
                }
                AttemptOutcome::TerminalFailure { error, reason } => {
                    let reason = match reason {
                        TerminalKind::NonRetryableStatus => {
                            self.metrics.terminal_rejection();
                            FailureReason::Terminal { error }
                        }
                        TerminalKind::Exhausted => FailureReason::Exhausted { last_error: error },
                    };
                    return DeliveryOutcome::Failed {
                        attempts: attempt.number,
                        reason,
                    };
                }
                AttemptOutcome::Retryable { error, delay } => {
                    self.metrics.retry_scheduled();
                    warn!(
                        target: "delivery",
                        device_token = %request.device_token,
                        message_id = %request.metadata.message_id,
                        attempt = attempt.number,
                        max_retries = self.policy.max_retries(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Delivery attempt failed, retrying"
                    );

                    if !interruptible_sleep(shutdown_rx, delay).await {
                        return DeliveryOutcome::Failed {
                            attempts: attempt.number,
                            reason: FailureReason::Cancelled,
                        };
                    }
                    attempt.advance();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(status: u16) -> SendError {
        SendError::Rejected {
            status,
            body_preview: String::new(),
        }
    }

    fn transport() -> SendError {
        SendError::Transport {
            message: "connection refused".to_string(),
            timeout: false,
        }
    }

    #[test]
    fn test_classify_success() {
        let policy = RetryPolicy::default();
        assert_eq!(
            classify(&policy, 1, Ok(Some("device-id-123".to_string()))),
            AttemptOutcome::Success {
                device_id: Some("device-id-123".to_string())
            }
        );
    }

    #[test]
    fn test_classify_retryable_with_policy_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(
            classify(&policy, 3, Err(rejected(500))),
            AttemptOutcome::Retryable {
                error: rejected(500),
                delay: Duration::from_millis(4000),
            }
        );
        assert_eq!(
            classify(&policy, 1, Err(transport())),
            AttemptOutcome::Retryable {
                error: transport(),
                delay: Duration::from_millis(1000),
            }
        );
    }

    #[test]
    fn test_classify_terminal_statuses() {
        let policy = RetryPolicy::default();
        for status in [401, 403, 404] {
            assert_eq!(
                classify(&policy, 1, Err(rejected(status))),
                AttemptOutcome::TerminalFailure {
                    error: rejected(status),
                    reason: TerminalKind::NonRetryableStatus,
                }
            );
        }
    }

    #[test]
    fn test_classify_uniform_policy_retries_auth_failures() {
        let policy = RetryPolicy::default().with_terminal_statuses(Vec::new());
        assert!(matches!(
            classify(&policy, 1, Err(rejected(401))),
            AttemptOutcome::Retryable { .. }
        ));
    }

    #[test]
    fn test_classify_exhausted_on_last_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(
            classify(&policy, 5, Err(rejected(503))),
            AttemptOutcome::TerminalFailure {
                error: rejected(503),
                reason: TerminalKind::Exhausted,
            }
        );
    }

    #[test]
    fn test_attempt_lifecycle() {
        let policy = RetryPolicy::default();
        let request = crate::testing::mocks::sample_request("dev-1");
        let mut attempt = DeliveryAttempt::first(&request);
        assert_eq!(attempt.number, 1);

        attempt.record(&policy, Err(transport()));
        assert_eq!(attempt.next_delay(), Some(Duration::from_millis(1000)));

        attempt.advance();
        assert_eq!(attempt.number, 2);
        assert_eq!(attempt.next_delay(), None);

        attempt.record(&policy, Err(transport()));
        assert_eq!(attempt.next_delay(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(FailureReason::Cancelled.to_string(), "cancelled by shutdown");
        assert!(FailureReason::Terminal {
            error: rejected(403)
        }
        .to_string()
        .contains("HTTP 403"));
    }
}
