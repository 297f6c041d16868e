//! Delivery pipeline: one task per reading
//!
//! [`DeliveryPipeline::deliver`] never waits on the network. Each reading is
//! turned into an [`IngestRequest`] and driven by the [`RetryEngine`] in its
//! own task, so one reading's backoff never holds up the next reading's first
//! attempt. Finished tasks are reaped opportunistically on every call.

use super::dead_letter::{DeadLetterSink, FailedDelivery};
use super::engine::{DeliveryOutcome, FailureReason, RetryEngine};
use crate::delivery_span;
use crate::observability::BridgeMetrics;
use crate::protocol::{DecodedReading, IngestRequest};
use crate::shutdown::{ShutdownReceiver, ShutdownTrigger};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};

/// What happened to in-flight deliveries during [`DeliveryPipeline::shutdown`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Tasks that finished within the drain timeout
    pub completed: usize,
    /// Tasks aborted when the timeout elapsed
    pub aborted: usize,
}

pub struct DeliveryPipeline {
    engine: Arc<RetryEngine>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<BridgeMetrics>,
    shutdown: ShutdownTrigger,
    tasks: Mutex<JoinSet<()>>,
}

impl DeliveryPipeline {
    pub fn new(
        engine: Arc<RetryEngine>,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            engine,
            dead_letters,
            metrics,
            shutdown: ShutdownTrigger::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Hand `reading` off for delivery and return immediately.
    ///
    /// Readings accepted before [`shutdown`](Self::shutdown) get at least their
    /// first attempt; readings handed in afterwards are dead-lettered as
    /// cancelled without an attempt. Must be called from within a tokio runtime.
    pub fn deliver(&self, reading: DecodedReading) {
        let request = reading.into_request();
        let span = delivery_span!(
            device_token = %request.device_token,
            message_id = %request.metadata.message_id
        );

        self.metrics.delivery_started();
        let job = DeliveryJob {
            engine: Arc::clone(&self.engine),
            dead_letters: Arc::clone(&self.dead_letters),
            metrics: Arc::clone(&self.metrics),
            shutdown_rx: self.shutdown.subscribe(),
        };

        let mut tasks = self.lock_tasks();
        while let Some(result) = tasks.try_join_next() {
            log_join_failure(result);
        }
        if self.is_shutting_down() {
            tasks.spawn(job.reject(request).instrument(span));
        } else {
            tasks.spawn(job.run(request).instrument(span));
        }
    }

    /// Deliveries not yet reaped
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.lock_tasks();
        while let Some(result) = tasks.try_join_next() {
            log_join_failure(result);
        }
        tasks.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Cancel pending backoffs and wait up to `drain_timeout` for in-flight
    /// deliveries, aborting whatever is still running afterwards.
    ///
    /// Deliveries already accepted still make their first attempt; only
    /// retries are cancelled.
    pub async fn shutdown(&self, drain_timeout: Duration) -> DrainReport {
        let mut tasks = {
            let mut guard = self.lock_tasks();
            self.shutdown.trigger();
            std::mem::replace(&mut *guard, JoinSet::new())
        };
        let pending = tasks.len();

        info!(
            target: "delivery",
            in_flight = pending,
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "Draining delivery pipeline"
        );

        let mut report = DrainReport::default();
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(result) = tasks.join_next().await {
                log_join_failure(result);
                report.completed += 1;
            }
        })
        .await;

        if drained.is_err() {
            report.aborted = tasks.len();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            self.metrics.deliveries_aborted(report.aborted as u64);
            warn!(
                target: "delivery",
                aborted = report.aborted,
                "Drain timeout elapsed, aborted remaining deliveries"
            );
        }

        report
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        // The set stays consistent even if a holder panicked
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn log_join_failure(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(target: "delivery", error = %e, "Delivery task panicked");
        }
    }
}

/// Everything one delivery task owns
struct DeliveryJob {
    engine: Arc<RetryEngine>,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: Arc<BridgeMetrics>,
    shutdown_rx: ShutdownReceiver,
}

impl DeliveryJob {
    async fn run(mut self, request: IngestRequest) {
        let started = Instant::now();
        let outcome = self.engine.send(&request, &mut self.shutdown_rx).await;
        let elapsed = started.elapsed();

        match outcome {
            DeliveryOutcome::Delivered {
                attempts,
                device_id,
            } => {
                self.metrics.delivery_succeeded(elapsed);
                info!(
                    target: "delivery",
                    device_token = %request.device_token,
                    device_id = device_id.as_deref().unwrap_or("unknown"),
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Reading delivered"
                );
            }
            DeliveryOutcome::Failed { attempts, reason } => {
                if reason == FailureReason::Cancelled {
                    self.metrics.delivery_cancelled(elapsed);
                    warn!(
                        target: "delivery",
                        device_token = %request.device_token,
                        attempts,
                        "Delivery cancelled by shutdown"
                    );
                } else {
                    self.metrics.delivery_failed(elapsed);
                    error!(
                        target: "delivery",
                        device_token = %request.device_token,
                        attempts,
                        reason = %reason,
                        "Delivery failed, dropping reading"
                    );
                }

                self.metrics.dead_letter();
                self.dead_letters
                    .record(FailedDelivery::new(request, attempts, reason))
                    .await;
            }
        }
    }

    /// Dead-letter a reading that arrived after shutdown started
    async fn reject(self, request: IngestRequest) {
        self.metrics.delivery_cancelled(Duration::ZERO);
        warn!(
            target: "delivery",
            device_token = %request.device_token,
            "Reading arrived after shutdown, not delivering"
        );
        self.metrics.dead_letter();
        self.dead_letters
            .record(FailedDelivery::new(request, 0, FailureReason::Cancelled))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::dead_letter::ChannelDeadLetterSink;
    use crate::delivery::RetryPolicy;
    use crate::protocol::InboundMessage;
    use crate::processing::decode;
    use crate::testing::mocks::{MockIngestClient, MockResponse};

    fn reading(token: &str) -> DecodedReading {
        let topic = format!("iot/{token}/data");
        decode(&InboundMessage::new(topic, r#"{"temperature":25}"#, 1, false)).unwrap()
    }

    fn pipeline_with(
        client: Arc<MockIngestClient>,
    ) -> (
        DeliveryPipeline,
        Arc<BridgeMetrics>,
        tokio::sync::mpsc::Receiver<FailedDelivery>,
    ) {
        let metrics = Arc::new(BridgeMetrics::new());
        let engine = Arc::new(RetryEngine::new(
            client,
            RetryPolicy::default(),
            Arc::clone(&metrics),
        ));
        let (sink, rx) = ChannelDeadLetterSink::channel(16);
        (
            DeliveryPipeline::new(engine, Arc::new(sink), Arc::clone(&metrics)),
            metrics,
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_success() {
        let client = Arc::new(MockIngestClient::always(MockResponse::ok("device-id-123")));
        let (pipeline, metrics, _rx) = pipeline_with(Arc::clone(&client));

        pipeline.deliver(reading("dev-1"));
        let report = pipeline.shutdown(Duration::from_secs(1)).await;

        assert_eq!(report, DrainReport { completed: 1, aborted: 0 });
        assert_eq!(client.request_count().await, 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.delivery.succeeded, 1);
        assert_eq!(snapshot.delivery.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_is_dead_lettered() {
        let client = Arc::new(MockIngestClient::always(MockResponse::status(404)));
        let (pipeline, metrics, mut rx) = pipeline_with(Arc::clone(&client));

        pipeline.deliver(reading("dev-missing"));
        let failed = rx.recv().await.unwrap();

        assert_eq!(failed.request.device_token, "dev-missing");
        assert_eq!(failed.attempts, 1);
        assert!(matches!(failed.reason, FailureReason::Terminal { .. }));
        assert_eq!(metrics.snapshot().delivery.dead_letters, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_backoff() {
        let client = Arc::new(MockIngestClient::always(MockResponse::status(503)));
        let (pipeline, metrics, mut rx) = pipeline_with(Arc::clone(&client));

        pipeline.deliver(reading("dev-1"));
        // Let the first attempt fail and enter its backoff
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.request_count().await, 1);

        let report = pipeline.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report, DrainReport { completed: 1, aborted: 0 });

        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.reason, FailureReason::Cancelled);
        assert_eq!(failed.attempts, 1);
        assert_eq!(metrics.snapshot().delivery.cancelled, 1);
        assert_eq!(client.request_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_aborts_hung_delivery() {
        let client = Arc::new(MockIngestClient::always(MockResponse::hang()));
        let (pipeline, metrics, _rx) = pipeline_with(Arc::clone(&client));

        pipeline.deliver(reading("dev-1"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = pipeline.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report, DrainReport { completed: 0, aborted: 1 });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.delivery.cancelled, 1);
        assert_eq!(snapshot.delivery.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_after_shutdown_is_cancelled_without_attempt() {
        let client = Arc::new(MockIngestClient::always(MockResponse::ok("device-id-123")));
        let (pipeline, _metrics, mut rx) = pipeline_with(Arc::clone(&client));

        pipeline.shutdown(Duration::from_millis(10)).await;
        assert!(pipeline.is_shutting_down());

        pipeline.deliver(reading("dev-late"));
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.reason, FailureReason::Cancelled);
        assert_eq!(failed.attempts, 0);
        assert_eq!(client.request_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_drains_readings_accepted_before_it() {
        let client = Arc::new(MockIngestClient::always(MockResponse::ok("device-id-123")));
        let (pipeline, metrics, mut rx) = pipeline_with(Arc::clone(&client));

        for i in 0..200 {
            pipeline.deliver(reading(&format!("dev-{i}")));
        }
        let report = pipeline.shutdown(Duration::from_secs(5)).await;

        assert_eq!(report.aborted, 0);
        assert_eq!(client.request_count().await, 200);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.delivery.succeeded, 200);
        assert_eq!(snapshot.delivery.cancelled, 0);
        assert_eq!(snapshot.delivery.dead_letters, 0);
        assert!(rx.try_recv().is_err());
    }
}
