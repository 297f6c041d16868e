//! Composition root for the ingestion bridge
//!
//! [`Bridge`] wires the broker connection, the dispatcher, the delivery
//! pipeline and the health server together and owns their lifecycle.
//! Nothing here is global: every component is constructed in [`Bridge::start`]
//! and torn down in [`Bridge::stop`].

use crate::config::BridgeConfig;
use crate::delivery::{
    DeadLetterSink, DeliveryPipeline, DrainReport, HttpIngestClient, IngestClient,
    LoggingDeadLetterSink, RetryEngine,
};
use crate::devices::DevicePublisher;
use crate::error::{BridgeError, BridgeResult};
use crate::lifecycle_span;
use crate::observability::{BridgeMetrics, HealthServer};
use crate::processing::TopicRouter;
use crate::protocol::InboundMessage;
use crate::shutdown::ShutdownTrigger;
use crate::transport::mqtt::{ConnectionState, MqttClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// How long `stop()` waits for the dispatcher to drain its channel
const DISPATCHER_GRACE: Duration = Duration::from_secs(2);

/// Components that only exist while the bridge runs
struct RunningBridge {
    mqtt: MqttClient,
    pipeline: Arc<DeliveryPipeline>,
    dispatcher: JoinHandle<()>,
    health: Option<JoinHandle<()>>,
    health_shutdown: ShutdownTrigger,
}

pub struct Bridge {
    config: BridgeConfig,
    metrics: Arc<BridgeMetrics>,
    ingest_client: Arc<dyn IngestClient>,
    dead_letters: Arc<dyn DeadLetterSink>,
    running: Option<RunningBridge>,
}

impl Bridge {
    /// Bridge delivering over HTTP with dead letters logged
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        let client = HttpIngestClient::new(&config.ingest).map_err(BridgeError::HttpClient)?;
        Ok(Self::with_components(
            config,
            Arc::new(client),
            Arc::new(LoggingDeadLetterSink),
        ))
    }

    /// Bridge with an injected ingestion client and dead-letter sink
    pub fn with_components(
        config: BridgeConfig,
        ingest_client: Arc<dyn IngestClient>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            config,
            metrics: Arc::new(BridgeMetrics::new()),
            ingest_client,
            dead_letters,
            running: None,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.running
            .as_ref()
            .map(|running| running.mqtt.connection_state())
    }

    /// Publisher for dashboard to device updates over the live connection
    pub fn device_publisher(&self) -> BridgeResult<DevicePublisher> {
        let running = self.running.as_ref().ok_or(BridgeError::NotStarted)?;
        Ok(DevicePublisher::new(Arc::new(running.mqtt.publish_handle())))
    }

    /// Connect to the broker and start delivering readings.
    ///
    /// Fails if already running, if the retry policy is invalid or if the
    /// broker handshake fails; nothing is left running on failure.
    pub async fn start(&mut self) -> BridgeResult<()> {
        if self.running.is_some() {
            return Err(BridgeError::AlreadyStarted);
        }

        let span = lifecycle_span!(event = "start");
        async {
            let policy = self.config.retry.to_policy()?;
            info!(
                target: "bridge",
                broker = %self.config.mqtt.broker_url,
                endpoint = %self.config.ingest.endpoint_url(),
                max_retries = policy.max_retries(),
                "Starting ingestion bridge"
            );

            let engine = Arc::new(RetryEngine::new(
                Arc::clone(&self.ingest_client),
                policy,
                Arc::clone(&self.metrics),
            ));
            let pipeline = Arc::new(DeliveryPipeline::new(
                engine,
                Arc::clone(&self.dead_letters),
                Arc::clone(&self.metrics),
            ));

            let (tx, rx) = mpsc::channel(self.config.mqtt.channel_capacity);
            let dispatcher = spawn_dispatcher(
                rx,
                TopicRouter::new(Arc::clone(&self.metrics)),
                Arc::clone(&pipeline),
            );

            let mut mqtt = MqttClient::new(self.config.mqtt.clone(), Arc::clone(&self.metrics))?;
            if let Err(e) = mqtt.connect(tx).await {
                dispatcher.abort();
                return Err(e.into());
            }

            let health_shutdown = ShutdownTrigger::new();
            let health = self.config.health.enabled.then(|| {
                let server = Arc::new(HealthServer::new(
                    self.config.health.port,
                    Arc::clone(&self.metrics),
                    mqtt.state_receiver(),
                ));
                let shutdown_rx = health_shutdown.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = server.run(shutdown_rx).await {
                        error!(target: "bridge", error = %e, "Health server failed");
                    }
                })
            });

            self.running = Some(RunningBridge {
                mqtt,
                pipeline,
                dispatcher,
                health,
                health_shutdown,
            });
            info!(target: "bridge", "Ingestion bridge started");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Stop receiving, drain in-flight deliveries and shut everything down
    pub async fn stop(&mut self) -> BridgeResult<DrainReport> {
        let mut running = self.running.take().ok_or(BridgeError::NotStarted)?;
        let drain_timeout = self.config.shutdown.drain_timeout();

        async move {
            info!(target: "bridge", "Stopping ingestion bridge");

            // Closing the broker connection drops the inbound sender, which
            // lets the dispatcher finish whatever is still queued
            if let Err(e) = running.mqtt.disconnect().await {
                warn!(target: "bridge", error = %e, "Broker disconnect reported an error");
            }
            if tokio::time::timeout(DISPATCHER_GRACE, &mut running.dispatcher)
                .await
                .is_err()
            {
                warn!(target: "bridge", "Dispatcher did not drain in time, aborting");
                running.dispatcher.abort();
            }

            let report = running.pipeline.shutdown(drain_timeout).await;

            running.health_shutdown.trigger();
            if let Some(health) = running.health.take() {
                let _ = health.await;
            }

            info!(
                target: "bridge",
                completed = report.completed,
                aborted = report.aborted,
                "Ingestion bridge stopped"
            );
            Ok(report)
        }
        .instrument(lifecycle_span!(event = "stop"))
        .await
    }
}

/// Route every inbound message and hand decoded readings to the pipeline.
///
/// Ends when all senders of `inbound` are gone.
pub fn spawn_dispatcher(
    mut inbound: mpsc::Receiver<InboundMessage>,
    router: TopicRouter,
    pipeline: Arc<DeliveryPipeline>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            if let Some(reading) = router.route(&message) {
                pipeline.deliver(reading);
            }
        }
        info!(target: "bridge", "Dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockIngestClient, MockResponse};

    fn bridge() -> Bridge {
        let mut config = BridgeConfig::default();
        config.mqtt.broker_url = "mqtt://127.0.0.1:1".to_string();
        config.mqtt.connect_timeout_secs = 2;
        config.health.enabled = false;
        Bridge::with_components(
            config,
            Arc::new(MockIngestClient::always(MockResponse::ok("device-id-123"))),
            Arc::new(LoggingDeadLetterSink),
        )
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let mut bridge = bridge();
        assert!(matches!(bridge.stop().await, Err(BridgeError::NotStarted)));
        assert!(matches!(
            bridge.device_publisher(),
            Err(BridgeError::NotStarted)
        ));
        assert!(bridge.connection_state().is_none());
    }

    #[tokio::test]
    async fn test_start_fails_without_broker() {
        let mut bridge = bridge();
        let result = bridge.start().await;
        assert!(matches!(result, Err(BridgeError::Mqtt(_))));
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_policy() {
        let mut bridge = bridge();
        bridge.config.retry.max_retries = 0;
        assert!(matches!(bridge.start().await, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_new_builds_http_client() {
        let bridge = Bridge::new(BridgeConfig::default()).unwrap();
        assert!(!bridge.is_running());
        assert_eq!(bridge.metrics().snapshot().delivery.started, 0);
    }
}
