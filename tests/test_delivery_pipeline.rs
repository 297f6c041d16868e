//! End-to-end delivery from inbound publish to HTTP POST
//!
//! Wires the dispatcher, topic router, delivery pipeline and the reqwest
//! client against a wiremock ingestion endpoint.

mod test_helpers;

use iot_ingest_bridge::bridge::spawn_dispatcher;
use iot_ingest_bridge::delivery::{
    ChannelDeadLetterSink, DeliveryPipeline, FailedDelivery, FailureReason, HttpIngestClient,
    RetryEngine, API_KEY_HEADER,
};
use iot_ingest_bridge::observability::BridgeMetrics;
use iot_ingest_bridge::processing::TopicRouter;
use iot_ingest_bridge::protocol::InboundMessage;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{fast_policy, telemetry, API_KEY, DEVICE_TOKEN, OTHER_DEVICE_TOKEN};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    inbound: mpsc::Sender<InboundMessage>,
    dispatcher: JoinHandle<()>,
    pipeline: Arc<DeliveryPipeline>,
    metrics: Arc<BridgeMetrics>,
    dead_letters: mpsc::Receiver<FailedDelivery>,
}

impl Harness {
    fn new(server: &MockServer) -> Self {
        let metrics = Arc::new(BridgeMetrics::new());
        let client = HttpIngestClient::with_base_url(&server.uri(), API_KEY, Duration::from_secs(2))
            .unwrap();
        let engine = Arc::new(RetryEngine::new(
            Arc::new(client),
            fast_policy(),
            Arc::clone(&metrics),
        ));
        let (sink, dead_letters) = ChannelDeadLetterSink::channel(16);
        let pipeline = Arc::new(DeliveryPipeline::new(
            engine,
            Arc::new(sink),
            Arc::clone(&metrics),
        ));

        let (inbound, rx) = mpsc::channel(64);
        let dispatcher = spawn_dispatcher(
            rx,
            TopicRouter::new(Arc::clone(&metrics)),
            Arc::clone(&pipeline),
        );

        Self {
            inbound,
            dispatcher,
            pipeline,
            metrics,
            dead_letters,
        }
    }

    async fn publish(&self, message: InboundMessage) {
        self.metrics.message_received();
        self.inbound.send(message).await.unwrap();
    }

    /// Wait until `finished` deliveries reached a terminal outcome
    async fn wait_for_finished(&self, finished: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = self.metrics.snapshot();
                if snapshot.delivery.succeeded + snapshot.delivery.failed >= finished {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("deliveries did not finish in time");
    }

    async fn close(self) -> mpsc::Receiver<FailedDelivery> {
        drop(self.inbound);
        self.dispatcher.await.unwrap();
        self.pipeline.shutdown(Duration::from_secs(5)).await;
        self.dead_letters
    }
}

async fn bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

fn accepted() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "message": "Data ingested successfully",
        "deviceId": "device-id-123",
        "timestamp": "2024-05-01T12:30:00.100Z"
    }))
}

#[tokio::test]
async fn test_reading_is_posted_with_canonical_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/internal/data"))
        .and(header(API_KEY_HEADER, API_KEY))
        .respond_with(accepted())
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    harness
        .publish(telemetry(DEVICE_TOKEN, json!({"temperature": 25, "humidity": 60})))
        .await;
    harness.wait_for_finished(1).await;
    assert_eq!(harness.metrics.snapshot().delivery.succeeded, 1);
    harness.close().await;

    let bodies = bodies(&server).await;
    let body = &bodies[0];
    assert_eq!(body["deviceToken"], DEVICE_TOKEN);
    assert_eq!(body["topic"], format!("iot/{DEVICE_TOKEN}/data"));
    assert_eq!(body["data"], json!({"temperature": 25, "humidity": 60}));
    assert_eq!(body["metadata"]["qos"], 1);
    assert_eq!(body["metadata"]["retain"], false);
    assert!(body["metadata"]["messageId"]
        .as_str()
        .unwrap()
        .starts_with("mqtt-"));

    let timestamp = body["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    assert!(timestamp.ends_with('Z'));
}

#[tokio::test]
async fn test_malformed_input_never_reaches_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(accepted())
        .expect(0)
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    harness
        .publish(InboundMessage::new(
            format!("iot/{DEVICE_TOKEN}/status"),
            r#"{"temperature": 25}"#,
            1,
            false,
        ))
        .await;
    harness
        .publish(InboundMessage::new(
            "iot//data",
            r#"{"temperature": 25}"#,
            0,
            false,
        ))
        .await;
    harness
        .publish(InboundMessage::new(
            format!("iot/{DEVICE_TOKEN}/data"),
            "not json",
            1,
            false,
        ))
        .await;

    let metrics = Arc::clone(&harness.metrics);
    harness.close().await;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.inbound.messages_received, 3);
    assert_eq!(snapshot.inbound.discarded_invalid_topic, 2);
    assert_eq!(snapshot.inbound.discarded_invalid_payload, 1);
    assert_eq!(snapshot.delivery.started, 0);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(accepted())
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    harness.publish(telemetry(DEVICE_TOKEN, json!({"price": 101.5}))).await;
    harness.wait_for_finished(1).await;

    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.delivery.succeeded, 1);
    assert_eq!(snapshot.delivery.attempts, 3);
    assert_eq!(snapshot.delivery.retries_scheduled, 2);
    harness.close().await;

    // Every attempt carries the same body
    let bodies = bodies(&server).await;
    assert_eq!(bodies.len(), 3);
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_failing_device_does_not_block_others() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"deviceToken": DEVICE_TOKEN})))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"deviceToken": OTHER_DEVICE_TOKEN})))
        .respond_with(accepted())
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    harness.publish(telemetry(DEVICE_TOKEN, json!({"v": 1}))).await;
    harness.publish(telemetry(OTHER_DEVICE_TOKEN, json!({"v": 2}))).await;
    harness.wait_for_finished(2).await;

    let snapshot = harness.metrics.snapshot();
    assert_eq!(snapshot.delivery.succeeded, 1);
    assert_eq!(snapshot.delivery.failed, 1);
    assert_eq!(snapshot.delivery.dead_letters, 1);

    let mut dead_letters = harness.close().await;
    let failed = dead_letters.recv().await.unwrap();
    assert_eq!(failed.request.device_token, DEVICE_TOKEN);
    assert_eq!(failed.attempts, 5);
    assert!(matches!(failed.reason, FailureReason::Exhausted { .. }));
}

#[tokio::test]
async fn test_unknown_device_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"error": "Device not found or inactive"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    harness.publish(telemetry(DEVICE_TOKEN, json!({"temperature": 25}))).await;
    harness.wait_for_finished(1).await;

    let mut dead_letters = harness.close().await;
    let failed = dead_letters.recv().await.unwrap();
    assert_eq!(failed.attempts, 1);
    match failed.reason {
        FailureReason::Terminal { error } => {
            assert_eq!(error.status(), Some(404));
            assert!(error.to_string().contains("Device not found"));
        }
        other => panic!("expected terminal failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_publishes_are_delivered_twice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(accepted())
        .expect(2)
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    let payload = json!({"temperature": 25});
    harness.publish(telemetry(DEVICE_TOKEN, payload.clone())).await;
    harness.publish(telemetry(DEVICE_TOKEN, payload)).await;
    harness.wait_for_finished(2).await;
    harness.close().await;

    let bodies = bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["data"], bodies[1]["data"]);
    assert_ne!(bodies[0]["metadata"]["messageId"], bodies[1]["metadata"]["messageId"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_delivers_every_queued_reading() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/internal/data"))
        .respond_with(accepted())
        .mount(&server)
        .await;

    let harness = Harness::new(&server);
    let metrics = Arc::clone(&harness.metrics);
    for i in 0..200 {
        harness
            .publish(telemetry(DEVICE_TOKEN, json!({"sequence": i})))
            .await;
    }

    // Same order as stopping the bridge: close inbound, drain dispatcher, then the pipeline
    let mut dead_letters = harness.close().await;

    assert_eq!(bodies(&server).await.len(), 200);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.delivery.succeeded, 200);
    assert_eq!(snapshot.delivery.cancelled, 0);
    assert!(dead_letters.try_recv().is_err());
}
