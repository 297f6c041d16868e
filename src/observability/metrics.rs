//! Thread-safe bridge metrics
//!
//! One [`BridgeMetrics`] instance is created by the composition root and shared
//! via `Arc` with the broker loop, the router, the delivery pipeline and the
//! health server. Hot-path counters are atomics; delivery latencies sit behind
//! a mutex and are bounded.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Counters for every stage of the bridge
pub struct BridgeMetrics {
    // Inbound
    messages_received: AtomicU64,
    inbound_dropped: AtomicU64,
    discarded_invalid_topic: AtomicU64,
    discarded_invalid_payload: AtomicU64,

    // Delivery
    deliveries_started: AtomicU64,
    deliveries_succeeded: AtomicU64,
    deliveries_failed: AtomicU64,
    deliveries_cancelled: AtomicU64,
    deliveries_in_flight: AtomicU64,
    delivery_attempts: AtomicU64,
    retries_scheduled: AtomicU64,
    terminal_rejections: AtomicU64,
    dead_letters: AtomicU64,
    delivery_latencies: Mutex<Vec<u64>>, // milliseconds

    // Broker connection
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connections_lost: AtomicU64,
    reconnect_attempts: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    connection_start_time: AtomicU64,

    started_at: AtomicU64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            inbound_dropped: AtomicU64::new(0),
            discarded_invalid_topic: AtomicU64::new(0),
            discarded_invalid_payload: AtomicU64::new(0),
            deliveries_started: AtomicU64::new(0),
            deliveries_succeeded: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            deliveries_cancelled: AtomicU64::new(0),
            deliveries_in_flight: AtomicU64::new(0),
            delivery_attempts: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            terminal_rejections: AtomicU64::new(0),
            dead_letters: AtomicU64::new(0),
            delivery_latencies: Mutex::new(Vec::new()),
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    // Inbound
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn discarded_invalid_topic(&self) {
        self.discarded_invalid_topic.fetch_add(1, Ordering::Relaxed);
    }

    pub fn discarded_invalid_payload(&self) {
        self.discarded_invalid_payload
            .fetch_add(1, Ordering::Relaxed);
    }

    // Delivery
    pub fn delivery_started(&self) {
        self.deliveries_started.fetch_add(1, Ordering::Relaxed);
        self.deliveries_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_attempt(&self) {
        self.delivery_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn terminal_rejection(&self) {
        self.terminal_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_succeeded(&self, elapsed: Duration) {
        self.deliveries_succeeded.fetch_add(1, Ordering::Relaxed);
        self.finish_delivery(elapsed);
    }

    pub fn delivery_failed(&self, elapsed: Duration) {
        self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
        self.finish_delivery(elapsed);
    }

    pub fn delivery_cancelled(&self, elapsed: Duration) {
        self.deliveries_cancelled.fetch_add(1, Ordering::Relaxed);
        self.finish_delivery(elapsed);
    }

    /// Deliveries aborted at the end of a shutdown drain
    pub fn deliveries_aborted(&self, count: u64) {
        self.deliveries_cancelled.fetch_add(count, Ordering::Relaxed);
        let _ = self
            .deliveries_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(count))
            });
    }

    pub fn dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    fn finish_delivery(&self, elapsed: Duration) {
        // Saturating decrement; an aborted task may never report
        let _ = self
            .deliveries_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });

        if let Ok(mut latencies) = self.delivery_latencies.lock() {
            latencies.push(elapsed.as_millis() as u64);
            if latencies.len() > MAX_LATENCY_SAMPLES {
                latencies.remove(0);
            }
        }
    }

    // Broker connection
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        if self.mqtt_connected.swap(false, Ordering::Relaxed) {
            self.connections_lost.fetch_add(1, Ordering::Relaxed);
        }
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.deliveries_in_flight.load(Ordering::Relaxed)
    }

    fn latency_statistics(&self) -> (f64, f64, f64) {
        let Ok(latencies) = self.delivery_latencies.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if latencies.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95) = self.latency_statistics();
        let connection_start = self.connection_start_time.load(Ordering::Relaxed);

        MetricsSnapshot {
            inbound: InboundMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                dropped: self.inbound_dropped.load(Ordering::Relaxed),
                discarded_invalid_topic: self.discarded_invalid_topic.load(Ordering::Relaxed),
                discarded_invalid_payload: self.discarded_invalid_payload.load(Ordering::Relaxed),
            },
            delivery: DeliveryMetrics {
                started: self.deliveries_started.load(Ordering::Relaxed),
                succeeded: self.deliveries_succeeded.load(Ordering::Relaxed),
                failed: self.deliveries_failed.load(Ordering::Relaxed),
                cancelled: self.deliveries_cancelled.load(Ordering::Relaxed),
                in_flight: self.deliveries_in_flight.load(Ordering::Relaxed),
                attempts: self.delivery_attempts.load(Ordering::Relaxed),
                retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
                terminal_rejections: self.terminal_rejections.load(Ordering::Relaxed),
                dead_letters: self.dead_letters.load(Ordering::Relaxed),
                avg_latency_ms: avg,
                latency_p50_ms: p50,
                latency_p95_ms: p95,
            },
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                connection_duration_seconds: if connection_start == 0 {
                    0
                } else {
                    now.saturating_sub(connection_start)
                },
            },
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub inbound: InboundMetrics,
    pub delivery: DeliveryMetrics,
    pub mqtt: MqttMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundMetrics {
    pub messages_received: u64,
    pub dropped: u64,
    pub discarded_invalid_topic: u64,
    pub discarded_invalid_payload: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryMetrics {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub in_flight: u64,
    pub attempts: u64,
    pub retries_scheduled: u64,
    pub terminal_rejections: u64,
    pub dead_letters: u64,
    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connections_lost: u64,
    pub reconnect_attempts: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub connection_duration_seconds: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_data.len() - 1) as f64;
    let lower = sorted_data[index.floor() as usize] as f64;
    let upper = sorted_data[index.ceil() as usize] as f64;
    lower + (upper - lower) * index.fract()
}
