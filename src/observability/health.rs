//! Health check HTTP server for container orchestration
//!
//! `/health` reports the broker connection and delivery state (503 when
//! degraded). `/ready` and `/live` answer readiness and liveness checks, and
//! `/metrics` returns the current [`MetricsSnapshot`](super::MetricsSnapshot)
//! as JSON.

use super::metrics::BridgeMetrics;
use crate::error::{BridgeError, BridgeResult};
use crate::shutdown::{wait_for_shutdown, ShutdownReceiver};
use crate::transport::mqtt::ConnectionState;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// HTTP health check server
pub struct HealthServer {
    port: u16,
    metrics: Arc<BridgeMetrics>,
    connection: watch::Receiver<ConnectionState>,
}

impl HealthServer {
    pub fn new(
        port: u16,
        metrics: Arc<BridgeMetrics>,
        connection: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            port,
            metrics,
            connection,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let health_server = Arc::clone(&self);
        let ready_server = Arc::clone(&self);
        let metrics_server = Arc::clone(&self);

        // GET /health - overall status with per-component checks
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = Arc::clone(&health_server);
            async move {
                let status = server.health_status();
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /ready - ready once the broker connection is up
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = Arc::clone(&ready_server);
            async move {
                let ready = server.connection.borrow().is_connected();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - the process is serving requests
        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        // GET /metrics - counter snapshot
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(move || {
            let server = Arc::clone(&metrics_server);
            async move { Ok::<_, Infallible>(warp::reply::json(&server.metrics.snapshot())) }
        });

        health_route
            .or(ready_route)
            .or(live_route)
            .or(metrics_route)
    }

    /// Serve until shutdown is signalled
    pub async fn run(self: Arc<Self>, shutdown_rx: ShutdownReceiver) -> BridgeResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let mut shutdown_rx = shutdown_rx;
        let routes = Arc::clone(&self).routes();

        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(addr, async move {
                wait_for_shutdown(&mut shutdown_rx).await;
            })
            .map_err(|e| BridgeError::Health(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(target: "bridge", address = %bound, "Health server listening");
        server.await;
        Ok(())
    }

    fn health_status(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert("mqtt".to_string(), self.check_mqtt());
        checks.insert("delivery".to_string(), self.check_delivery());

        let healthy = checks.values().all(|check| check.status == "healthy");
        let snapshot = self.metrics.snapshot();

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: snapshot.timestamp,
            uptime_seconds: snapshot.uptime_seconds,
            checks,
        }
    }

    fn check_mqtt(&self) -> HealthCheck {
        let state = self.connection.borrow().clone();
        let (status, message) = if state.is_connected() {
            ("healthy", "MQTT connection established".to_string())
        } else {
            ("unhealthy", format!("MQTT connection {}", state.label()))
        };

        HealthCheck {
            status: status.to_string(),
            message: Some(message),
            last_check: current_timestamp(),
        }
    }

    fn check_delivery(&self) -> HealthCheck {
        HealthCheck {
            status: "healthy".to_string(),
            message: Some(format!(
                "{} deliveries in flight",
                self.metrics.in_flight()
            )),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
