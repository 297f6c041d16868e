//! Observability for the ingestion bridge
//!
//! Structured logging, in-process counters and the health check HTTP server.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{BridgeMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{delivery_span, lifecycle_span, mqtt_span};
