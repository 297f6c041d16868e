//! Broker connection manager
//!
//! Split the way the rest of the crate splits I/O from decisions:
//!
//! - [`connection`] - states, reconnect policy, broker options
//! - [`message_handler`] - pure routing of rumqttc events
//! - [`health_monitor`] - pure state transitions and reconnect decisions
//! - [`client`] - the event loop task, subscribe/publish and shutdown
//!
//! # Usage
//!
//! ```rust,no_run
//! use iot_ingest_bridge::config::MqttSection;
//! use iot_ingest_bridge::observability::BridgeMetrics;
//! use iot_ingest_bridge::transport::mqtt::MqttClient;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let (tx, mut rx) = tokio::sync::mpsc::channel(1024);
//! let mut client = MqttClient::new(MqttSection::default(), Arc::new(BridgeMetrics::new()))?;
//! client.connect(tx).await?;
//! while let Some(message) = rx.recv().await {
//!     println!("{} -> {} bytes", message.topic, message.payload.len());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{MqttClient, PublishHandle};
pub use connection::{ConnectionState, DisconnectReason, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
