//! Pure connection state management for the broker connection
//!
//! Connection states, the fixed-interval reconnect policy, broker option
//! construction and the transport error type.

use crate::config::MqttSection;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Why the connection is currently down
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// `connect()` has not been called yet
    NotStarted,
    /// Network error or broker-initiated disconnect; reconnect follows
    Lost(String),
    /// Explicit shutdown; no reconnect
    Shutdown,
}

/// Lifecycle state of the broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected(DisconnectReason),
    /// Handshake in flight
    Connecting,
    /// ConnAck received and wildcard subscription requested
    Connected,
    /// Waiting out the reconnect period (attempt count since last ConnAck)
    Reconnecting(u32),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Short label for health output and logs
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting(_) => "reconnecting",
        }
    }
}

/// Transport-level reconnect policy: a fixed interval, unlimited attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub period: Duration,
    /// Bound on the initial handshake (ConnAck + SubAck)
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(5000),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    pub fn from_section(config: &MqttSection) -> Self {
        Self {
            period: Duration::from_millis(config.reconnect_period_ms),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

/// Broker transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription to {topic} rejected: {reason}")]
    SubscriptionRejected { topic: String, reason: String },
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Split a broker URL into host, port and whether TLS is required
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16, bool), MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = matches!(url.scheme(), "mqtts" | "ssl");
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok((host, port, tls))
}

/// Client identifier: `{prefix}-{epoch_ms}-{8 hex}`
pub fn build_client_id(prefix: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{millis}-{}", &nonce[..8])
}

/// Build broker options from configuration
pub fn configure_mqtt_options(config: &MqttSection) -> Result<MqttOptions, MqttError> {
    let (host, port, tls) = parse_broker_url(&config.broker_url)?;

    let mut mqtt_options = MqttOptions::new(build_client_id(&config.client_id_prefix), host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    // Subscriptions are re-issued after every ConnAck
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}
