//! Configuration for the ingestion bridge
//!
//! Configuration is read from an optional TOML file and then overlaid with the
//! environment variables the dashboard deployment already uses
//! (`MQTT_BROKER_URL`, `INTERNAL_API_KEY`, `MQTT_RETRY_*`, ...). Every field has
//! a default, so an empty file or no file at all yields a runnable setup.

use crate::delivery::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Files tried, in order, when no config path is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["bridge.toml", "config/bridge.toml"];

/// Root bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub ingest: IngestSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, e.g. `mqtt://localhost:1883` or `mqtts://broker:8883`
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client IDs are `{prefix}-{epoch_ms}-{8 hex}`
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Bound on the initial connect + subscribe handshake
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Fixed interval between transport-level reconnect attempts
    #[serde(default = "default_reconnect_period_ms")]
    pub reconnect_period_ms: u64,
    #[serde(default = "default_subscription")]
    pub subscription: String,
    /// Capacity of the channel between the broker loop and the dispatcher
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            username: None,
            password: None,
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect_period_ms: default_reconnect_period_ms(),
            subscription: default_subscription(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Ingestion endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestSection {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_internal_api_key")]
    pub internal_api_key: String,
    /// Per-attempt HTTP timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            internal_api_key: default_internal_api_key(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl IngestSection {
    /// Full URL of the ingestion endpoint
    pub fn endpoint_url(&self) -> String {
        format!(
            "{}/api/internal/data",
            self.api_base_url.trim_end_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Delivery retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
    /// HTTP statuses that end a delivery without further attempts
    #[serde(default = "default_terminal_statuses")]
    pub terminal_statuses: Vec<u16>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
            terminal_statuses: default_terminal_statuses(),
        }
    }
}

impl RetrySection {
    /// Build the immutable retry policy described by this section
    pub fn to_policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.exponential_base,
        )
        .map(|policy| policy.with_terminal_statuses(self.terminal_statuses.clone()))
        .map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }
}

/// Health server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_health_port(),
        }
    }
}

/// Graceful shutdown settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShutdownSection {
    /// How long in-flight deliveries may finish before they are aborted
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ShutdownSection {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id_prefix() -> String {
    "iot-dashboard".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_reconnect_period_ms() -> u64 {
    5000
}

fn default_subscription() -> String {
    crate::protocol::TELEMETRY_SUBSCRIPTION.to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_api_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_internal_api_key() -> String {
    "dev-internal-key-change-in-production".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_terminal_statuses() -> Vec<u16> {
    vec![401, 403, 404]
}

fn default_true() -> bool {
    true
}

fn default_health_port() -> u16 {
    8080
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid value for environment variable {name}: '{value}'")]
    InvalidEnvVar { name: String, value: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.finish(&process_env())
    }

    /// Load `path`, or the first existing default config file, or fall back
    /// to defaults plus environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        match DEFAULT_CONFIG_PATHS
            .iter()
            .map(Path::new)
            .find(|candidate| candidate.is_file())
        {
            Some(found) => Self::load_from_file(found),
            None => Self::from_env(),
        }
    }

    /// Defaults overlaid with environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        BridgeConfig::default().finish(&process_env())
    }

    /// Parse TOML text and overlay the given environment, without touching the process env
    pub fn from_toml_with_env(
        content: &str,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.finish(env)
    }

    fn finish(mut self, env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        self.apply_env_overrides(env)?;
        self.validate()?;
        Ok(self)
    }

    /// Overlay recognised environment variables on top of file values
    pub fn apply_env_overrides(&mut self, env: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(url) = env.get("MQTT_BROKER_URL") {
            self.mqtt.broker_url = url.clone();
        }
        if let Some(username) = env.get("MQTT_USERNAME") {
            self.mqtt.username = Some(username.clone());
        }
        if let Some(password) = env.get("MQTT_PASSWORD") {
            self.mqtt.password = Some(password.clone());
        }
        if let Some(key) = env.get("INTERNAL_API_KEY") {
            self.ingest.internal_api_key = key.clone();
        }
        if let Some(base) = env.get("API_BASE_URL") {
            self.ingest.api_base_url = base.clone();
        }
        if let Some(value) = parse_env(env, "MQTT_RETRY_MAX_RETRIES")? {
            self.retry.max_retries = value;
        }
        if let Some(value) = parse_env(env, "MQTT_RETRY_BASE_DELAY")? {
            self.retry.base_delay_ms = value;
        }
        if let Some(value) = parse_env(env, "MQTT_RETRY_MAX_DELAY")? {
            self.retry.max_delay_ms = value;
        }
        if let Some(value) = parse_env(env, "MQTT_RETRY_EXPONENTIAL_BASE")? {
            self.retry.exponential_base = value;
        }
        if let Some(value) = parse_env(env, "HEALTH_PORT")? {
            self.health.port = value;
        }
        Ok(())
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_url(&self.mqtt.broker_url)?;
        validate_api_base_url(&self.ingest.api_base_url)?;

        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.reconnect_period_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.reconnect_period_ms must be greater than 0".to_string(),
            ));
        }
        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.ingest.internal_api_key.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "ingest.internal_api_key must not be empty".to_string(),
            ));
        }

        self.retry.to_policy()?;
        Ok(())
    }

    /// Copy of this configuration safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.mqtt.password.is_some() {
            copy.mqtt.password = Some("***".to_string());
        }
        copy.ingest.internal_api_key = "***".to_string();
        copy
    }
}

fn process_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

fn parse_env<T: std::str::FromStr>(
    env: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match env.get(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                name: name.to_string(),
                value: raw.clone(),
            }),
    }
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = Url::parse(broker_url)
        .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.broker_url '{broker_url}': {e}")))?;

    match url.scheme() {
        "mqtt" | "mqtts" | "tcp" | "ssl" => {}
        other => {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.broker_url scheme '{other}' is not one of mqtt, mqtts, tcp, ssl"
            )))
        }
    }

    if url.host_str().is_none() {
        return Err(ConfigError::InvalidConfig(format!(
            "mqtt.broker_url '{broker_url}' has no host"
        )));
    }
    Ok(())
}

fn validate_api_base_url(base: &str) -> Result<(), ConfigError> {
    let url = Url::parse(base)
        .map_err(|e| ConfigError::InvalidConfig(format!("ingest.api_base_url '{base}': {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidConfig(format!(
            "ingest.api_base_url '{base}' must use http or https"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_match_deployment() {
        let config = BridgeConfig::from_toml_with_env("", &HashMap::new()).unwrap();

        assert_eq!(config.mqtt.broker_url, "mqtt://localhost:1883");
        assert_eq!(config.mqtt.subscription, "iot/+/data");
        assert_eq!(config.mqtt.reconnect_period_ms, 5000);
        assert_eq!(config.mqtt.connect_timeout_secs, 30);
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert_eq!(config.ingest.api_base_url, "http://localhost:3000");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.retry.exponential_base, 2.0);
        assert_eq!(config.retry.terminal_statuses, vec![401, 403, 404]);
    }

    #[test]
    fn test_file_values() {
        let toml_content = r#"
[mqtt]
broker_url = "mqtts://broker.example.com:8883"
username = "bridge"
password = "hunter2"

[ingest]
api_base_url = "https://dashboard.example.com/"
internal_api_key = "prod-key"

[retry]
max_retries = 3
base_delay_ms = 250
terminal_statuses = []
"#;
        let config = BridgeConfig::from_toml_with_env(toml_content, &HashMap::new()).unwrap();

        assert_eq!(config.mqtt.username.as_deref(), Some("bridge"));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert!(config.retry.terminal_statuses.is_empty());
        assert_eq!(
            config.ingest.endpoint_url(),
            "https://dashboard.example.com/api/internal/data"
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let toml_content = r#"
[retry]
max_retries = 3
"#;
        let overrides = env(&[
            ("MQTT_BROKER_URL", "mqtt://10.0.0.5:1884"),
            ("INTERNAL_API_KEY", "from-env"),
            ("API_BASE_URL", "http://api:3000"),
            ("MQTT_RETRY_MAX_RETRIES", "7"),
            ("MQTT_RETRY_BASE_DELAY", "500"),
            ("MQTT_RETRY_MAX_DELAY", "10000"),
            ("MQTT_RETRY_EXPONENTIAL_BASE", "1.5"),
        ]);
        let config = BridgeConfig::from_toml_with_env(toml_content, &overrides).unwrap();

        assert_eq!(config.mqtt.broker_url, "mqtt://10.0.0.5:1884");
        assert_eq!(config.ingest.internal_api_key, "from-env");
        assert_eq!(config.ingest.api_base_url, "http://api:3000");
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert_eq!(config.retry.exponential_base, 1.5);
    }

    #[test]
    fn test_unparseable_env_is_an_error() {
        let result =
            BridgeConfig::from_toml_with_env("", &env(&[("MQTT_RETRY_MAX_RETRIES", "five")]));
        assert!(matches!(result, Err(ConfigError::InvalidEnvVar { .. })));
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let result = BridgeConfig::from_toml_with_env(
            "[retry]\nmax_retries = 0\n",
            &HashMap::new(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

        let result = BridgeConfig::from_toml_with_env(
            "[retry]\nbase_delay_ms = 5000\nmax_delay_ms = 1000\n",
            &HashMap::new(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

        let result = BridgeConfig::from_toml_with_env(
            "[retry]\nexponential_base = 0.5\n",
            &HashMap::new(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_urls_rejected() {
        let result = BridgeConfig::from_toml_with_env(
            "[mqtt]\nbroker_url = \"http://localhost:1883\"\n",
            &HashMap::new(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

        let result = BridgeConfig::from_toml_with_env(
            "[mqtt]\nbroker_url = \"not a url\"\n",
            &HashMap::new(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

        let result = BridgeConfig::from_toml_with_env(
            "[ingest]\napi_base_url = \"ftp://files\"\n",
            &HashMap::new(),
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = BridgeConfig::default();
        config.mqtt.password = Some("hunter2".to_string());

        let redacted = config.redacted();
        assert_eq!(redacted.mqtt.password.as_deref(), Some("***"));
        assert_eq!(redacted.ingest.internal_api_key, "***");

        let printed = toml::to_string_pretty(&redacted).unwrap();
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("dev-internal-key"));
    }
}
