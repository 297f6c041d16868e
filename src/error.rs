//! Error types for the ingestion bridge
//!
//! Each layer owns a focused error enum (`MqttError`, `DecodeError`,
//! `SendError`, `ConfigError`, `EndpointError`); this module ties them together
//! into [`BridgeError`] for the composition root and provides the sanitizer
//! applied to anything that may echo device input or credentials into logs.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length of a sanitized message, including the truncation marker
pub const MAX_SANITIZED_LEN: usize = 500;

/// Maximum number of payload characters echoed into a log entry
pub const PAYLOAD_PREVIEW_CHARS: usize = 100;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(password|token|key|secret)("?\s*[=:]\s*"?)[^\s",}]+"#)
        .expect("secret pattern is a valid regex")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("sensitive path pattern is a valid regex")
});

/// Top-level error for starting, running and stopping the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("MQTT transport error: {0}")]
    Mqtt(#[from] crate::transport::mqtt::MqttError),

    #[error("Ingestion endpoint error: {0}")]
    Endpoint(#[from] crate::endpoint::EndpointError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("Device update rejected: {message}")]
    DeviceUpdate { message: String },

    #[error("Health server error: {0}")]
    Health(String),

    #[error("Bridge already started")]
    AlreadyStarted,

    #[error("Bridge not started")]
    NotStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a device update error
    pub fn device_update<S: Into<String>>(message: S) -> Self {
        Self::DeviceUpdate {
            message: message.into(),
        }
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Redact credential-looking fragments and bound the length of a message
pub fn sanitize_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}${2}***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_SANITIZED_LEN {
        let suffix = "...[truncated]";
        let cut = floor_char_boundary(&sanitized, MAX_SANITIZED_LEN - suffix.len());
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Bounded, sanitized preview of a raw payload for log entries
pub fn payload_preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    let preview: String = text.chars().take(PAYLOAD_PREVIEW_CHARS).collect();
    sanitize_message(&preview)
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut cut = index.min(s.len());
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}
