//! Shared-secret authentication for internal callers

use tracing::warn;

/// Outcome of checking the `X-Internal-API-Key` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Authorized,
    /// 401
    MissingKey,
    /// 403
    InvalidKey,
}

impl AuthDecision {
    pub fn status(&self) -> u16 {
        match self {
            AuthDecision::Authorized => 200,
            AuthDecision::MissingKey => 401,
            AuthDecision::InvalidKey => 403,
        }
    }

    pub fn error_message(&self) -> Option<&'static str> {
        match self {
            AuthDecision::Authorized => None,
            AuthDecision::MissingKey => Some("Missing X-Internal-API-Key header"),
            AuthDecision::InvalidKey => Some("Invalid API key"),
        }
    }
}

#[derive(Clone)]
pub struct InternalAuth {
    expected_key: String,
}

impl InternalAuth {
    pub fn new(expected_key: impl Into<String>) -> Self {
        Self {
            expected_key: expected_key.into(),
        }
    }

    pub fn check(&self, provided: Option<&str>, peer: Option<&str>) -> AuthDecision {
        let Some(provided) = provided.filter(|key| !key.is_empty()) else {
            return AuthDecision::MissingKey;
        };

        if !constant_time_eq(provided.as_bytes(), self.expected_key.as_bytes()) {
            warn!(
                target: "ingest_endpoint",
                provided_key = %mask_key(provided),
                peer = peer.unwrap_or("unknown"),
                "Invalid internal API key attempt"
            );
            return AuthDecision::InvalidKey;
        }

        AuthDecision::Authorized
    }
}

impl std::fmt::Debug for InternalAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalAuth")
            .field("expected_key", &mask_key(&self.expected_key))
            .finish()
    }
}

/// First four characters followed by `***`
pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{prefix}***")
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_decisions() {
        let auth = InternalAuth::new("secret-key");
        assert_eq!(auth.check(Some("secret-key"), None), AuthDecision::Authorized);
        assert_eq!(auth.check(None, None), AuthDecision::MissingKey);
        assert_eq!(auth.check(Some(""), None), AuthDecision::MissingKey);
        assert_eq!(
            auth.check(Some("secret-kez"), Some("10.0.0.1")),
            AuthDecision::InvalidKey
        );
        assert_eq!(auth.check(Some("secret"), None), AuthDecision::InvalidKey);
    }

    #[test]
    fn test_status_and_messages() {
        assert_eq!(AuthDecision::MissingKey.status(), 401);
        assert_eq!(AuthDecision::InvalidKey.status(), 403);
        assert_eq!(
            AuthDecision::MissingKey.error_message(),
            Some("Missing X-Internal-API-Key header")
        );
        assert_eq!(AuthDecision::Authorized.error_message(), None);
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("dev-internal-key"), "dev-***");
        assert_eq!(mask_key("ab"), "ab***");
    }

    #[test]
    fn test_debug_hides_key() {
        let rendered = format!("{:?}", InternalAuth::new("super-secret"));
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("supe***"));
    }
}
