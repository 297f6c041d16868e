//! JSON-schema validation of ingestion request bodies

use super::EndpointError;
use crate::protocol::ValidationDetail;
use chrono::DateTime;
use once_cell::sync::Lazy;
use serde_json::{json, Value};

static INGEST_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["deviceToken", "topic", "data"],
        "properties": {
            "deviceToken": {
                "type": "string",
                "pattern": "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
            },
            "topic": { "type": "string", "minLength": 1 },
            "data": { "type": "object", "minProperties": 1 },
            "timestamp": { "type": "string" },
            "metadata": {
                "type": "object",
                "properties": {
                    "qos": { "type": "number", "minimum": 0, "maximum": 2 },
                    "retain": { "type": "boolean" },
                    "messageId": { "type": "string" }
                }
            }
        }
    })
});

pub struct IngestValidator {
    validator: jsonschema::Validator,
}

impl IngestValidator {
    pub fn new() -> Result<Self, EndpointError> {
        let validator = jsonschema::validator_for(&INGEST_SCHEMA)
            .map_err(|e| EndpointError::Schema(e.to_string()))?;
        Ok(Self { validator })
    }

    /// Every violation in `body`; empty when the body is acceptable
    pub fn validate(&self, body: &Value) -> Vec<ValidationDetail> {
        let mut details: Vec<ValidationDetail> = match self.validator.validate(body) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| ValidationDetail {
                    path: e.instance_path.to_string(),
                    message: e.to_string(),
                })
                .collect(),
        };

        // Timestamps are checked here so RFC 3339 is enforced regardless of
        // the validator's format settings
        if let Some(timestamp) = body.get("timestamp").and_then(Value::as_str) {
            if DateTime::parse_from_rfc3339(timestamp).is_err() {
                details.push(ValidationDetail {
                    path: "/timestamp".to_string(),
                    message: format!("\"{timestamp}\" is not a valid RFC 3339 date-time"),
                });
            }
        }

        details
    }
}
