//! Topic shapes for device telemetry and device-bound updates
//!
//! Devices publish readings on `iot/{deviceToken}/data`. The bridge subscribes
//! with a single-level wildcard and recovers the device token from the middle
//! segment. Updates flowing the other way are published beneath each device's
//! own MQTT topic.

use thiserror::Error;

/// Root segment of every device telemetry topic
pub const TELEMETRY_ROOT: &str = "iot";

/// Leaf segment of every device telemetry topic
pub const TELEMETRY_LEAF: &str = "data";

/// Wildcard filter capturing all device telemetry topics
pub const TELEMETRY_SUBSCRIPTION: &str = "iot/+/data";

/// Extract the device token from a telemetry topic.
///
/// The topic must have exactly three `/`-separated segments, the first being
/// `iot` and the last `data`. The token itself is opaque and is not validated
/// beyond being non-empty.
pub fn parse_device_topic(topic: &str) -> Result<&str, TopicError> {
    let segments: Vec<&str> = topic.split('/').collect();

    if segments.len() != 3 {
        return Err(TopicError::SegmentCount(segments.len()));
    }
    if segments[0] != TELEMETRY_ROOT {
        return Err(TopicError::UnexpectedRoot(segments[0].to_string()));
    }
    if segments[2] != TELEMETRY_LEAF {
        return Err(TopicError::UnexpectedLeaf(segments[2].to_string()));
    }
    if segments[1].is_empty() {
        return Err(TopicError::EmptyDeviceToken);
    }

    Ok(segments[1])
}

/// Build the telemetry topic a device publishes readings on: `iot/{token}/data`
pub fn build_telemetry_topic(device_token: &str) -> String {
    format!("{TELEMETRY_ROOT}/{device_token}/{TELEMETRY_LEAF}")
}

/// Build the widget update topic: `{device_topic}/widget/{widget_id}/update`
pub fn build_widget_update_topic(device_topic: &str, widget_id: &str) -> String {
    format!(
        "{}/widget/{}/update",
        device_topic.trim_end_matches('/'),
        widget_id
    )
}

/// Build the dashboard update topic: `{device_topic}/dashboard/{dashboard_id}`
pub fn build_dashboard_topic(device_topic: &str, dashboard_id: &str) -> String {
    format!(
        "{}/dashboard/{}",
        device_topic.trim_end_matches('/'),
        dashboard_id
    )
}

/// Reasons a topic is not a device telemetry topic
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("expected 3 topic segments, found {0}")]
    SegmentCount(usize),
    #[error("unexpected root segment '{0}', expected 'iot'")]
    UnexpectedRoot(String),
    #[error("unexpected leaf segment '{0}', expected 'data'")]
    UnexpectedLeaf(String),
    #[error("device token segment is empty")]
    EmptyDeviceToken,
}
