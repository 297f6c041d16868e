//! Dashboard to device fan-out
//!
//! Pushes widget and dashboard updates to paired devices through the broker
//! publish primitive. Every update is QoS 1 and retained so a device that
//! reconnects picks up the latest state.

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::topics::{build_dashboard_topic, build_widget_update_topic};
use crate::protocol::DeviceUpdate;
use crate::transport::Publisher;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

const UPDATE_QOS: u8 = 1;
const UPDATE_RETAIN: bool = true;

/// Hardware class of a paired device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    /// Small display; receives the compact `{v, c, t}` shape
    Esp32Display,
    RaspberryPi,
    #[serde(other)]
    Other,
}

impl From<&str> for DeviceType {
    fn from(value: &str) -> Self {
        match value {
            "ESP32_DISPLAY" => DeviceType::Esp32Display,
            "RASPBERRY_PI" => DeviceType::RaspberryPi,
            _ => DeviceType::Other,
        }
    }
}

/// Where and how to reach one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub mqtt_topic: String,
    pub device_type: DeviceType,
    pub is_active: bool,
}

/// Shape `data` for the receiving hardware.
///
/// Compact devices get `v` (first of `value`, `price`, `temperature`), `c`
/// (first of `change`, `changePercent`) and `t` (`timestamp`). Keys with no
/// source value are left out. Other devices receive `data` unchanged.
pub fn format_for_device(data: &Value, device_type: &DeviceType) -> Value {
    match device_type {
        DeviceType::Esp32Display => {
            let mut compact = Map::new();
            if let Some(v) = first_present(data, &["value", "price", "temperature"]) {
                compact.insert("v".to_string(), v);
            }
            if let Some(c) = first_present(data, &["change", "changePercent"]) {
                compact.insert("c".to_string(), c);
            }
            if let Some(t) = first_present(data, &["timestamp"]) {
                compact.insert("t".to_string(), t);
            }
            Value::Object(compact)
        }
        DeviceType::RaspberryPi | DeviceType::Other => data.clone(),
    }
}

fn first_present(data: &Value, keys: &[&str]) -> Option<Value> {
    keys.iter()
        .filter_map(|key| data.get(*key))
        .find(|value| !value.is_null())
        .cloned()
}

pub struct DevicePublisher {
    publisher: Arc<dyn Publisher>,
}

impl DevicePublisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Push a widget update to one device. Inactive devices are an error.
    pub async fn publish_widget_update(
        &self,
        device: &DeviceTarget,
        widget_id: &str,
        data: &Value,
    ) -> BridgeResult<()> {
        if !device.is_active {
            return Err(BridgeError::device_update("Device not found or inactive"));
        }

        let topic = build_widget_update_topic(&device.mqtt_topic, widget_id);
        let update = DeviceUpdate {
            timestamp: Utc::now().timestamp_millis(),
            widget: Some(widget_id.to_string()),
            data: format_for_device(data, &device.device_type),
        };
        self.send(&topic, &update).await
    }

    /// Push a dashboard update to every active device; returns how many were
    /// published to.
    pub async fn publish_dashboard_update(
        &self,
        devices: &[DeviceTarget],
        dashboard_id: &str,
        data: &Value,
    ) -> BridgeResult<usize> {
        let mut published = 0;
        for device in devices.iter().filter(|device| device.is_active) {
            let topic = build_dashboard_topic(&device.mqtt_topic, dashboard_id);
            let update = DeviceUpdate {
                timestamp: Utc::now().timestamp_millis(),
                widget: None,
                data: data.clone(),
            };

            // One unreachable device does not stop the fan-out
            match self.send(&topic, &update).await {
                Ok(()) => published += 1,
                Err(e) => warn!(
                    target: "mqtt_transport",
                    topic = %topic,
                    error = %e,
                    "Dashboard update not published"
                ),
            }
        }
        Ok(published)
    }

    async fn send(&self, topic: &str, update: &DeviceUpdate) -> BridgeResult<()> {
        let payload = serde_json::to_vec(update)
            .map_err(|e| BridgeError::device_update(format!("Failed to serialize update: {e}")))?;

        self.publisher
            .publish(topic, payload, UPDATE_QOS, UPDATE_RETAIN)
            .await?;
        debug!(target: "mqtt_transport", topic = %topic, "Device update published");
        Ok(())
    }
}
