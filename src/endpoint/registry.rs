//! Device lookup used by the ingestion endpoint

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device registry unavailable: {0}")]
    Unavailable(String),
}

/// A paired device as the endpoint sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub device_token: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Active device holding `device_token`, if any
    async fn find_active_by_token(
        &self,
        device_token: &str,
    ) -> Result<Option<DeviceRecord>, RegistryError>;

    /// Record liveness for `device_id`
    async fn touch_last_seen(&self, device_id: &str, at: DateTime<Utc>)
        -> Result<(), RegistryError>;
}

/// Registry held in memory, keyed by device token
#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let devices = devices
            .into_iter()
            .map(|device| (device.device_token.clone(), device))
            .collect();
        Self {
            devices: RwLock::new(devices),
        }
    }

    pub async fn insert(&self, device: DeviceRecord) {
        self.devices
            .write()
            .await
            .insert(device.device_token.clone(), device);
    }

    pub async fn get(&self, device_token: &str) -> Option<DeviceRecord> {
        self.devices.read().await.get(device_token).cloned()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn find_active_by_token(
        &self,
        device_token: &str,
    ) -> Result<Option<DeviceRecord>, RegistryError> {
        Ok(self
            .devices
            .read()
            .await
            .get(device_token)
            .filter(|device| device.is_active)
            .cloned())
    }

    async fn touch_last_seen(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.values_mut().find(|device| device.id == device_id) {
            device.last_seen = Some(at);
        }
        Ok(())
    }
}
