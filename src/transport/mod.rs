//! Broker transport
//!
//! The [`Publisher`] trait is the publish primitive used by device updates and
//! the simulator; [`mqtt::PublishHandle`] implements it against a live broker and
//! `testing::mocks::MockPublisher` records calls in tests.

pub mod mqtt;

use async_trait::async_trait;

/// Fire-and-forget publish onto the broker
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic` with QoS `0..=2`
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    ) -> Result<(), mqtt::MqttError>;
}
