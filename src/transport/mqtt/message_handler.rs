//! Pure routing of broker events
//!
//! Turns rumqttc events into [`EventRoute`] decisions and converts between
//! numeric QoS levels and rumqttc's `QoS`.

use super::connection::MqttError;
use crate::protocol::InboundMessage;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::{mqttbytes::QoS, Event};
use tokio::sync::mpsc;
use tracing::warn;

/// Pure message routing decisions based on broker events
pub struct MessageHandler;

impl MessageHandler {
    /// Route a broker event to the appropriate handling branch
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage::new(
                    String::from_utf8_lossy(&publish.topic).to_string(),
                    publish.payload.clone(),
                    Self::qos_to_level(publish.qos),
                    publish.retain,
                )),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: Self::validate_subscription_success(&suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    pub fn qos_to_level(qos: QoS) -> u8 {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    pub fn level_to_qos(level: u8) -> Result<QoS, MqttError> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::InvalidQos(other)),
        }
    }

    /// Ok with the granted QoS levels, or the rejection codes
    pub fn validate_subscription_success(
        return_codes: &[SubscribeReasonCode],
    ) -> Result<Vec<u8>, String> {
        let mut granted = Vec::with_capacity(return_codes.len());
        for code in return_codes {
            match code {
                SubscribeReasonCode::Success(qos) => granted.push(Self::qos_to_level(*qos)),
                _ => return Err(format!("Subscription failed with reason codes: {return_codes:?}")),
            }
        }
        Ok(granted)
    }
}

/// Routing decisions for broker events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived(InboundMessage),
    Disconnected,
    SubscriptionConfirmed {
        packet_id: u16,
        granted: Result<Vec<u8>, String>,
    },
    /// PingResp, PubAck and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Hands received publishes to the dispatcher without blocking the broker loop
pub struct MessageForwarder {
    sender: mpsc::Sender<InboundMessage>,
}

impl MessageForwarder {
    pub fn new(sender: mpsc::Sender<InboundMessage>) -> Self {
        Self { sender }
    }

    /// Queue a message; a full or closed channel drops it with a warning
    pub fn forward(&self, message: InboundMessage) -> Result<(), String> {
        self.sender.try_send(message).map_err(|e| {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "dispatcher queue full",
                mpsc::error::TrySendError::Closed(_) => "dispatcher stopped",
            };
            warn!(target: "mqtt_transport", reason, "Dropping inbound message");
            reason.to_string()
        })
    }
}
