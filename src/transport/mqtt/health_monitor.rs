//! Pure connection state transitions and reconnect decisions
//!
//! The broker loop feeds [`ConnectionEvent`]s through
//! [`HealthMonitor::determine_next_state`]; every transition is logged here so
//! the I/O code never has to remember to.

use super::connection::{ConnectionState, DisconnectReason, ReconnectConfig};
use std::time::Duration;
use tracing::{error, info, warn};

/// Pure state machine for the broker connection
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to reconnect after the connection dropped
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts.saturating_add(1),
            delay: config.period,
        }
    }

    /// Next state for an event, logging the transition
    pub fn determine_next_state(
        current_state: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        let next = match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected(DisconnectReason::Lost(
                    "Broker disconnected".to_string(),
                ))
            }
            ConnectionEvent::NetworkError(error) => {
                ConnectionState::Disconnected(DisconnectReason::Lost(error))
            }
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::ShutdownRequested => {
                ConnectionState::Disconnected(DisconnectReason::Shutdown)
            }
        };

        Self::log_state_transition(current_state, &next);
        next
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    /// Log a connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(target: "mqtt_transport", state = "connected", "Broker connection established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(target: "mqtt_transport", state = "connected", attempt, "Reconnection successful");
            }
            (_, ConnectionState::Disconnected(DisconnectReason::Lost(reason))) => {
                warn!(target: "mqtt_transport", state = "disconnected", reason = %reason, "Broker connection lost");
            }
            (_, ConnectionState::Disconnected(DisconnectReason::Shutdown)) => {
                info!(target: "mqtt_transport", state = "disconnected", "Broker connection closed by shutdown");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(target: "mqtt_transport", state = "reconnecting", attempt, "Starting reconnection attempt");
            }
            (_, ConnectionState::Connecting) => {
                info!(target: "mqtt_transport", state = "connecting", "Connecting to broker");
            }
            _ => {
                info!(target: "mqtt_transport", "Connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Log a connection error without changing state
    pub fn log_connection_error(error: &str) {
        error!(target: "mqtt_transport", error = %crate::error::sanitize_message(error), "Broker connection error");
    }

    pub fn validate_reconnect_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.period == Duration::ZERO {
            return Err("reconnect period must be greater than 0".to_string());
        }
        if config.connect_timeout == Duration::ZERO {
            return Err("connect timeout must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectStarted,
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    ShutdownRequested,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let state = ConnectionState::Disconnected(DisconnectReason::NotStarted);

        let state = HealthMonitor::determine_next_state(&state, ConnectionEvent::ConnectStarted);
        assert_eq!(state, ConnectionState::Connecting);

        let state = HealthMonitor::determine_next_state(&state, ConnectionEvent::ConnAckReceived);
        assert_eq!(state, ConnectionState::Connected);

        let state = HealthMonitor::determine_next_state(
            &state,
            ConnectionEvent::NetworkError("connection refused".to_string()),
        );
        assert_eq!(
            state,
            ConnectionState::Disconnected(DisconnectReason::Lost("connection refused".to_string()))
        );

        let state =
            HealthMonitor::determine_next_state(&state, ConnectionEvent::ReconnectionStarted(1));
        assert_eq!(state, ConnectionState::Reconnecting(1));

        let state = HealthMonitor::determine_next_state(&state, ConnectionEvent::ConnAckReceived);
        assert_eq!(state, ConnectionState::Connected);

        let state = HealthMonitor::determine_next_state(&state, ConnectionEvent::ShutdownRequested);
        assert_eq!(
            state,
            ConnectionState::Disconnected(DisconnectReason::Shutdown)
        );
    }

    #[test]
    fn test_broker_disconnect_is_lost() {
        let state = HealthMonitor::determine_next_state(
            &ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker,
        );
        assert!(matches!(
            state,
            ConnectionState::Disconnected(DisconnectReason::Lost(_))
        ));
    }

    #[test]
    fn test_reconnection_uses_fixed_period() {
        let config = ReconnectConfig::default();

        for attempts in [0, 1, 10, 100] {
            assert_eq!(
                HealthMonitor::should_attempt_reconnection(attempts, &config, false),
                ReconnectionDecision::Proceed {
                    attempt: attempts + 1,
                    delay: Duration::from_millis(5000),
                }
            );
        }
    }

    #[test]
    fn test_reconnection_aborts_on_shutdown() {
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, &ReconnectConfig::default(), true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_can_publish_only_when_connected() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Disconnected(
            DisconnectReason::NotStarted
        )));
    }

    #[test]
    fn test_validate_reconnect_config() {
        assert!(HealthMonitor::validate_reconnect_config(&ReconnectConfig::default()).is_ok());

        let zero = ReconnectConfig {
            period: Duration::ZERO,
            ..ReconnectConfig::default()
        };
        assert!(HealthMonitor::validate_reconnect_config(&zero).is_err());
    }
}
