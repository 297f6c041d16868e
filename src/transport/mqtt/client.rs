//! Impure I/O for the broker connection
//!
//! [`MqttClient`] owns the rumqttc client and spawns one supervisor task that
//! drives the event loop: it tracks connection state, re-issues the wildcard
//! subscription after every ConnAck, forwards publishes to the dispatcher and
//! waits out the fixed reconnect period after a connection error.

use super::connection::{
    configure_mqtt_options, ConnectionState, DisconnectReason, MqttError, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::error::sanitize_message;
use crate::mqtt_span;
use crate::observability::BridgeMetrics;
use crate::protocol::InboundMessage;
use crate::shutdown::{interruptible_sleep, ShutdownReceiver, ShutdownTrigger};
use crate::transport::Publisher;
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, ConnectionError, Event, EventLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of rumqttc's request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `disconnect()` waits for the supervisor before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long the supervisor keeps polling to flush DISCONNECT on shutdown
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

type HandshakeSender = oneshot::Sender<Result<(), MqttError>>;

/// The single persistent broker connection
pub struct MqttClient {
    config: MqttSection,
    client: AsyncClient,
    event_loop: Option<EventLoop>,
    reconnect_config: ReconnectConfig,
    metrics: Arc<BridgeMetrics>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown: ShutdownTrigger,
    event_loop_handle: Option<JoinHandle<()>>,
}

impl MqttClient {
    pub fn new(config: MqttSection, metrics: Arc<BridgeMetrics>) -> Result<Self, MqttError> {
        let reconnect_config = ReconnectConfig::from_section(&config);
        HealthMonitor::validate_reconnect_config(&reconnect_config)
            .map_err(MqttError::ConnectionFailedStr)?;

        let mqtt_options = configure_mqtt_options(&config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, _) =
            watch::channel(ConnectionState::Disconnected(DisconnectReason::NotStarted));

        Ok(Self {
            config,
            client,
            event_loop: Some(event_loop),
            reconnect_config,
            metrics,
            state_tx: Arc::new(state_tx),
            shutdown: ShutdownTrigger::new(),
            event_loop_handle: None,
        })
    }

    /// Connect, subscribe to the telemetry wildcard and start forwarding publishes.
    ///
    /// Resolves once the broker has acknowledged both the connection and the
    /// subscription. Fails on a connection error, a rejected subscription or
    /// when neither arrives within the connect timeout; the event loop is
    /// stopped in every failure case.
    pub async fn connect(&mut self, inbound: mpsc::Sender<InboundMessage>) -> Result<(), MqttError> {
        let event_loop = self.event_loop.take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let (handshake_tx, handshake_rx) = oneshot::channel();
        let mut supervisor = ConnectionSupervisor {
            client: self.client.clone(),
            subscription: self.config.subscription.clone(),
            state: self.state_tx.borrow().clone(),
            state_tx: Arc::clone(&self.state_tx),
            forwarder: MessageForwarder::new(inbound),
            metrics: Arc::clone(&self.metrics),
            reconnect_config: self.reconnect_config.clone(),
            reconnect_attempts: 0,
            handshake: Some(handshake_tx),
        };
        supervisor.transition(ConnectionEvent::ConnectStarted);
        self.metrics.connection_attempt();

        info!(
            target: "mqtt_transport",
            broker = %self.config.broker_url,
            subscription = %self.config.subscription,
            "Connecting to broker"
        );

        let shutdown_rx = self.shutdown.subscribe();
        let span = mqtt_span!(broker = %self.config.broker_url);
        self.event_loop_handle = Some(tokio::spawn(
            supervisor.run(event_loop, shutdown_rx).instrument(span),
        ));

        let timeout = self.reconnect_config.connect_timeout;
        let result = match tokio::time::timeout(timeout, handshake_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MqttError::ConnectionFailedStr(
                "Event loop stopped before the subscription was confirmed".to_string(),
            )),
            Err(_) => Err(MqttError::ConnectionFailedStr(format!(
                "ConnAck timeout - no subscription confirmation within {}s",
                timeout.as_secs()
            ))),
        };

        if let Err(e) = &result {
            error!(target: "mqtt_transport", error = %e, "Broker handshake failed");
            self.stop_event_loop().await;
        }
        result
    }

    /// Stop the supervisor and close the broker connection
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        self.stop_event_loop().await;
        info!(target: "mqtt_transport", "Broker client disconnected");
        Ok(())
    }

    async fn stop_event_loop(&mut self) {
        self.shutdown.trigger();

        if let Some(mut handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => debug!(target: "mqtt_transport", "Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(target: "mqtt_transport", error = %e, "Event loop task ended with error");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(target: "mqtt_transport", "Event loop task didn't shut down gracefully, aborting");
                    handle.abort();
                }
            }
        }

        let previous = self.state_tx.borrow().clone();
        if previous != ConnectionState::Disconnected(DisconnectReason::Shutdown) {
            let next =
                HealthMonitor::determine_next_state(&previous, ConnectionEvent::ShutdownRequested);
            self.state_tx.send_replace(next);
        }
        self.metrics.connection_lost();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Receiver observing every state transition
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Cloneable publish-only handle sharing this connection
    pub fn publish_handle(&self) -> PublishHandle {
        PublishHandle {
            client: self.client.clone(),
            state_rx: self.state_tx.subscribe(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Publish side of [`MqttClient`], usable while the client itself stays
/// owned by the composition root
#[derive(Clone)]
pub struct PublishHandle {
    client: AsyncClient,
    state_rx: watch::Receiver<ConnectionState>,
    metrics: Arc<BridgeMetrics>,
}

impl PublishHandle {
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state = self.state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for PublishHandle {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: u8,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.check_connection_state()?;
        let level = MessageHandler::level_to_qos(qos)?;

        let bytes = payload.len();
        self.client
            .publish(topic, level, retain, payload)
            .await
            .map_err(|e| {
                self.metrics.publish_failed();
                MqttError::PublishFailed(Box::new(e))
            })?;

        self.metrics.message_published();
        debug!(target: "mqtt_transport", topic, qos, retain, bytes, "Published message");
        Ok(())
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

/// State owned by the spawned event loop task
struct ConnectionSupervisor {
    client: AsyncClient,
    subscription: String,
    state: ConnectionState,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    forwarder: MessageForwarder,
    metrics: Arc<BridgeMetrics>,
    reconnect_config: ReconnectConfig,
    reconnect_attempts: u32,
    /// Resolved by the first SubAck or the first failure
    handshake: Option<HandshakeSender>,
}

impl ConnectionSupervisor {
    async fn run(mut self, mut event_loop: EventLoop, mut shutdown_rx: ShutdownReceiver) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        self.flush_disconnect(&mut event_loop).await;
                        break;
                    }
                }
                event = event_loop.poll() => {
                    let keep_running = match event {
                        Ok(event) => self.handle_event(&event),
                        Err(error) => self.handle_connection_error(error, &mut shutdown_rx).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!(target: "mqtt_transport", "Broker event loop stopped");
    }

    fn transition(&mut self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(&self.state, event);
        self.state = next.clone();
        self.state_tx.send_replace(next);
    }

    /// Returns false when the loop should stop
    fn handle_event(&mut self, event: &Event) -> bool {
        match MessageHandler::route_mqtt_event(event) {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                self.metrics.connection_established();
                self.reconnect_attempts = 0;
                self.subscribe();
            }
            EventRoute::MessageReceived(message) => {
                debug!(
                    target: "mqtt_transport",
                    topic = %message.topic,
                    bytes = message.payload.len(),
                    qos = message.qos,
                    retain = message.retain,
                    "Received publish"
                );
                self.metrics.message_received();
                if self.forwarder.forward(message).is_err() {
                    self.metrics.inbound_dropped();
                }
            }
            EventRoute::SubscriptionConfirmed { packet_id, granted } => match granted {
                Ok(levels) => {
                    info!(
                        target: "mqtt_transport",
                        topic = %self.subscription,
                        packet_id,
                        granted = ?levels,
                        "Subscription confirmed"
                    );
                    self.resolve_handshake(Ok(()));
                }
                Err(reason) => {
                    error!(
                        target: "mqtt_transport",
                        topic = %self.subscription,
                        packet_id,
                        reason = %reason,
                        "Subscription rejected"
                    );
                    self.resolve_handshake(Err(MqttError::SubscriptionRejected {
                        topic: self.subscription.clone(),
                        reason,
                    }));
                }
            },
            EventRoute::Disconnected => {
                // The next poll surfaces the closed socket and drives the reconnect
                self.transition(ConnectionEvent::DisconnectedByBroker);
                self.metrics.connection_lost();
            }
            EventRoute::InfrastructureEvent(description) => {
                debug!(target: "mqtt_transport", event = %description, "Broker event");
            }
            EventRoute::OutgoingEvent => {}
        }
        true
    }

    fn subscribe(&mut self) {
        if let Err(e) = self
            .client
            .try_subscribe(self.subscription.clone(), QoS::AtLeastOnce)
        {
            error!(target: "mqtt_transport", topic = %self.subscription, error = %e, "Failed to request subscription");
            self.resolve_handshake(Err(MqttError::SubscriptionRejected {
                topic: self.subscription.clone(),
                reason: e.to_string(),
            }));
        } else {
            debug!(target: "mqtt_transport", topic = %self.subscription, "Subscription requested");
        }
    }

    fn resolve_handshake(&mut self, result: Result<(), MqttError>) {
        if let Some(tx) = self.handshake.take() {
            let _ = tx.send(result);
        }
    }

    /// Returns false when the loop should stop
    async fn handle_connection_error(
        &mut self,
        error: ConnectionError,
        shutdown_rx: &mut ShutdownReceiver,
    ) -> bool {
        let message = sanitize_message(&error.to_string());
        HealthMonitor::log_connection_error(&message);

        // Initial handshake failures are reported to connect() instead of retried
        if self.handshake.is_some() {
            self.resolve_handshake(Err(MqttError::ConnectionFailedStr(message)));
            return false;
        }

        self.record_connection_lost(message);

        let shutdown_requested = *shutdown_rx.borrow();
        match self.begin_reconnect(shutdown_requested) {
            ReconnectionDecision::Proceed { delay, .. } => {
                if !interruptible_sleep(shutdown_rx, delay).await {
                    info!(target: "mqtt_transport", "Shutdown during reconnect delay, stopping");
                    return false;
                }
                self.metrics.connection_attempt();
                true
            }
            ReconnectionDecision::AbortShutdownRequested => false,
        }
    }

    /// Move to `Disconnected(Lost)` after the established connection failed
    fn record_connection_lost(&mut self, message: String) {
        if !matches!(self.state, ConnectionState::Disconnected(_)) {
            self.transition(ConnectionEvent::NetworkError(message));
        }
        self.metrics.connection_lost();
    }

    /// Decide on the next reconnect and enter `Reconnecting(n)` if it proceeds
    fn begin_reconnect(&mut self, shutdown_requested: bool) -> ReconnectionDecision {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            shutdown_requested,
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                self.reconnect_attempts = attempt;
                self.metrics.reconnect_attempt();
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                info!(
                    target: "mqtt_transport",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnecting after fixed delay"
                );
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!(target: "mqtt_transport", "Shutdown requested, not reconnecting");
            }
        }
        decision
    }

    /// Best-effort DISCONNECT so the broker sees a clean close
    async fn flush_disconnect(&mut self, event_loop: &mut EventLoop) {
        if !self.state.is_connected() {
            return;
        }
        if self.client.try_disconnect().is_err() {
            return;
        }
        let _ = tokio::time::timeout(DISCONNECT_FLUSH, async {
            while event_loop.poll().await.is_ok() {}
        })
        .await;
    }
}
