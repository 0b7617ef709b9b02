//! Impure I/O for the MQTT control channel
//!
//! Owns the rumqttc client and event loop, runs the reconnection supervisor,
//! and forwards inbound commands as parsed [`ControlSignal`]s.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, TopicBuilder};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::backoff::BackoffPolicy;
use crate::config::ControlSection;
use crate::control::ControlSignal;
use crate::mqtt_span;
use crate::observability::EngineMetrics;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Shared pieces the reconnection supervisor works with
struct SupervisorContext {
    engine_id: String,
    config: ControlSection,
    topics: TopicBuilder,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    forwarder: Arc<Mutex<MessageForwarder>>,
    metrics: Arc<EngineMetrics>,
}

pub struct MqttClient {
    engine_id: String,
    config: ControlSection,
    topics: TopicBuilder,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Mutex<Option<EventLoop>>,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    forwarder: Arc<Mutex<MessageForwarder>>,
    metrics: Arc<EngineMetrics>,
}

impl MqttClient {
    pub fn new(
        engine_id: &str,
        config: ControlSection,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(engine_id, &config)?;
        let topics = TopicBuilder::new(&config.topic_prefix, engine_id);

        Ok(Self {
            engine_id: engine_id.to_string(),
            config,
            topics,
            client: Arc::new(Mutex::new(client)),
            event_loop: Mutex::new(Some(event_loop)),
            event_loop_handle: None,
            state_rx: None,
            shutdown_tx: None,
            forwarder: Arc::new(Mutex::new(MessageForwarder::new())),
            metrics,
        })
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Route parsed command-topic signals to `sender`
    pub async fn set_signal_sender(&self, sender: mpsc::Sender<ControlSignal>) {
        self.forwarder.lock().await.set_signal_sender(sender);
    }

    fn create_connection(
        engine_id: &str,
        config: &ControlSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(engine_id, config)?;
        Ok(AsyncClient::new(mqtt_options, 10))
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        (
            watch::channel(ConnectionState::Connecting),
            watch::channel(false),
        )
    }

    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                let state = state_rx.borrow().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Start the event loop supervisor and wait for the first ConnAck.
    /// The command topic is subscribed on every ConnAck.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self.event_loop.get_mut().take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);
        self.metrics.mqtt_connection_attempt();

        let ctx = SupervisorContext {
            engine_id: self.engine_id.clone(),
            config: self.config.clone(),
            topics: self.topics.clone(),
            client: self.client.clone(),
            state_tx,
            forwarder: self.forwarder.clone(),
            metrics: self.metrics.clone(),
        };
        let span = mqtt_span!(engine_id = %self.engine_id);
        let handle = tokio::spawn(Self::supervise(ctx, event_loop, shutdown_rx).instrument(span));
        self.event_loop_handle = Some(handle);

        let timeout = HealthMonitor::calculate_connection_timeout(&self.config.reconnect);
        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, timeout).await {
            self.metrics.mqtt_connection_failed();
            return Err(e);
        }
        Ok(())
    }

    async fn supervise(
        ctx: SupervisorContext,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Starting MQTT event loop with reconnection supervisor");
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconnection supervisor");
                        break;
                    }
                }
                event_result = event_loop.poll() => {
                    let keep_going = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            Self::process_event_route(
                                &ctx,
                                route,
                                &mut reconnect_attempts,
                                &mut event_loop,
                                shutdown_rx.clone(),
                            )
                            .await
                        }
                        Err(e) => {
                            let state = HealthMonitor::determine_next_state(
                                ConnectionEvent::NetworkError(e.to_string()),
                            );
                            let _ = ctx.state_tx.send(state);
                            ctx.metrics.mqtt_connection_lost();
                            Self::reconnect(
                                &ctx,
                                &mut reconnect_attempts,
                                &mut event_loop,
                                shutdown_rx.clone(),
                            )
                            .await
                        }
                    };
                    if !keep_going {
                        break;
                    }
                }
            }
        }
        info!(engine_id = %ctx.engine_id, "MQTT event loop stopped");
    }

    /// Returns false when the supervisor should stop
    async fn process_event_route(
        ctx: &SupervisorContext,
        route: EventRoute,
        reconnect_attempts: &mut u32,
        event_loop: &mut EventLoop,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let state = HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived);
                let _ = ctx.state_tx.send(state);
                ctx.metrics.mqtt_connection_established();
                *reconnect_attempts = 0;
                Self::subscribe_commands(&ctx.client, &ctx.topics.commands()).await;
                Self::announce_online(&ctx.client, &ctx.topics.status(), &ctx.engine_id).await;
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                Self::handle_message_received(ctx, &topic, &payload, retain).await;
                true
            }
            EventRoute::Disconnected => {
                let state =
                    HealthMonitor::determine_next_state(ConnectionEvent::DisconnectedByBroker);
                let _ = ctx.state_tx.send(state);
                ctx.metrics.mqtt_connection_lost();
                Self::reconnect(ctx, reconnect_attempts, event_loop, shutdown_rx).await
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", event = %event, "MQTT event");
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_message_received(
        ctx: &SupervisorContext,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) {
        debug!(target: "mqtt_transport", topic = %topic, "Received MQTT message");
        if !MessageHandler::should_process_message(topic, retain, &ctx.topics.commands()) {
            return;
        }

        match ControlSignal::parse(payload) {
            Ok(signal) => {
                ctx.metrics.signal_received();
                if let Err(e) = ctx.forwarder.lock().await.forward_signal(signal).await {
                    error!(error = %e, "Failed to forward operator signal");
                }
            }
            Err(e) => warn!(error = %e, "Ignoring malformed operator signal"),
        }
    }

    async fn subscribe_commands(client: &Arc<Mutex<AsyncClient>>, topic: &str) {
        let client = client.lock().await;
        match client.subscribe(topic, QoS::AtLeastOnce).await {
            Ok(()) => info!(topic = %topic, "Subscribed to command topic"),
            Err(e) => error!(topic = %topic, error = %e, "Failed to subscribe to command topic"),
        }
    }

    async fn announce_online(client: &Arc<Mutex<AsyncClient>>, topic: &str, engine_id: &str) {
        let payload = serde_json::json!({ "engine_id": engine_id, "online": true }).to_string();
        let client = client.lock().await;
        if let Err(e) = client.publish(topic, QoS::AtLeastOnce, true, payload).await {
            warn!(error = %e, "Failed to publish online status");
        }
    }

    /// Returns true if sleep completed, false if shutdown was requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Back off per policy and swap in a fresh client and event loop
    async fn reconnect(
        ctx: &SupervisorContext,
        reconnect_attempts: &mut u32,
        event_loop: &mut EventLoop,
        shutdown_rx: watch::Receiver<bool>,
    ) -> bool {
        let policy: &BackoffPolicy = &ctx.config.reconnect;
        let shutting_down = *shutdown_rx.borrow();
        match HealthMonitor::should_attempt_reconnection(*reconnect_attempts, policy, shutting_down) {
            ReconnectionDecision::Proceed { attempt, delay } => {
                *reconnect_attempts = attempt;
                let state =
                    HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(attempt));
                let _ = ctx.state_tx.send(state);
                info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to MQTT broker");

                let slept = Self::interruptible_sleep(shutdown_rx.clone(), delay).await;
                if !slept || *shutdown_rx.borrow() {
                    info!("Shutdown signal received, aborting reconnection");
                    return false;
                }

                ctx.metrics.mqtt_connection_attempt();
                match Self::create_connection(&ctx.engine_id, &ctx.config) {
                    Ok((client, new_event_loop)) => {
                        *event_loop = new_event_loop;
                        *ctx.client.lock().await = client;
                    }
                    Err(e) => {
                        ctx.metrics.mqtt_connection_failed();
                        error!(error = %e, "Failed to create new MQTT connection");
                    }
                }
                true
            }
            ReconnectionDecision::AbortShutdownRequested => false,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    policy.max_attempts.unwrap_or_default()
                );
                let state = HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(
                    reason,
                ));
                let _ = ctx.state_tx.send(state);
                false
            }
        }
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    /// Watch handle on the connection state, once `connect` has run
    pub fn state_watch(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.state_rx.clone()
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        Ok(())
    }

    /// Publish a JSON payload with QoS 1
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), MqttError> {
        self.check_connection_state()?;
        let client = self.client.lock().await;
        client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    /// Publish the offline status, stop the supervisor and disconnect
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        if self.is_connected() {
            let payload =
                serde_json::json!({ "engine_id": self.engine_id, "online": false }).to_string();
            let _ = self
                .publish(&self.topics.status(), payload.into_bytes(), true)
                .await;
        }

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        {
            let client = self.client.lock().await;
            client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        }

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("MQTT supervisor shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "MQTT supervisor ended with error"),
                Err(_) => warn!("MQTT supervisor did not stop in time"),
                _ => {}
            }
        }

        info!("MQTT client disconnected");
        Ok(())
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MqttClient {
        let config = ControlSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            topic_prefix: "/docrunner".to_string(),
            reconnect: BackoffPolicy::default(),
        };
        MqttClient::new("test-engine", config, Arc::new(EngineMetrics::new())).unwrap()
    }

    fn assert_send<T: Send>(_: &T) {}
    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_client_and_supervisor_can_move_across_tasks() {
        assert_send_sync::<MqttClient>();

        let mut client = client();
        let event_loop = client.event_loop.get_mut().take().unwrap();
        let ((state_tx, _state_rx), (_shutdown_tx, shutdown_rx)) =
            MqttClient::setup_connection_channels();
        let ctx = SupervisorContext {
            engine_id: client.engine_id.clone(),
            config: client.config.clone(),
            topics: client.topics.clone(),
            client: client.client.clone(),
            state_tx,
            forwarder: client.forwarder.clone(),
            metrics: client.metrics.clone(),
        };
        let supervisor = MqttClient::supervise(ctx, event_loop, shutdown_rx);
        assert_send(&supervisor);
    }

    #[test]
    fn test_setup_connection_channels() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            MqttClient::setup_connection_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!*shutdown_rx.borrow());

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let ((state_tx, state_rx), _) = MqttClient::setup_connection_channels();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let ((state_tx, state_rx), _) = MqttClient::setup_connection_channels();

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(10)).await;
        drop(state_tx);

        let err = result.unwrap_err().to_string();
        assert!(err.contains("ConnAck"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_disconnected() {
        let ((state_tx, state_rx), _) = MqttClient::setup_connection_channels();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("Test disconnect".to_string()));
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.unwrap_err().to_string().contains("Test disconnect"));
    }

    #[tokio::test]
    async fn test_interruptible_sleep() {
        let (_, (_shutdown_tx, shutdown_rx)) = MqttClient::setup_connection_channels();
        assert!(MqttClient::interruptible_sleep(shutdown_rx, Duration::from_millis(5)).await);

        let (_, (shutdown_tx, shutdown_rx)) = MqttClient::setup_connection_channels();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });
        assert!(!MqttClient::interruptible_sleep(shutdown_rx, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_state_before_connect() {
        let client = client();
        assert!(client.connection_state().is_none());
        assert!(!client.is_connected());
        assert_eq!(client.topics().commands(), "/docrunner/test-engine/commands");
    }

    #[tokio::test]
    async fn test_publish_fails_without_connection() {
        let client = client();
        let result = client
            .publish("/docrunner/test-engine/notifications", b"{}".to_vec(), false)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let mut client = client();
        assert!(client.disconnect().await.is_ok());
    }
}
