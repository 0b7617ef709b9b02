//! MQTT-backed control channel

use super::{ControlChannel, ControlError, ControlSignal, Notification};
use crate::config::ControlSection;
use crate::observability::EngineMetrics;
use crate::transport::mqtt::{ConnectionState, MqttClient, MqttError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::info;

impl From<MqttError> for ControlError {
    fn from(error: MqttError) -> Self {
        match error {
            MqttError::PublishFailed(e) => ControlError::Publish(e.to_string()),
            MqttError::SerializationError(e) => ControlError::Serialization(e),
            MqttError::NotConnected { state } => {
                ControlError::Publish(format!("not connected ({state:?})"))
            }
            other => ControlError::Connection(other.to_string()),
        }
    }
}

pub struct MqttControlChannel {
    client: Mutex<MqttClient>,
    notifications_topic: String,
    state: watch::Receiver<ConnectionState>,
    metrics: Arc<EngineMetrics>,
}

impl MqttControlChannel {
    /// Connect to the broker and route inbound commands to `signals`
    pub async fn connect(
        engine_id: &str,
        config: ControlSection,
        metrics: Arc<EngineMetrics>,
        signals: mpsc::Sender<ControlSignal>,
    ) -> Result<Self, ControlError> {
        let mut client = MqttClient::new(engine_id, config, metrics.clone())?;
        client.set_signal_sender(signals).await;
        client.connect().await?;

        let state = client
            .state_watch()
            .ok_or_else(|| ControlError::Connection("connection state unavailable".to_string()))?;
        let notifications_topic = client.topics().notifications();
        info!(topic = %notifications_topic, "MQTT control channel ready");

        Ok(Self {
            client: Mutex::new(client),
            notifications_topic,
            state,
            metrics,
        })
    }
}

#[async_trait]
impl ControlChannel for MqttControlChannel {
    async fn publish(&self, notification: &Notification) -> Result<(), ControlError> {
        let payload = serde_json::to_vec(notification)?;
        let result = self
            .client
            .lock()
            .await
            .publish(&self.notifications_topic, payload, false)
            .await;

        match result {
            Ok(()) => {
                self.metrics.notification_published();
                Ok(())
            }
            Err(e) => {
                self.metrics.notification_failed();
                Err(e.into())
            }
        }
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected)
    }

    async fn shutdown(&self) -> Result<(), ControlError> {
        self.client.lock().await.disconnect().await?;
        Ok(())
    }
}
