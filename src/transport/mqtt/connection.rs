//! Pure connection state management for the MQTT control channel
//!
//! Connection states, broker option construction and topic naming.

use crate::config::ControlSection;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for the MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Reconnection policy exhausted
    PermanentlyDisconnected(String),
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Normalize a topic: one leading slash, no doubled or trailing slashes
pub fn canonicalize_topic(topic: &str) -> String {
    let segments: Vec<&str> = topic.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Build broker options for this engine
pub fn configure_mqtt_options(
    engine_id: &str,
    config: &ControlSection,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    // Unique client id per connection attempt avoids broker session takeover
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let client_id = format!("docrunner-{engine_id}-{timestamp}");
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(60));
    // Diagnostic snapshots can exceed the small broker defaults
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    let topics = TopicBuilder::new(&config.topic_prefix, engine_id);
    let lwt_payload = serde_json::to_string(&serde_json::json!({
        "engine_id": engine_id,
        "online": false,
    }))
    .map_err(MqttError::SerializationError)?;
    let lwt = LastWill::new(topics.status(), lwt_payload, QoS::AtLeastOnce, true, None);
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}

/// Topic names for one engine under a configurable prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    base: String,
}

impl TopicBuilder {
    pub fn new(prefix: &str, engine_id: &str) -> Self {
        Self {
            base: canonicalize_topic(&format!("{prefix}/{engine_id}")),
        }
    }

    /// `<prefix>/<engine_id>/notifications`
    pub fn notifications(&self) -> String {
        format!("{}/notifications", self.base)
    }

    /// `<prefix>/<engine_id>/commands`
    pub fn commands(&self) -> String {
        format!("{}/commands", self.base)
    }

    /// `<prefix>/<engine_id>/status`, retained online flag plus last will
    pub fn status(&self) -> String {
        format!("{}/status", self.base)
    }
}
