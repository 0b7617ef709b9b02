//! Pure routing of MQTT events and forwarding of operator signals

use crate::control::ControlSignal;
use rumqttc::v5::Event;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Retained commands are stale by definition and are never replayed
    pub fn should_process_message(topic: &str, retain: bool, expected_topic: &str) -> bool {
        if retain {
            debug!(topic = %topic, "Ignoring retained message");
            return false;
        }
        if topic != expected_topic {
            debug!(expected = %expected_topic, topic = %topic, "Topic mismatch");
            return false;
        }
        true
    }

    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    Disconnected,
    /// PingResp, SubAck and friends
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Hands parsed operator signals to the engine
pub struct MessageForwarder {
    signal_sender: Option<mpsc::Sender<ControlSignal>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self {
            signal_sender: None,
        }
    }

    pub fn set_signal_sender(&mut self, sender: mpsc::Sender<ControlSignal>) {
        self.signal_sender = Some(sender);
    }

    pub async fn forward_signal(&self, signal: ControlSignal) -> Result<(), String> {
        if let Some(ref sender) = self.signal_sender {
            info!(signal = ?signal, "Forwarding operator signal");
            sender
                .send(signal)
                .await
                .map_err(|e| format!("Failed to forward signal to engine: {e}"))
        } else {
            warn!("Received operator signal but no signal sender configured - dropped");
            Err("No signal sender configured".to_string())
        }
    }
}

impl Default for MessageForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::Publish;
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_should_process_message() {
        let topic = "/docrunner/e1/commands";

        assert!(MessageHandler::should_process_message(topic, false, topic));
        assert!(!MessageHandler::should_process_message(topic, true, topic));
        assert!(!MessageHandler::should_process_message(
            "/docrunner/other/commands",
            false,
            topic
        ));
    }

    #[test]
    fn test_route_mqtt_event() {
        use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Disconnect, Packet};

        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: rumqttc::v5::mqttbytes::v5::DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "/docrunner/e1/commands".into(),
            pkid: 1,
            payload: r#"{"signal":"diagnose"}"#.into(),
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                assert_eq!(topic, "/docrunner/e1/commands");
                assert_eq!(
                    ControlSignal::parse(&payload).unwrap(),
                    ControlSignal::Diagnose
                );
                assert!(!retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_forwarder() {
        let mut forwarder = MessageForwarder::new();
        assert!(forwarder.forward_signal(ControlSignal::Enable).await.is_err());

        let (tx, mut rx) = mpsc::channel(1);
        forwarder.set_signal_sender(tx);
        assert!(forwarder.forward_signal(ControlSignal::Restart).await.is_ok());
        assert_eq!(rx.recv().await, Some(ControlSignal::Restart));
    }
}
