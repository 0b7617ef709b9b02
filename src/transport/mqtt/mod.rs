//! MQTT transport for the operator control channel
//!
//! Split the same way throughout: pure decisions live apart from I/O.
//!
//! - [`connection`] - connection states, broker options and topic naming
//! - [`message_handler`] - event routing and signal forwarding
//! - [`health_monitor`] - reconnection decisions over a [`BackoffPolicy`](crate::backoff::BackoffPolicy)
//! - [`client`] - the rumqttc client and its reconnection supervisor

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, TopicBuilder};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
