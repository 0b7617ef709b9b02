//! Network transports backing the control channel

pub mod mqtt;

pub use mqtt::{MqttClient, MqttError};
