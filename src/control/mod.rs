//! Operator control channel
//!
//! Outbound [`Notification`]s report what the engine is doing; inbound
//! [`ControlSignal`]s toggle and steer it. The engine only sees the
//! [`ControlChannel`] trait; MQTT and log-only implementations ship.

pub mod mqtt;

use crate::orchestrator::cancel::CancelStep;
use crate::request::{DetectionChannel, RejectReason, SourceAttempt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

pub use mqtt::MqttControlChannel;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Failed to publish notification: {0}")]
    Publish(String),
    #[error("Control channel connection failed: {0}")]
    Connection(String),
    #[error("Invalid control signal: {0}")]
    InvalidSignal(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Point-in-time view published in answer to `diagnose`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub enabled: bool,
    pub initialized: bool,
    pub dry_run: bool,
    pub slot_busy: bool,
    pub active: Option<String>,
    pub skip_size: usize,
    pub dedup_records: usize,
    pub dedup_identifiers: usize,
    pub session_alive: bool,
    pub page_url: Option<String>,
    pub hook_alive: bool,
}

/// Outbound events, serialized with a `type` tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    CandidateFound {
        identifier: String,
        title: Option<String>,
        channel: DetectionChannel,
        requester: String,
        reward: String,
        detail_url: String,
    },
    RequestRejected {
        identifier: String,
        reason: RejectReason,
        title: Option<String>,
    },
    FulfillmentStarted {
        identifier: String,
        title: Option<String>,
        detail_url: String,
    },
    DownloadSucceeded {
        identifier: String,
        source: String,
    },
    FulfillmentSucceeded {
        identifier: String,
        source: String,
        sanitized: bool,
    },
    FulfillmentFailed {
        identifier: String,
        reason: String,
        attempts: Vec<SourceAttempt>,
    },
    CancellationSucceeded {
        identifier: String,
        step: CancelStep,
    },
    /// Manual-intervention alert: the slot stays occupied
    CancellationFailed {
        identifier: String,
        cancel_url: String,
        message: String,
    },
    SlotCleared {
        identifier: Option<String>,
    },
    EnabledChanged {
        enabled: bool,
    },
    SessionRecovered {
        attempts: u32,
    },
    PersistenceFailure {
        message: String,
    },
    HealthReport {
        session_alive: bool,
        hook_alive: bool,
        enabled: bool,
        active: Option<String>,
        skip_size: usize,
    },
    Diagnostic {
        diagnostics: Diagnostics,
    },
    Screenshot {
        path: String,
    },
    /// Acknowledgement or refusal of an operator signal
    Info {
        message: String,
    },
}

impl Notification {
    /// Alerts operators must act on
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            Notification::CancellationFailed { .. } | Notification::PersistenceFailure { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::CandidateFound { .. } => "candidate_found",
            Notification::RequestRejected { .. } => "request_rejected",
            Notification::FulfillmentStarted { .. } => "fulfillment_started",
            Notification::DownloadSucceeded { .. } => "download_succeeded",
            Notification::FulfillmentSucceeded { .. } => "fulfillment_succeeded",
            Notification::FulfillmentFailed { .. } => "fulfillment_failed",
            Notification::CancellationSucceeded { .. } => "cancellation_succeeded",
            Notification::CancellationFailed { .. } => "cancellation_failed",
            Notification::SlotCleared { .. } => "slot_cleared",
            Notification::EnabledChanged { .. } => "enabled_changed",
            Notification::SessionRecovered { .. } => "session_recovered",
            Notification::PersistenceFailure { .. } => "persistence_failure",
            Notification::HealthReport { .. } => "health_report",
            Notification::Diagnostic { .. } => "diagnostic",
            Notification::Screenshot { .. } => "screenshot",
            Notification::Info { .. } => "info",
        }
    }
}

fn default_monitor_minutes() -> u64 {
    5
}

/// Inbound operator signals, serialized with a `signal` tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ControlSignal {
    Enable,
    Disable,
    /// Manually fulfill a synthetic request
    Trigger { identifier: String },
    Diagnose,
    Restart,
    /// Release a stuck slot
    Clear,
    Monitor {
        #[serde(default = "default_monitor_minutes")]
        minutes: u64,
    },
    StopMonitor,
}

impl ControlSignal {
    /// Accepts the JSON form (`{"signal": "trigger", "identifier": "..."}`)
    /// or a plain command line (`trigger 10.1000/xyz`, `monitor 10`)
    pub fn parse(payload: &[u8]) -> Result<Self, ControlError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| ControlError::InvalidSignal(format!("payload is not UTF-8: {e}")))?
            .trim();

        if text.starts_with('{') {
            return serde_json::from_str(text)
                .map_err(|e| ControlError::InvalidSignal(e.to_string()));
        }

        let mut parts = text.split_whitespace();
        let command = parts
            .next()
            .map(|c| c.trim_start_matches('/').to_lowercase())
            .ok_or_else(|| ControlError::InvalidSignal("empty payload".to_string()))?;
        let argument = parts.next();

        match (command.as_str(), argument) {
            ("enable" | "on", _) => Ok(ControlSignal::Enable),
            ("disable" | "off", _) => Ok(ControlSignal::Disable),
            ("trigger", Some(identifier)) => Ok(ControlSignal::Trigger {
                identifier: identifier.to_string(),
            }),
            ("trigger", None) => Err(ControlError::InvalidSignal(
                "trigger requires an identifier".to_string(),
            )),
            ("diagnose" | "status", _) => Ok(ControlSignal::Diagnose),
            ("restart", _) => Ok(ControlSignal::Restart),
            ("clear", _) => Ok(ControlSignal::Clear),
            ("monitor", minutes) => {
                let minutes = match minutes {
                    Some(m) => m.parse().map_err(|_| {
                        ControlError::InvalidSignal(format!("invalid minutes '{m}'"))
                    })?,
                    None => default_monitor_minutes(),
                };
                Ok(ControlSignal::Monitor { minutes })
            }
            ("stop_monitor" | "stopmonitor", _) => Ok(ControlSignal::StopMonitor),
            (other, _) => Err(ControlError::InvalidSignal(format!("unknown command '{other}'"))),
        }
    }
}

/// Where notifications go
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), ControlError>;

    fn is_connected(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> Result<(), ControlError> {
        Ok(())
    }
}

/// Channel used when no broker is configured: notifications become log lines
#[derive(Debug, Default)]
pub struct LogControlChannel;

#[async_trait]
impl ControlChannel for LogControlChannel {
    async fn publish(&self, notification: &Notification) -> Result<(), ControlError> {
        let payload = serde_json::to_string(notification)?;
        if notification.is_alert() {
            error!(kind = notification.kind(), payload = %payload, "Operator alert");
        } else {
            info!(kind = notification.kind(), payload = %payload, "Notification");
        }
        Ok(())
    }
}

/// Publish and log failures instead of propagating them
pub async fn publish_best_effort(channel: &dyn ControlChannel, notification: Notification) {
    if let Err(e) = channel.publish(&notification).await {
        warn!(kind = notification.kind(), error = %e, "Failed to publish notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_is_type_tagged() {
        let value = serde_json::to_value(Notification::RequestRejected {
            identifier: "10.1/x".to_string(),
            reason: RejectReason::BookInTitlePre,
            title: Some("A Book".to_string()),
        })
        .unwrap();

        assert_eq!(value["type"], "request_rejected");
        assert_eq!(value["reason"], "book_in_title_pre");
    }

    #[test]
    fn test_cancellation_step_serializes() {
        let value = serde_json::to_value(Notification::CancellationSucceeded {
            identifier: "10.1/x".to_string(),
            step: CancelStep::DirectCall,
        })
        .unwrap();
        assert_eq!(value["step"], "direct_call");
    }

    #[test]
    fn test_parse_json_signals() {
        assert_eq!(
            ControlSignal::parse(br#"{"signal":"enable"}"#).unwrap(),
            ControlSignal::Enable
        );
        assert_eq!(
            ControlSignal::parse(br#"{"signal":"trigger","identifier":"10.1/x"}"#).unwrap(),
            ControlSignal::Trigger {
                identifier: "10.1/x".to_string()
            }
        );
        assert_eq!(
            ControlSignal::parse(br#"{"signal":"monitor"}"#).unwrap(),
            ControlSignal::Monitor { minutes: 5 }
        );
        assert_eq!(
            ControlSignal::parse(br#"{"signal":"stop_monitor"}"#).unwrap(),
            ControlSignal::StopMonitor
        );
    }

    #[test]
    fn test_parse_text_signals() {
        assert_eq!(ControlSignal::parse(b"/on").unwrap(), ControlSignal::Enable);
        assert_eq!(ControlSignal::parse(b"disable").unwrap(), ControlSignal::Disable);
        assert_eq!(
            ControlSignal::parse(b"trigger 10.1000/abc").unwrap(),
            ControlSignal::Trigger {
                identifier: "10.1000/abc".to_string()
            }
        );
        assert_eq!(
            ControlSignal::parse(b" monitor 12 ").unwrap(),
            ControlSignal::Monitor { minutes: 12 }
        );
        assert_eq!(ControlSignal::parse(b"clear").unwrap(), ControlSignal::Clear);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ControlSignal::parse(b"").is_err());
        assert!(ControlSignal::parse(b"trigger").is_err());
        assert!(ControlSignal::parse(b"monitor soon").is_err());
        assert!(ControlSignal::parse(b"launch missiles").is_err());
        assert!(ControlSignal::parse(br#"{"signal":"explode"}"#).is_err());
        assert!(ControlSignal::parse(&[0xff, 0xfe]).is_err());
    }

    #[tokio::test]
    async fn test_log_channel_accepts_everything() {
        let channel = LogControlChannel;
        assert!(channel
            .publish(&Notification::EnabledChanged { enabled: true })
            .await
            .is_ok());
        assert!(channel.is_connected());
    }

    #[test]
    fn test_alerts() {
        assert!(Notification::CancellationFailed {
            identifier: "x".into(),
            cancel_url: "u".into(),
            message: "m".into()
        }
        .is_alert());
        assert!(!Notification::SlotCleared { identifier: None }.is_alert());
    }
}
