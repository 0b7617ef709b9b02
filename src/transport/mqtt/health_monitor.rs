//! Pure reconnection decisions and connection state tracking

use super::connection::ConnectionState;
use crate::backoff::BackoffPolicy;
use std::time::Duration;
use tracing::{error, info};

/// Pure reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether to attempt another reconnection
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        policy: &BackoffPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        let attempt = current_attempts + 1;
        if !policy.allows(attempt) {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        ReconnectionDecision::Proceed {
            attempt,
            delay: policy.delay_for(attempt),
        }
    }

    /// How long `connect` waits for the first ConnAck
    pub fn calculate_connection_timeout(policy: &BackoffPolicy) -> Duration {
        if policy.max_attempts.is_some() {
            policy.delays().sum::<Duration>() + Duration::from_secs(30)
        } else {
            Duration::from_secs(60)
        }
    }

    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => {
                info!("MQTT control channel connected");
                ConnectionState::Connected
            }
            ConnectionEvent::DisconnectedByBroker => {
                info!("MQTT broker disconnected engine");
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => {
                error!(error = %error, "MQTT event loop error");
                ConnectionState::Disconnected(error)
            }
            ConnectionEvent::ReconnectionStarted(attempt) => {
                info!(attempt, "Starting MQTT reconnection attempt");
                ConnectionState::Reconnecting(attempt)
            }
            ConnectionEvent::PermanentFailure(reason) => {
                error!(reason = %reason, "Permanent MQTT connection failure");
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }
}

#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(5))
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let policy = policy();

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &policy, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay: Duration::from_millis(250)
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(2, &policy, false),
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay: Duration::from_millis(1000)
            }
        );
        // Capped at the policy maximum
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(10, &policy, false),
            ReconnectionDecision::Proceed {
                attempt: 11,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &policy, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_bounded_policy_aborts() {
        let policy = policy().with_max_attempts(Some(3));
        assert!(matches!(
            HealthMonitor::should_attempt_reconnection(2, &policy, false),
            ReconnectionDecision::Proceed { attempt: 3, .. }
        ));
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, &policy, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_calculate_connection_timeout() {
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&policy()),
            Duration::from_secs(60)
        );

        let bounded = policy().with_max_attempts(Some(3));
        // 250 + 500 + 1000 ms plus the 30s margin
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&bounded),
            Duration::from_millis(1750) + Duration::from_secs(30)
        );
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::DisconnectedByBroker),
            ConnectionState::Disconnected("Broker disconnected".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError(
                "timeout".to_string()
            )),
            ConnectionState::Disconnected("timeout".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(2)),
            ConnectionState::Reconnecting(2)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(
                "exhausted".to_string()
            )),
            ConnectionState::PermanentlyDisconnected("exhausted".to_string())
        );
    }

    #[test]
    fn test_can_publish() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(!HealthMonitor::can_publish(
            &ConnectionState::PermanentlyDisconnected("x".to_string())
        ));
    }
}
