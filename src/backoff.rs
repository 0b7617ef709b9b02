//! Exponential backoff policy
//!
//! One policy type drives every retry loop in the engine: session relaunch,
//! per-source download retries and control-channel reconnection. The policy
//! itself is pure; callers decide how to sleep.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

fn default_initial_ms() -> u64 {
    5_000
}

fn default_max_ms() -> u64 {
    60_000
}

fn default_multiplier() -> u32 {
    2
}

/// Configurable exponential backoff: `initial * multiplier^(n-1)`, capped at `max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Growth factor between consecutive delays
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Maximum number of retries (None = retry forever)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Policy with no delay at all, bounded to `max_attempts` retries
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_ms: 0,
            max_ms: 0,
            multiplier: 1,
            max_attempts: Some(max_attempts),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay to wait before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = (self.multiplier.max(1) as u64).saturating_pow(exponent);
        let delay = self.initial_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(delay)
    }

    /// Whether retry number `retry` (1-based) is still permitted
    pub fn allows(&self, retry: u32) -> bool {
        self.max_attempts.map_or(true, |max| retry <= max)
    }

    /// The sequence of delays this policy produces, finite when bounded
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1u32..)
            .take_while(move |retry| self.allows(*retry))
            .map(move |retry| self.delay_for(retry))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_ms > self.max_ms {
            return Err(format!(
                "backoff initial delay {}ms exceeds maximum {}ms",
                self.initial_ms, self.max_ms
            ));
        }
        if self.multiplier == 0 {
            return Err("backoff multiplier must be at least 1".to_string());
        }
        Ok(())
    }

    /// Run `op` until it succeeds, the error is not retryable, or the policy
    /// runs out of retries. `op` receives the 1-based attempt number.
    pub async fn retry<T, E, F, Fut, R>(&self, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && self.allows(attempt) => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after backoff");
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_policy_doubles_and_caps() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for(4), Duration::from_secs(40));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(50), Duration::from_secs(60));
    }

    #[test]
    fn test_huge_retry_number_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_bounded_delays_sequence() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(350))
            .with_max_attempts(Some(4));

        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
    }

    #[test]
    fn test_unbounded_policy_allows_forever() {
        let policy = BackoffPolicy::default();
        assert!(policy.allows(1));
        assert!(policy.allows(10_000));
        assert_eq!(policy.delays().take(3).count(), 3);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(1));
        assert!(policy.validate().is_err());

        let zero_multiplier = BackoffPolicy {
            multiplier: 0,
            ..Default::default()
        };
        assert!(zero_multiplier.validate().is_err());
        assert!(BackoffPolicy::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::immediate(5);

        let result: Result<u32, String> = policy
            .retry(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err("flaky".to_string())
                        } else {
                            Ok(attempt)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::immediate(5);

        let result: Result<(), String> = policy
            .retry(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("fatal".to_string()) }
                },
                |e| e != "fatal",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_respects_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy::immediate(2);

        let result: Result<(), String> = policy
            .retry(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("timeout".to_string()) }
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        // first try plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
