//! Claim coordinator
//!
//! The engine fulfills one request at a time. The slot is a single-permit
//! semaphore: `try_acquire_owned` is the provisional "attempt in progress"
//! mark taken before the claim call yields, and the permit moves into the
//! durable [`ActiveClaim`] record only once the call has resolved in our
//! favour. Losing, erroring or timing out drops the permit and frees the slot.

use crate::claim_span;
use crate::config::EngineConfig;
use crate::observability::metrics::EngineMetrics;
use crate::session::{FetchOutcome, SessionHandle};
use crate::state::{StateError, StateStore};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn, Instrument};

/// Decides whether a claim call won the race
pub trait ClaimPredicate: Send + Sync {
    fn is_success(&self, outcome: &FetchOutcome) -> bool;
}

/// Redirect, ok status, or a landing path under a known prefix
#[derive(Debug, Clone)]
pub struct PathPrefixPredicate {
    prefixes: Vec<String>,
}

impl PathPrefixPredicate {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }
}

impl ClaimPredicate for PathPrefixPredicate {
    fn is_success(&self, outcome: &FetchOutcome) -> bool {
        if outcome.redirected || outcome.ok {
            return true;
        }
        let path = outcome.landing_path();
        self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

/// Result of one claim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Expected race outcome, not an error
    CompetitorWon,
    /// Engine disabled; nothing attempted
    Disabled,
    /// Slot occupied or another attempt in flight; nothing attempted
    SlotBusy,
    /// The claim call errored or timed out; slot left free
    Failed(String),
}

/// The durable busy record. Holding it holds the slot.
#[derive(Debug)]
pub struct ActiveClaim {
    pub identifier: String,
    pub since: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

pub struct ClaimCoordinator {
    slot: Arc<Semaphore>,
    active: Mutex<Option<ActiveClaim>>,
    state: Arc<StateStore>,
    session: SessionHandle,
    metrics: Arc<EngineMetrics>,
    predicate: Arc<dyn ClaimPredicate>,
    claim_path: String,
    timeout: Duration,
}

impl ClaimCoordinator {
    pub fn new(
        config: &EngineConfig,
        state: Arc<StateStore>,
        session: SessionHandle,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let predicate = Arc::new(PathPrefixPredicate::new(
            config.board.claim_success_prefixes.clone(),
        ));
        Self {
            slot: Arc::new(Semaphore::new(1)),
            active: Mutex::new(None),
            state,
            session,
            metrics,
            predicate,
            claim_path: config.board.claim_path.clone(),
            timeout: Duration::from_millis(config.board.claim_timeout_ms),
        }
    }

    pub fn with_predicate(mut self, predicate: Arc<dyn ClaimPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    /// Board path of the claim call for `identifier`
    pub fn claim_path_for(&self, identifier: &str) -> String {
        format!("{}{}", self.claim_path, urlencoding::encode(identifier))
    }

    /// Race to claim `identifier`
    ///
    /// Only a persistence failure after a won claim is returned as an error;
    /// the slot then stays held because the board side is already ours.
    pub async fn try_claim(&self, identifier: &str) -> Result<ClaimOutcome, StateError> {
        if !self.state.is_enabled() {
            debug!(identifier, "Engine disabled, not claiming");
            return Ok(ClaimOutcome::Disabled);
        }

        // Provisional mark, taken synchronously before any suspension point
        let Ok(permit) = self.slot.clone().try_acquire_owned() else {
            debug!(identifier, "Slot busy, not claiming");
            return Ok(ClaimOutcome::SlotBusy);
        };

        self.metrics.claim_attempted();
        let path = self.claim_path_for(identifier);
        let span = claim_span!(identifier = %identifier, path = %path);

        let result = async {
            let session = self.session.current()?;
            session.fetch(&path, self.timeout).await
        }
        .instrument(span)
        .await;

        match result {
            Ok(outcome) if self.predicate.is_success(&outcome) => {
                self.occupy(identifier, permit);
                self.state.record_claim(identifier)?;
                self.metrics.claim_won();
                info!(
                    identifier,
                    status = outcome.status,
                    redirected = outcome.redirected,
                    landing = %outcome.landing_path(),
                    "Claim won"
                );
                Ok(ClaimOutcome::Claimed)
            }
            Ok(outcome) => {
                self.metrics.claim_lost();
                info!(
                    identifier,
                    status = outcome.status,
                    landing = %outcome.landing_path(),
                    "Claim lost to a competitor"
                );
                Ok(ClaimOutcome::CompetitorWon)
            }
            Err(e) => {
                self.metrics.claim_error();
                warn!(identifier, error = %e, "Claim call failed, slot left free");
                Ok(ClaimOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Reserve the slot without a claim call (manual trigger). `false` if busy.
    pub fn reserve_manual(&self, identifier: &str) -> Result<bool, StateError> {
        let Ok(permit) = self.slot.clone().try_acquire_owned() else {
            return Ok(false);
        };
        self.occupy(identifier, permit);
        self.state.record_claim(identifier)?;
        info!(identifier, "Slot reserved for manual fulfillment");
        Ok(true)
    }

    /// Re-occupy the slot for an `active` identifier persisted by a previous run
    pub fn restore_from_state(&self) -> Option<String> {
        let identifier = self.state.active()?;
        match self.slot.clone().try_acquire_owned() {
            Ok(permit) => {
                self.occupy(&identifier, permit);
                warn!(identifier = %identifier, "Restored active claim from state; slot stays busy until cleared");
                Some(identifier)
            }
            Err(_) => None,
        }
    }

    /// Free the slot held for `identifier`, keeping it in the skip set
    pub fn release(&self, identifier: &str) -> Result<(), StateError> {
        if let Ok(mut active) = self.active.lock() {
            if active.as_ref().is_some_and(|a| a.identifier == identifier) {
                *active = None;
            }
        }
        self.metrics.set_slot_busy(self.is_busy());
        self.state.release_active(identifier)?;
        info!(identifier, "Slot released");
        Ok(())
    }

    /// Operator override: release whatever holds the slot
    pub fn force_clear(&self) -> Result<Option<String>, StateError> {
        let identifier = self
            .active_identifier()
            .or_else(|| self.state.active());
        match &identifier {
            Some(identifier) => {
                if let Ok(mut active) = self.active.lock() {
                    *active = None;
                }
                self.metrics.set_slot_busy(false);
                self.state.release_active(identifier)?;
                warn!(identifier = %identifier, "Slot cleared by operator");
            }
            None => debug!("Clear requested but slot already free"),
        }
        Ok(identifier)
    }

    /// Slot held or an attempt in flight
    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    pub fn active_identifier(&self) -> Option<String> {
        self.active
            .lock()
            .ok()
            .and_then(|a| a.as_ref().map(|a| a.identifier.clone()))
    }

    pub fn active_since(&self) -> Option<DateTime<Utc>> {
        self.active.lock().ok().and_then(|a| a.as_ref().map(|a| a.since))
    }

    fn occupy(&self, identifier: &str, permit: OwnedSemaphorePermit) {
        if let Ok(mut active) = self.active.lock() {
            *active = Some(ActiveClaim {
                identifier: identifier.to_string(),
                since: Utc::now(),
                _permit: permit,
            });
        }
        self.metrics.set_slot_busy(true);
    }
}
