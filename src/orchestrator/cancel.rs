//! Compensating cancellation
//!
//! Releasing a claimed request on the board is tried three ways, in order:
//! the cancel button on the detail page, a credentialed fetch of the cancel
//! path from inside the page, then plain navigation to the cancel URL. The
//! first step that works frees the slot. When none does, the slot stays
//! occupied and operators get one alert.

use crate::claim::{ClaimCoordinator, ClaimPredicate, PathPrefixPredicate};
use crate::config::EngineConfig;
use crate::control::{publish_best_effort, ControlChannel, Notification};
use crate::observability::EngineMetrics;
use crate::session::{absolute_url, AutomationSession, SessionError, SessionHandle};
use crate::state::StateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStep {
    UiAction,
    DirectCall,
    Navigation,
}

impl fmt::Display for CancelStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CancelStep::UiAction => "ui_action",
            CancelStep::DirectCall => "direct_call",
            CancelStep::Navigation => "navigation",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelReport {
    pub identifier: String,
    /// Step that released the request, `None` when all failed
    pub succeeded: Option<CancelStep>,
    pub failures: Vec<(CancelStep, String)>,
}

impl CancelReport {
    pub fn is_success(&self) -> bool {
        self.succeeded.is_some()
    }
}

pub struct CancellationFallback {
    session: SessionHandle,
    claims: Arc<ClaimCoordinator>,
    control: Arc<dyn ControlChannel>,
    metrics: Arc<EngineMetrics>,
    base_url: String,
    cancel_path: String,
    success: PathPrefixPredicate,
    step_timeout: Duration,
    navigation_timeout: Duration,
}

impl CancellationFallback {
    pub fn new(
        config: &EngineConfig,
        session: SessionHandle,
        claims: Arc<ClaimCoordinator>,
        control: Arc<dyn ControlChannel>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            session,
            claims,
            control,
            metrics,
            base_url: config.board.base_url.clone(),
            cancel_path: config.board.cancel_path.trim_end_matches('/').to_string(),
            success: PathPrefixPredicate::new(config.board.cancel_success_prefixes.clone()),
            step_timeout: Duration::from_millis(config.board.cancel_step_timeout_ms),
            navigation_timeout: Duration::from_millis(config.board.navigation_timeout_ms),
        }
    }

    /// Cancel path with every reserved character of `identifier` encoded
    pub fn cancel_path_for(&self, identifier: &str) -> String {
        format!("{}/{}", self.cancel_path, urlencoding::encode(identifier))
    }

    /// Cancel-button selectors, most specific first
    pub fn button_selectors(&self, identifier: &str) -> Vec<String> {
        let base = &self.cancel_path;
        vec![
            format!(r#"a.button[href="{base}/{identifier}"]"#),
            format!(
                r#"a.button[href="{base}/{}"]"#,
                urlencoding::encode(identifier)
            ),
            format!(
                r#"a.button[href="{base}/{}"]"#,
                identifier.replace('/', "%2F")
            ),
            format!(r#"a.button[href^="{base}/"]"#),
        ]
    }

    /// Run the fallback for `identifier`, whose detail page is `detail`
    ///
    /// Only a failure to persist the released slot is returned as an error.
    pub async fn cancel(&self, identifier: &str, detail: &str) -> Result<CancelReport, StateError> {
        let mut report = CancelReport {
            identifier: identifier.to_string(),
            succeeded: None,
            failures: Vec::new(),
        };

        let session = match self.session.current() {
            Ok(session) => Some(session),
            Err(e) => {
                for step in [CancelStep::UiAction, CancelStep::DirectCall, CancelStep::Navigation] {
                    report.failures.push((step, e.to_string()));
                }
                None
            }
        };

        if let Some(session) = session {
            for step in [CancelStep::UiAction, CancelStep::DirectCall, CancelStep::Navigation] {
                match self.run_step(session.as_ref(), step, identifier, detail).await {
                    Ok(()) => {
                        report.succeeded = Some(step);
                        break;
                    }
                    Err(reason) => {
                        debug!(identifier, step = %step, reason = %reason, "Cancel step failed");
                        report.failures.push((step, reason));
                    }
                }
            }
        }

        match report.succeeded {
            Some(step) => {
                self.claims.release(identifier)?;
                self.metrics.cancellation_succeeded();
                info!(identifier, step = %step, "Request cancelled on the board");
                publish_best_effort(
                    self.control.as_ref(),
                    Notification::CancellationSucceeded {
                        identifier: identifier.to_string(),
                        step,
                    },
                )
                .await;
            }
            None => {
                self.metrics.cancellation_failed();
                let cancel_url = absolute_url(&self.base_url, &self.cancel_path_for(identifier));
                let message = report
                    .failures
                    .iter()
                    .map(|(step, reason)| format!("{step}: {reason}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                error!(
                    identifier,
                    cancel_url = %cancel_url,
                    "All cancel steps failed; slot stays occupied until cleared"
                );
                publish_best_effort(
                    self.control.as_ref(),
                    Notification::CancellationFailed {
                        identifier: identifier.to_string(),
                        cancel_url,
                        message: crate::error::sanitize_error_message(&message),
                    },
                )
                .await;
            }
        }

        Ok(report)
    }

    async fn run_step(
        &self,
        session: &dyn AutomationSession,
        step: CancelStep,
        identifier: &str,
        detail: &str,
    ) -> Result<(), String> {
        match step {
            CancelStep::UiAction => {
                let detail_url = absolute_url(&self.base_url, detail);
                if let Err(e) = session.goto(&detail_url, self.navigation_timeout).await {
                    warn!(identifier, error = %e, "Could not open detail page before cancelling");
                }
                session
                    .click_first(&self.button_selectors(identifier), self.step_timeout)
                    .await
                    .map(|selector| debug!(identifier, selector = %selector, "Cancel button clicked"))
                    .map_err(|e| e.to_string())
            }
            CancelStep::DirectCall => {
                let outcome = session
                    .fetch(&self.cancel_path_for(identifier), self.step_timeout)
                    .await
                    .map_err(|e: SessionError| e.to_string())?;
                if self.success.is_success(&outcome) {
                    Ok(())
                } else {
                    Err(format!(
                        "cancel call returned {} at {}",
                        outcome.status,
                        outcome.landing_path()
                    ))
                }
            }
            CancelStep::Navigation => {
                let url = absolute_url(&self.base_url, &self.cancel_path_for(identifier));
                session
                    .goto(&url, self.step_timeout)
                    .await
                    .map_err(|e| e.to_string())
            }
        }
    }
}
