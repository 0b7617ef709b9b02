//! Download orchestration
//!
//! Sources are tried in priority order. Each source gets the shared retry
//! policy for transient failures; a structural failure ends that source at
//! once and leaves a screenshot behind. When every source has failed the
//! caller falls back to [`cancel::CancellationFallback`].

pub mod adapter;
pub mod cancel;
pub mod commit;

pub use adapter::{AdapterError, AdapterRegistry, HttpTemplateAdapter, SourceAdapter};
pub use cancel::{CancelReport, CancelStep, CancellationFallback};
pub use commit::FulfillmentCommitter;

use crate::backoff::BackoffPolicy;
use crate::config::EngineConfig;
use crate::observability::EngineMetrics;
use crate::request::{Request, SourceAttempt};
use crate::session::{capture_snapshot, AutomationSession, SessionHandle};
use crate::state::StateError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of one orchestrator run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    pub path: Option<PathBuf>,
    pub source: Option<String>,
    /// One entry per source tried, in order
    pub attempts: Vec<SourceAttempt>,
}

impl FetchReport {
    /// Names of the sources that failed
    pub fn failures(&self) -> Vec<&str> {
        self.attempts
            .iter()
            .filter(|a| !a.succeeded)
            .map(|a| a.source.as_str())
            .collect()
    }

    pub fn summary(&self) -> String {
        self.attempts
            .iter()
            .map(|a| match &a.error {
                Some(error) => format!("{}: {error}", a.source),
                None => format!("{}: ok", a.source),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Download succeeded, or every source failed and the claim was handed back
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Downloaded(FetchReport),
    Exhausted {
        report: FetchReport,
        cancel: CancelReport,
    },
}

pub struct DownloadOrchestrator {
    registry: AdapterRegistry,
    retry: BackoffPolicy,
    download_dir: PathBuf,
    snapshot_dir: PathBuf,
    session: SessionHandle,
    metrics: Arc<EngineMetrics>,
}

impl DownloadOrchestrator {
    pub fn new(
        config: &EngineConfig,
        registry: AdapterRegistry,
        session: SessionHandle,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            registry,
            retry: config.sources.retry_policy(),
            download_dir: config.engine.download_dir.clone(),
            snapshot_dir: config.engine.snapshot_dir.clone(),
            session,
            metrics,
        }
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Try `order` until one source yields a document
    pub async fn fetch(&self, identifier: &str, order: &[String]) -> FetchReport {
        let mut report = FetchReport::default();

        let session = match self.session.current() {
            Ok(session) => session,
            Err(e) => {
                warn!(identifier, error = %e, "No session for download");
                for name in order.iter().filter(|n| self.registry.get(n).is_some()) {
                    report.attempts.push(SourceAttempt::failure(name, e.to_string()));
                }
                return report;
            }
        };

        for name in order {
            let Some(adapter) = self.registry.get(name) else {
                warn!(source = %name, "No adapter registered for source, skipping");
                continue;
            };

            match self
                .fetch_from(adapter.as_ref(), session.as_ref(), identifier)
                .await
            {
                Ok(path) => {
                    info!(identifier, source = %name, path = %path.display(), "Download succeeded");
                    report.attempts.push(SourceAttempt::success(name));
                    report.path = Some(path);
                    report.source = Some(name.clone());
                    return report;
                }
                Err(e) => {
                    warn!(identifier, source = %name, error = %e, "Source failed, trying next");
                    if e.is_structural() {
                        let label = format!("{}-{}", adapter::file_stem_for(identifier), name);
                        capture_snapshot(session.as_ref(), &self.snapshot_dir, &label).await;
                    }
                    report.attempts.push(SourceAttempt::failure(name, e.to_string()));
                }
            }
        }

        warn!(identifier, attempts = report.attempts.len(), "Every source failed");
        report
    }

    async fn fetch_from(
        &self,
        adapter: &dyn SourceAdapter,
        session: &dyn AutomationSession,
        identifier: &str,
    ) -> Result<PathBuf, AdapterError> {
        let dir: &Path = &self.download_dir;
        let metrics: &EngineMetrics = &self.metrics;
        self.retry
            .retry(
                move |attempt| async move {
                    debug!(source = adapter.name(), attempt, "Source attempt");
                    let started = Instant::now();
                    let result = adapter.download(session, identifier, dir).await;
                    metrics.source_attempted(adapter.name(), started.elapsed(), result.is_ok());
                    result
                },
                AdapterError::is_transient,
            )
            .await
    }

    /// Fetch, and on total failure run the cancellation fallback
    pub async fn fetch_or_cancel(
        &self,
        request: &Request,
        order: &[String],
        fallback: &CancellationFallback,
    ) -> Result<DownloadOutcome, StateError> {
        let report = self.fetch(&request.identifier, order).await;
        if report.path.is_some() {
            return Ok(DownloadOutcome::Downloaded(report));
        }
        let cancel = fallback.cancel(&request.identifier, &request.detail).await?;
        Ok(DownloadOutcome::Exhausted { report, cancel })
    }
}
