//! Request lifecycle engine
//!
//! Wires the detector, prefilter, claim coordinator, download orchestrator,
//! sanitizer and committer into one pipeline, and answers operator signals.
//! Each candidate is handled on its own task; the claim coordinator's single
//! slot keeps at most one request between claim and upload.

use crate::claim::{ClaimCoordinator, ClaimOutcome};
use crate::context::EngineContext;
use crate::control::{ControlSignal, Diagnostics, Notification};
use crate::detector::{CandidateStream, EventDetector};
use crate::error::{sanitize_error_message, EngineError, EngineResult};
use crate::metadata::{MetadataResolver, WorkMetadata};
use crate::orchestrator::{
    AdapterRegistry, CancelReport, CancellationFallback, DownloadOrchestrator, DownloadOutcome,
    FulfillmentCommitter,
};
use crate::prefilter::{self, PrefilterVerdict};
use crate::request::{Candidate, DocumentArtifact, RejectReason, Request, RequestStatus};
use crate::sanitizer::DocumentSanitizer;
use crate::session::{absolute_url, SessionLauncher, SessionSupervisor};
use crate::state::StateError;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

pub struct Engine {
    ctx: EngineContext,
    detector: Arc<EventDetector>,
    claims: Arc<ClaimCoordinator>,
    orchestrator: DownloadOrchestrator,
    fallback: CancellationFallback,
    committer: FulfillmentCommitter,
    sanitizer: DocumentSanitizer,
    resolver: MetadataResolver,
    supervisor: Arc<SessionSupervisor>,
    source_order: Vec<String>,
    candidates: Mutex<Option<CandidateStream>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        ctx: EngineContext,
        launcher: Arc<dyn SessionLauncher>,
        adapters: AdapterRegistry,
        resolver: MetadataResolver,
    ) -> Arc<Self> {
        let config = ctx.config.clone();
        let (detector, candidates) =
            EventDetector::new(&config, ctx.state.clone(), ctx.metrics.clone());
        let claims = Arc::new(ClaimCoordinator::new(
            &config,
            ctx.state.clone(),
            ctx.session.clone(),
            ctx.metrics.clone(),
        ));
        let fallback = CancellationFallback::new(
            &config,
            ctx.session.clone(),
            claims.clone(),
            ctx.control.clone(),
            ctx.metrics.clone(),
        );
        let supervisor = SessionSupervisor::new(
            &config,
            launcher,
            ctx.session.clone(),
            detector.clone(),
            adapters.clone(),
            claims.clone(),
            ctx.state.clone(),
            ctx.control.clone(),
            ctx.metrics.clone(),
        );
        let orchestrator =
            DownloadOrchestrator::new(&config, adapters, ctx.session.clone(), ctx.metrics.clone());

        Arc::new(Self {
            committer: FulfillmentCommitter::new(&config, ctx.session.clone()),
            sanitizer: DocumentSanitizer::new(config.sanitizer.clone(), ctx.metrics.clone()),
            source_order: config.sources.effective_order(),
            detector,
            claims,
            orchestrator,
            fallback,
            resolver,
            supervisor,
            candidates: Mutex::new(Some(candidates)),
            shutdown: CancellationToken::new(),
            ctx,
        })
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn claims(&self) -> &Arc<ClaimCoordinator> {
        &self.claims
    }

    pub fn detector(&self) -> &Arc<EventDetector> {
        &self.detector
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    /// Start the session and process candidates and signals until shutdown
    pub async fn run(self: Arc<Self>, mut signals: mpsc::Receiver<ControlSignal>) -> EngineResult<()> {
        let Some(mut candidates) = self.candidates.lock().ok().and_then(|mut c| c.take()) else {
            return Err(EngineError::internal_error("engine is already running"));
        };
        let metrics = self.ctx.metrics.clone();
        metrics.set_engine_state("starting");

        if let Some(identifier) = self.claims.restore_from_state() {
            self.ctx
                .notify(Notification::Info {
                    message: format!("Slot still held by {identifier} from a previous run; send clear to release it"),
                })
                .await;
        }

        let report = self.supervisor.start().await;
        if !report.recovered {
            info!("Shutdown requested during startup");
            return Ok(());
        }
        tokio::spawn(self.supervisor.clone().run());
        metrics.set_engine_state(self.state_label());
        info!(
            engine_id = %self.ctx.engine_id(),
            dry_run = self.ctx.config.engine.dry_run,
            sources = ?self.source_order,
            "Engine running"
        );

        let mut signals_open = true;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                candidate = candidates.next() => {
                    let Some(candidate) = candidate else { break };
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.handle_candidate(candidate).await;
                    });
                }
                signal = signals.recv(), if signals_open => match signal {
                    Some(signal) => {
                        metrics.signal_received();
                        self.handle_signal(signal).await;
                    }
                    None => {
                        debug!("Control signal channel closed");
                        signals_open = false;
                    }
                },
            }
        }
        info!("Engine loop stopped");
        Ok(())
    }

    /// Stop the loop, the session and the control channel
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.supervisor.shutdown().await;
        self.ctx.shutdown().await;
    }

    fn state_label(&self) -> &'static str {
        if self.ctx.state.is_enabled() {
            "running"
        } else {
            "disabled"
        }
    }

    /// Screen, claim and fulfill one candidate. Returns where it ended up.
    pub async fn handle_candidate(&self, candidate: Candidate) -> RequestStatus {
        let mut request = candidate.request;
        let detail_url = absolute_url(&self.ctx.config.board.base_url, &request.detail);
        self.ctx
            .notify(Notification::CandidateFound {
                identifier: request.identifier.clone(),
                title: request.title.clone(),
                channel: candidate.channel,
                requester: request.requester.clone(),
                reward: request.reward.clone(),
                detail_url,
            })
            .await;

        if self.ctx.config.engine.dry_run {
            debug!(identifier = %request.identifier, "Dry run, not claiming");
            return request.status;
        }

        match self.pursue(&mut request).await {
            Ok(status) => status,
            Err(e) => {
                self.report_failure(&request, &e).await;
                if request.status.can_transition_to(RequestStatus::Error) {
                    request.status = RequestStatus::Error;
                }
                request.status
            }
        }
    }

    async fn pursue(&self, request: &mut Request) -> EngineResult<RequestStatus> {
        if let Some(title) = request.title.clone() {
            if let PrefilterVerdict::Reject(reason) = prefilter::evaluate(&title) {
                self.ctx.metrics.prefilter_rejected();
                request.transition(RequestStatus::PrefilterRejected)?;
                self.reject(request, reason).await?;
                return Ok(request.status);
            }
        }

        match self.claims.try_claim(&request.identifier).await? {
            ClaimOutcome::Claimed => {
                request.transition(RequestStatus::Claimed)?;
                self.fulfill(request, true).await
            }
            ClaimOutcome::CompetitorWon => {
                request.transition(RequestStatus::CompetitorWon)?;
                self.reject(request, RejectReason::CompetitorWon).await?;
                Ok(request.status)
            }
            ClaimOutcome::Disabled | ClaimOutcome::SlotBusy => Ok(request.status),
            ClaimOutcome::Failed(reason) => {
                debug!(identifier = %request.identifier, reason = %reason, "Claim attempt failed");
                Ok(request.status)
            }
        }
    }

    async fn reject(&self, request: &Request, reason: RejectReason) -> Result<(), StateError> {
        self.ctx.state.mark_skipped(&request.identifier)?;
        info!(identifier = %request.identifier, reason = %reason.code(), "Request rejected");
        self.ctx
            .notify(Notification::RequestRejected {
                identifier: request.identifier.clone(),
                reason,
                title: request.title.clone(),
            })
            .await;
        Ok(())
    }

    /// Download, sanitize and submit a request that holds the slot
    pub async fn fulfill(&self, request: &mut Request, screen_metadata: bool) -> EngineResult<RequestStatus> {
        let span = crate::pipeline_span!(identifier = %request.identifier, sources = self.source_order.len());
        self.fulfill_inner(request, screen_metadata).instrument(span).await
    }

    async fn fulfill_inner(&self, request: &mut Request, screen_metadata: bool) -> EngineResult<RequestStatus> {
        let started = Instant::now();
        let metrics = self.ctx.metrics.clone();
        metrics.fulfillment_started();
        self.ctx
            .notify(Notification::FulfillmentStarted {
                identifier: request.identifier.clone(),
                title: request.title.clone(),
                detail_url: absolute_url(&self.ctx.config.board.base_url, &request.detail),
            })
            .await;

        if screen_metadata {
            if let Some(reason) = self.screen_metadata(request).await {
                request.transition(RequestStatus::CancelRequested)?;
                self.ctx
                    .notify(Notification::RequestRejected {
                        identifier: request.identifier.clone(),
                        reason,
                        title: request.title.clone(),
                    })
                    .await;
                let report = self.fallback.cancel(&request.identifier, &request.detail).await?;
                metrics.fulfillment_failed(started.elapsed());
                return self.settle_cancel(request, &report);
            }
        }

        request.transition(RequestStatus::Downloading)?;
        let report = match self
            .orchestrator
            .fetch_or_cancel(request, &self.source_order, &self.fallback)
            .await?
        {
            DownloadOutcome::Downloaded(report) => report,
            DownloadOutcome::Exhausted { report, cancel } => {
                request.transition(RequestStatus::DownloadFailed)?;
                request.transition(RequestStatus::CancelRequested)?;
                metrics.fulfillment_failed(started.elapsed());
                self.ctx
                    .notify(Notification::FulfillmentFailed {
                        identifier: request.identifier.clone(),
                        reason: sanitize_error_message(&format!("every source failed: {}", report.summary())),
                        attempts: report.attempts,
                    })
                    .await;
                return self.settle_cancel(request, &cancel);
            }
        };

        let (Some(path), Some(source)) = (report.path.clone(), report.source.clone()) else {
            return Err(EngineError::internal_error("download reported success without a document"));
        };
        let mut artifact = match DocumentArtifact::from_path(&path) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(
                    identifier = %request.identifier,
                    source = %source,
                    path = %path.display(),
                    error = %e,
                    "Downloaded document is unreadable"
                );
                request.transition(RequestStatus::DownloadFailed)?;
                request.transition(RequestStatus::CancelRequested)?;
                metrics.fulfillment_failed(started.elapsed());
                self.ctx
                    .notify(Notification::FulfillmentFailed {
                        identifier: request.identifier.clone(),
                        reason: sanitize_error_message(&format!(
                            "document from {source} is unreadable: {e}"
                        )),
                        attempts: report.attempts,
                    })
                    .await;
                let cancel = self.fallback.cancel(&request.identifier, &request.detail).await?;
                return self.settle_cancel(request, &cancel);
            }
        };
        self.ctx
            .notify(Notification::DownloadSucceeded {
                identifier: request.identifier.clone(),
                source: source.clone(),
            })
            .await;

        request.transition(RequestStatus::Sanitizing)?;
        self.sanitizer.sanitize(&mut artifact).await;

        request.transition(RequestStatus::Uploading)?;
        if let Err(e) = self.committer.commit(request, &artifact).await {
            request.transition(RequestStatus::CancelRequested)?;
            metrics.fulfillment_failed(started.elapsed());
            self.ctx
                .notify(Notification::FulfillmentFailed {
                    identifier: request.identifier.clone(),
                    reason: sanitize_error_message(&format!("submission failed: {e}")),
                    attempts: report.attempts,
                })
                .await;
            let cancel = self.fallback.cancel(&request.identifier, &request.detail).await?;
            self.committer.cleanup(&artifact).await;
            return self.settle_cancel(request, &cancel);
        }

        self.claims.release(&request.identifier)?;
        request.transition(RequestStatus::Fulfilled)?;
        metrics.fulfillment_succeeded(started.elapsed());
        info!(
            identifier = %request.identifier,
            source = %source,
            sanitized = artifact.sanitized,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request fulfilled"
        );
        self.ctx
            .notify(Notification::FulfillmentSucceeded {
                identifier: request.identifier.clone(),
                source,
                sanitized: artifact.sanitized,
            })
            .await;
        self.committer.cleanup(&artifact).await;
        Ok(request.status)
    }

    /// Post-claim check against resolved metadata
    async fn screen_metadata(&self, request: &Request) -> Option<RejectReason> {
        if self.resolver.is_empty() {
            return None;
        }
        let mut metadata = self.resolver.resolve(&request.identifier).await;
        if metadata.title.is_none() {
            metadata.title = request.title.clone();
        }
        let verdict = metadata_verdict(&metadata);
        if let Some(reason) = &verdict {
            info!(
                identifier = %request.identifier,
                reason = %reason.code(),
                title = ?metadata.title,
                work_type = ?metadata.work_type,
                "Claimed request fails metadata screening"
            );
        }
        verdict
    }

    fn settle_cancel(&self, request: &mut Request, report: &CancelReport) -> EngineResult<RequestStatus> {
        if report.is_success() {
            request.transition(RequestStatus::Cancelled)?;
        } else {
            // Slot stays occupied until an operator clears it
            request.transition(RequestStatus::Error)?;
        }
        Ok(request.status)
    }

    async fn report_failure(&self, request: &Request, error: &EngineError) {
        error!(
            identifier = %request.identifier,
            status = %request.status,
            kind = ?error.kind(),
            error = %error,
            "Request pipeline failed"
        );
        let notification = match error {
            EngineError::Persistence(_) => Notification::PersistenceFailure {
                message: error.public_message(),
            },
            _ => Notification::FulfillmentFailed {
                identifier: request.identifier.clone(),
                reason: error.public_message(),
                attempts: Vec::new(),
            },
        };
        self.ctx.notify(notification).await;
    }

    /// Act on one operator signal
    pub async fn handle_signal(self: &Arc<Self>, signal: ControlSignal) {
        info!(signal = ?signal, "Control signal received");
        match signal {
            ControlSignal::Enable | ControlSignal::Disable => {
                let enabled = matches!(signal, ControlSignal::Enable);
                match self.ctx.state.set_enabled(enabled) {
                    Ok(()) => {
                        self.ctx.metrics.set_engine_state(self.state_label());
                        self.ctx.notify(Notification::EnabledChanged { enabled }).await;
                    }
                    Err(e) => self.persistence_alert(&e).await,
                }
            }
            ControlSignal::Trigger { identifier } => self.trigger(identifier).await,
            ControlSignal::Diagnose => {
                let diagnostics = self.diagnostics().await;
                self.ctx.notify(Notification::Diagnostic { diagnostics }).await;
            }
            ControlSignal::Restart => {
                self.supervisor.request_recovery("operator restart");
                self.info("Session restart queued").await;
            }
            ControlSignal::Clear => match self.claims.force_clear() {
                Ok(identifier) => {
                    self.ctx.notify(Notification::SlotCleared { identifier }).await;
                }
                Err(e) => self.persistence_alert(&e).await,
            },
            ControlSignal::Monitor { minutes } => match self.supervisor.start_monitor(minutes) {
                Ok(()) => self.info(&format!("Monitoring for {minutes} minutes")).await,
                Err(e) => self.info(&format!("Cannot start monitor: {e}")).await,
            },
            ControlSignal::StopMonitor => {
                let message = if self.supervisor.stop_monitor() {
                    "Monitor stopped"
                } else {
                    "No monitor running"
                };
                self.info(message).await;
            }
        }
    }

    async fn trigger(self: &Arc<Self>, identifier: String) {
        if self.ctx.config.engine.dry_run {
            self.info("Dry run: manual trigger ignored").await;
            return;
        }
        match self.claims.reserve_manual(&identifier) {
            Ok(true) => {
                self.info(&format!("Manual fulfillment of {identifier} started")).await;
                let engine = self.clone();
                tokio::spawn(async move {
                    let mut request = Request::manual(identifier);
                    let result = match request.transition(RequestStatus::Claimed) {
                        Ok(()) => engine.fulfill(&mut request, false).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        engine.report_failure(&request, &e).await;
                    }
                });
            }
            Ok(false) => {
                let active = self.claims.active_identifier().unwrap_or_else(|| "another attempt".to_string());
                self.info(&format!("Slot busy with {active}; trigger refused")).await;
            }
            Err(e) => self.persistence_alert(&EngineError::from(e)).await,
        }
    }

    /// Snapshot for the `diagnose` signal
    pub async fn diagnostics(&self) -> Diagnostics {
        let snapshot = self.ctx.state.snapshot();
        let (dedup_records, dedup_identifiers) = self.detector.dedup_sizes();
        let probe = self.supervisor.probe().await;
        Diagnostics {
            enabled: snapshot.enabled,
            initialized: snapshot.initialized,
            dry_run: self.ctx.config.engine.dry_run,
            slot_busy: self.claims.is_busy(),
            active: self.claims.active_identifier().or(snapshot.active),
            skip_size: snapshot.skip.len(),
            dedup_records,
            dedup_identifiers,
            session_alive: probe.alive,
            page_url: probe.page_url,
            hook_alive: probe.hook_alive,
        }
    }

    async fn info(&self, message: &str) {
        self.ctx
            .notify(Notification::Info {
                message: message.to_string(),
            })
            .await;
    }

    async fn persistence_alert(&self, error: &(dyn std::fmt::Display + Sync)) {
        error!(error = %error, "State could not be persisted");
        let message = sanitize_error_message(&error.to_string());
        self.ctx
            .notify(Notification::PersistenceFailure { message })
            .await;
    }
}

/// Decide from resolved metadata whether a claimed request is handed back.
/// With neither a title nor a type nothing is known, and the claim stands.
fn metadata_verdict(metadata: &WorkMetadata) -> Option<RejectReason> {
    if metadata.title.is_none() && metadata.work_type.is_none() {
        return None;
    }
    metadata.rejection()
}
