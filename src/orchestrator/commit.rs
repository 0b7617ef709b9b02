//! Fulfillment committer: submits the document on the request's detail page

use crate::config::{EngineConfig, UploadSection};
use crate::orchestrator::adapter::file_stem_for;
use crate::request::{DocumentArtifact, Request};
use crate::session::{
    absolute_url, capture_snapshot, AutomationSession, SessionError, SessionHandle,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct FulfillmentCommitter {
    session: SessionHandle,
    base_url: String,
    upload: UploadSection,
    navigation_timeout: Duration,
    action_timeout: Duration,
    snapshot_dir: PathBuf,
    keep_local_files: bool,
}

impl FulfillmentCommitter {
    pub fn new(config: &EngineConfig, session: SessionHandle) -> Self {
        Self {
            session,
            base_url: config.board.base_url.clone(),
            upload: config.board.upload.clone(),
            navigation_timeout: Duration::from_millis(config.board.navigation_timeout_ms),
            action_timeout: config.session.action_timeout(),
            snapshot_dir: config.engine.snapshot_dir.clone(),
            keep_local_files: config.engine.keep_local_files,
        }
    }

    /// Attach `artifact` to the request's submission form and submit it
    ///
    /// A failure leaves a screenshot behind; the caller runs the cancellation
    /// fallback.
    pub async fn commit(
        &self,
        request: &Request,
        artifact: &DocumentArtifact,
    ) -> Result<(), SessionError> {
        let session = self.session.current()?;
        let result = self.submit(session.as_ref(), request, artifact).await;

        if let Err(e) = &result {
            warn!(identifier = %request.identifier, error = %e, "Submission failed");
            let label = format!("upload-{}", file_stem_for(&request.identifier));
            capture_snapshot(session.as_ref(), &self.snapshot_dir, &label).await;
        }
        result
    }

    async fn submit(
        &self,
        session: &dyn AutomationSession,
        request: &Request,
        artifact: &DocumentArtifact,
    ) -> Result<(), SessionError> {
        let detail_url = absolute_url(&self.base_url, &request.detail);
        info!(identifier = %request.identifier, url = %detail_url, "Opening request for submission");
        session.goto(&detail_url, self.navigation_timeout).await?;

        session
            .wait_for_selector(&self.upload.file_input, self.action_timeout)
            .await?;
        session
            .set_input_file(&self.upload.file_input, &artifact.path)
            .await?;
        debug!(path = %artifact.path.display(), "Document attached");

        for selector in &self.upload.click_sequence {
            session
                .click_first(std::slice::from_ref(selector), self.action_timeout)
                .await?;
        }

        tokio::time::sleep(Duration::from_millis(self.upload.settle_ms)).await;
        info!(
            identifier = %request.identifier,
            bytes = artifact.byte_size,
            sanitized = artifact.sanitized,
            "Document submitted"
        );
        Ok(())
    }

    /// Remove the local copy unless configured to keep it
    pub async fn cleanup(&self, artifact: &DocumentArtifact) {
        if self.keep_local_files {
            return;
        }
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => debug!(path = %artifact.path.display(), "Local document removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %artifact.path.display(), error = %e, "Failed to remove local document"),
        }
    }
}
