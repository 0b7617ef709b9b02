//! Header-watermark sanitizer
//!
//! Removes repeated header logos and stamped "downloaded from" text from the
//! top band of each page. The planner in [`layout`] is pure; [`pdf`] reads
//! and rewrites the document. Rewrites go through a sibling temporary file
//! and a rename, and a second run over the output finds nothing to remove.

pub mod layout;
pub mod pdf;

use crate::config::SanitizerSection;
use crate::observability::EngineMetrics;
use crate::request::DocumentArtifact;
use layout::plan_redactions;
use pdf::PdfDocument;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sanitizer task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SanitizeOutcome {
    pub changed: bool,
    pub pages: usize,
    pub pages_modified: usize,
    pub images_removed: usize,
    pub texts_removed: usize,
}

/// Sanitize `path` in place. Blocking.
pub fn sanitize_file(path: &Path, params: &SanitizerSection) -> Result<SanitizeOutcome, SanitizeError> {
    let mut document = PdfDocument::load(path)?;
    let layouts = document.layouts();
    let plan = plan_redactions(&layouts, params);

    let mut outcome = SanitizeOutcome {
        pages: document.page_count(),
        images_removed: plan.images_removed(),
        texts_removed: plan.texts_removed(),
        ..Default::default()
    };

    if plan.is_empty() && !params.force_write {
        debug!(path = %path.display(), "No header marks found");
        return Ok(outcome);
    }

    outcome.pages_modified = document.apply(&plan)?;
    outcome.changed = outcome.pages_modified > 0;

    let temp = temp_path(path);
    if let Err(e) = document.save(&temp) {
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }
    std::fs::rename(&temp, path)?;

    info!(
        path = %path.display(),
        pages_modified = outcome.pages_modified,
        images = outcome.images_removed,
        texts = outcome.texts_removed,
        "Document sanitized"
    );
    Ok(outcome)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document.pdf".to_string());
    path.with_file_name(format!(".{name}.sanitizing"))
}

/// Async front for the pipeline; failures are soft
pub struct DocumentSanitizer {
    params: SanitizerSection,
    metrics: Arc<EngineMetrics>,
}

impl DocumentSanitizer {
    pub fn new(params: SanitizerSection, metrics: Arc<EngineMetrics>) -> Self {
        Self { params, metrics }
    }

    pub async fn sanitize_path(&self, path: &Path) -> Result<SanitizeOutcome, SanitizeError> {
        let path = path.to_path_buf();
        let params = self.params.clone();
        tokio::task::spawn_blocking(move || sanitize_file(&path, &params))
            .await
            .map_err(|e| SanitizeError::Join(e.to_string()))?
    }

    /// Sanitize the artifact, leaving it untouched on failure
    pub async fn sanitize(&self, artifact: &mut DocumentArtifact) {
        if !self.params.enabled {
            return;
        }
        match self.sanitize_path(&artifact.path).await {
            Ok(outcome) => {
                artifact.sanitized = outcome.changed;
                if outcome.changed {
                    self.metrics.document_sanitized();
                }
                if let Ok(meta) = tokio::fs::metadata(&artifact.path).await {
                    artifact.byte_size = meta.len();
                }
            }
            Err(e) => {
                self.metrics.sanitizer_failed();
                warn!(path = %artifact.path.display(), error = %e, "Sanitization failed, uploading original");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::fixtures::{write_pdf, PageSpec};
    use super::*;
    use tempfile::TempDir;

    fn logo_pages() -> Vec<PageSpec> {
        let mut pages = vec![
            PageSpec {
                logo: Some((10, 50)),
                stamp: false,
            };
            5
        ];
        pages.push(PageSpec::default());
        pages
    }

    #[test]
    fn test_recurring_logo_removed_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("paper.pdf");
        write_pdf(&path, &logo_pages());
        let params = SanitizerSection::default();

        let first = sanitize_file(&path, &params).unwrap();
        assert!(first.changed);
        assert_eq!(first.pages, 6);
        assert_eq!(first.images_removed, 5);

        let layouts = PdfDocument::load(&path).unwrap().layouts();
        assert!(layouts.iter().all(|page| page.images.is_empty()));
        assert!(layouts.iter().all(|page| page.texts.iter().any(|t| t.text == "Body text")));

        let second = sanitize_file(&path, &params).unwrap();
        assert!(!second.changed);
        assert_eq!(second.images_removed, 0);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_keyword_stamp_removed_on_single_page() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stamped.pdf");
        write_pdf(
            &path,
            &[PageSpec {
                logo: None,
                stamp: true,
            }],
        );

        let outcome = sanitize_file(&path, &SanitizerSection::default()).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.texts_removed, 1);

        let layouts = PdfDocument::load(&path).unwrap().layouts();
        assert!(!layouts[0].texts.iter().any(|t| t.text.contains("Downloaded")));
    }

    #[test]
    fn test_clean_document_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.pdf");
        write_pdf(&path, &[PageSpec::default(); 3]);
        let before = std::fs::read(&path).unwrap();

        let outcome = sanitize_file(&path, &SanitizerSection::default()).unwrap();
        assert!(!outcome.changed);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_failure_leaves_artifact_unsanitized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.4 not really").unwrap();
        let metrics = Arc::new(EngineMetrics::new());
        let sanitizer = DocumentSanitizer::new(SanitizerSection::default(), metrics.clone());

        let mut artifact = DocumentArtifact::from_path(&path).unwrap();
        sanitizer.sanitize(&mut artifact).await;
        assert!(!artifact.sanitized);
        assert_eq!(metrics.snapshot().fulfillment.sanitizer_failures, 1);
    }
}
