//! Automation session abstraction
//!
//! The engine drives exactly one browser page. Everything that touches it goes
//! through [`AutomationSession`], so the claim, download, cancel and upload
//! flows are testable against [`crate::testing::mocks::MockSession`] and the
//! Chromium implementation stays in one place.

pub mod chromium;
pub mod supervisor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub use chromium::{find_chromium, ChromiumLauncher};
pub use supervisor::{RecoveryReport, SessionSupervisor};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },
    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("No element matched selector(s): {selector}")]
    ElementNotFound { selector: String },
    #[error("Script evaluation failed: {0}")]
    Script(String),
    #[error("Browser protocol error: {0}")]
    Protocol(String),
    #[error("Session is closed")]
    Closed,
    #[error("No active session")]
    NoSession,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Timeouts and dropped connections are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Timeout { .. } | SessionError::Navigation { .. }
        )
    }

    /// The page no longer has the shape the workflow expects
    pub fn is_structural(&self) -> bool {
        matches!(self, SessionError::ElementNotFound { .. })
    }
}

/// Liveness of the underlying browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHealth {
    Alive,
    Crashed(String),
    Closed(String),
}

impl SessionHealth {
    pub fn is_alive(&self) -> bool {
        matches!(self, SessionHealth::Alive)
    }
}

/// Network lifecycle notifications correlated by exchange id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Response headers arrived for `url`
    ResponseStarted { exchange_id: String, url: String },
    /// The response body for `exchange_id` is fully available
    BodyAvailable { exchange_id: String },
}

/// Result of a fetch issued from inside the page with redirects not followed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub status: u16,
    pub ok: bool,
    pub redirected: bool,
    /// Landing URL as reported by the page
    pub url: String,
}

impl FetchOutcome {
    /// Path component of the landing URL
    pub fn landing_path(&self) -> String {
        url::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| {
                let without_query = self.url.split(['?', '#']).next().unwrap_or_default();
                without_query.to_string()
            })
    }
}

/// One browser page, shared by every flow in the engine
#[async_trait]
pub trait AutomationSession: Send + Sync {
    /// Navigate to `url` (absolute, or relative to the board)
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), SessionError>;

    /// Evaluate a JavaScript expression, awaiting promises
    async fn evaluate(&self, script: &str) -> Result<Value, SessionError>;

    /// Issue a credentialed GET from the page without following redirects
    async fn fetch(&self, path: &str, timeout: Duration) -> Result<FetchOutcome, SessionError>;

    /// Click the first selector that matches; returns the selector used
    async fn click_first(
        &self,
        selectors: &[String],
        timeout: Duration,
    ) -> Result<String, SessionError>;

    async fn fill(&self, selector: &str, value: &str) -> Result<(), SessionError>;

    async fn exists(&self, selector: &str) -> Result<bool, SessionError>;

    async fn wait_for_selector(&self, selector: &str, timeout: Duration)
        -> Result<(), SessionError>;

    async fn set_input_file(&self, selector: &str, path: &Path) -> Result<(), SessionError>;

    async fn screenshot(&self, path: &Path) -> Result<(), SessionError>;

    async fn current_url(&self) -> Result<String, SessionError>;

    /// Start streaming network lifecycle events
    async fn network_events(&self) -> Result<mpsc::Receiver<NetworkEvent>, SessionError>;

    /// Read the body of a finished exchange
    async fn response_body(&self, exchange_id: &str) -> Result<String, SessionError>;

    /// Expose `binding` to the page, run `script` in every new document and
    /// forward each string the page passes to the binding into `sink`
    async fn install_bridge(
        &self,
        binding: &str,
        script: &str,
        sink: mpsc::Sender<String>,
    ) -> Result<(), SessionError>;

    /// Persist cookies so a relaunch can resume the login
    async fn save_storage_state(&self, path: &Path) -> Result<(), SessionError>;

    fn health(&self) -> watch::Receiver<SessionHealth>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Creates fresh sessions for the supervisor
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(
        &self,
        storage_state: Option<&Path>,
    ) -> Result<Arc<dyn AutomationSession>, SessionError>;
}

/// Shared handle to whatever session the supervisor currently owns
#[derive(Clone, Default)]
pub struct SessionHandle {
    current: Arc<RwLock<Option<Arc<dyn AutomationSession>>>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle already pointing at `session`
    pub fn with_session(session: Arc<dyn AutomationSession>) -> Self {
        let handle = Self::new();
        handle.replace(Some(session));
        handle
    }

    pub fn current(&self) -> Result<Arc<dyn AutomationSession>, SessionError> {
        self.current
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(SessionError::NoSession)
    }

    pub fn is_attached(&self) -> bool {
        self.current.read().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Swap in a new session, returning the previous one
    pub fn replace(
        &self,
        session: Option<Arc<dyn AutomationSession>>,
    ) -> Option<Arc<dyn AutomationSession>> {
        match self.current.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, session),
            Err(_) => None,
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Resolve a board-relative link against `base`
pub fn absolute_url(base: &str, link: &str) -> String {
    if link.starts_with("http://") || link.starts_with("https://") {
        return link.to_string();
    }
    match url::Url::parse(base).and_then(|b| b.join(link)) {
        Ok(u) => u.to_string(),
        Err(_) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            link.trim_start_matches('/')
        ),
    }
}

/// Best-effort diagnostic screenshot into `dir`, named after `label`
pub async fn capture_snapshot(
    session: &dyn AutomationSession,
    dir: &Path,
    label: &str,
) -> Option<PathBuf> {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!(dir = %dir.display(), error = %e, "Cannot create snapshot directory");
        return None;
    }
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("{label}-{stamp}.png"));
    match session.screenshot(&path).await {
        Ok(()) => {
            info!(path = %path.display(), "Diagnostic screenshot saved");
            Some(path)
        }
        Err(e) => {
            warn!(error = %e, "Diagnostic screenshot failed");
            None
        }
    }
}
