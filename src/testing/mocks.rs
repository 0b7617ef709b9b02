//! Mock implementations for testing
//!
//! Provides mock AutomationSession, SessionLauncher, SourceAdapter,
//! ControlChannel and MetadataProvider implementations so every flow can be
//! tested without a browser, a broker or the network.

use crate::control::{ControlChannel, ControlError, Notification};
use crate::metadata::{MetadataError, MetadataProvider, WorkMetadata};
use crate::orchestrator::{AdapterError, SourceAdapter};
use crate::session::{
    AutomationSession, FetchOutcome, NetworkEvent, SessionError, SessionHealth, SessionLauncher,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Fetch answer the board gives for a successful claim or cancel
pub fn fetch_redirect(url: &str) -> FetchOutcome {
    FetchOutcome {
        status: 200,
        ok: true,
        redirected: true,
        url: url.to_string(),
    }
}

/// Fetch answer for a refused claim or cancel
pub fn fetch_rejected(status: u16, url: &str) -> FetchOutcome {
    FetchOutcome {
        status,
        ok: false,
        redirected: false,
        url: url.to_string(),
    }
}

/// Scriptable browser page that records every call as `"<op>:<arg>"`
pub struct MockSession {
    calls: Mutex<Vec<String>>,
    default_fetch: Option<FetchOutcome>,
    fetch_routes: Vec<(String, FetchOutcome)>,
    present: HashSet<String>,
    all_present: bool,
    goto_failures: Vec<String>,
    evaluations: HashMap<String, Value>,
    bodies: Mutex<HashMap<String, String>>,
    network_tx: Mutex<Option<mpsc::Sender<NetworkEvent>>>,
    bridge_tx: Mutex<Option<mpsc::Sender<String>>>,
    health_tx: watch::Sender<SessionHealth>,
    url: Mutex<String>,
    closed: AtomicBool,
}

impl Default for MockSession {
    fn default() -> Self {
        let (health_tx, _) = watch::channel(SessionHealth::Alive);
        Self {
            calls: Mutex::new(Vec::new()),
            default_fetch: None,
            fetch_routes: Vec::new(),
            present: HashSet::new(),
            all_present: false,
            goto_failures: Vec::new(),
            evaluations: HashMap::new(),
            bodies: Mutex::new(HashMap::new()),
            network_tx: Mutex::new(None),
            bridge_tx: Mutex::new(None),
            health_tx,
            url: Mutex::new("about:blank".to_string()),
            closed: AtomicBool::new(false),
        }
    }
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every fetch without a more specific route with `outcome`
    pub fn with_default_fetch(mut self, outcome: FetchOutcome) -> Self {
        self.default_fetch = Some(outcome);
        self
    }

    /// Answer fetches whose path starts with `prefix`
    pub fn with_fetch(mut self, prefix: &str, outcome: FetchOutcome) -> Self {
        self.fetch_routes.push((prefix.to_string(), outcome));
        self
    }

    pub fn with_clickable(mut self, selector: &str) -> Self {
        self.present.insert(selector.to_string());
        self
    }

    /// Every selector matches
    pub fn with_clickable_all(mut self) -> Self {
        self.all_present = true;
        self
    }

    pub fn fail_goto_containing(mut self, fragment: &str) -> Self {
        self.goto_failures.push(fragment.to_string());
        self
    }

    /// Result of evaluating exactly `script`; other scripts yield null
    pub fn with_evaluation(mut self, script: &str, value: Value) -> Self {
        self.evaluations.insert(script.to_string(), value);
        self
    }

    pub fn with_body(self, exchange_id: &str, body: &str) -> Self {
        if let Ok(mut bodies) = self.bodies.lock() {
            bodies.insert(exchange_id.to_string(), body.to_string());
        }
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate the browser dying
    pub fn crash(&self, reason: &str) {
        self.health_tx
            .send_replace(SessionHealth::Crashed(reason.to_string()));
    }

    /// Push a network event to the detector's tap
    pub async fn emit_network(&self, event: NetworkEvent) -> bool {
        let tx = self.network_tx.lock().ok().and_then(|t| t.clone());
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Deliver a raw message as if the page called the bridge binding
    pub async fn emit_bridge(&self, raw: &str) -> bool {
        let tx = self.bridge_tx.lock().ok().and_then(|t| t.clone());
        match tx {
            Some(tx) => tx.send(raw.to_string()).await.is_ok(),
            None => false,
        }
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn matches(&self, selector: &str) -> bool {
        self.all_present || self.present.contains(selector)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AutomationSession for MockSession {
    async fn goto(&self, url: &str, _timeout: Duration) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.record(format!("goto:{url}"));
        if self.goto_failures.iter().any(|f| url.contains(f.as_str())) {
            return Err(SessionError::Navigation {
                url: url.to_string(),
                reason: "mock navigation failure".to_string(),
            });
        }
        if let Ok(mut current) = self.url.lock() {
            *current = url.to_string();
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, SessionError> {
        self.ensure_open()?;
        self.record("evaluate".to_string());
        Ok(self.evaluations.get(script).cloned().unwrap_or(Value::Null))
    }

    async fn fetch(&self, path: &str, _timeout: Duration) -> Result<FetchOutcome, SessionError> {
        self.ensure_open()?;
        self.record(format!("fetch:{path}"));
        self.fetch_routes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, outcome)| outcome.clone())
            .or_else(|| self.default_fetch.clone())
            .ok_or_else(|| SessionError::Script(format!("no mock fetch for {path}")))
    }

    async fn click_first(
        &self,
        selectors: &[String],
        _timeout: Duration,
    ) -> Result<String, SessionError> {
        self.ensure_open()?;
        match selectors.iter().find(|s| self.matches(s)) {
            Some(selector) => {
                self.record(format!("click:{selector}"));
                Ok(selector.clone())
            }
            None => Err(SessionError::ElementNotFound {
                selector: selectors.join(", "),
            }),
        }
    }

    async fn fill(&self, selector: &str, _value: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.matches(selector) {
            return Err(SessionError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        self.record(format!("fill:{selector}"));
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool, SessionError> {
        self.ensure_open()?;
        Ok(self.matches(selector))
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.record(format!("wait:{selector}"));
        if self.matches(selector) {
            Ok(())
        } else {
            Err(SessionError::ElementNotFound {
                selector: selector.to_string(),
            })
        }
    }

    async fn set_input_file(&self, selector: &str, path: &Path) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.matches(selector) {
            return Err(SessionError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        self.record(format!("upload:{}", path.display()));
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.record(format!("screenshot:{}", path.display()));
        tokio::fs::write(path, b"\x89PNG").await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        self.ensure_open()?;
        Ok(self.url.lock().map(|u| u.clone()).unwrap_or_default())
    }

    async fn network_events(&self) -> Result<mpsc::Receiver<NetworkEvent>, SessionError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(64);
        if let Ok(mut slot) = self.network_tx.lock() {
            *slot = Some(tx);
        }
        Ok(rx)
    }

    async fn response_body(&self, exchange_id: &str) -> Result<String, SessionError> {
        self.bodies
            .lock()
            .ok()
            .and_then(|b| b.get(exchange_id).cloned())
            .ok_or_else(|| {
                SessionError::Protocol("No resource with given identifier found".to_string())
            })
    }

    async fn install_bridge(
        &self,
        binding: &str,
        _script: &str,
        sink: mpsc::Sender<String>,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.record(format!("bridge:{binding}"));
        if let Ok(mut slot) = self.bridge_tx.lock() {
            *slot = Some(sink);
        }
        Ok(())
    }

    async fn save_storage_state(&self, path: &Path) -> Result<(), SessionError> {
        self.record(format!("save_state:{}", path.display()));
        Ok(())
    }

    fn health(&self) -> watch::Receiver<SessionHealth> {
        self.health_tx.subscribe()
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::SeqCst);
        self.health_tx
            .send_replace(SessionHealth::Closed("closed by supervisor".to_string()));
        self.record("close".to_string());
        Ok(())
    }
}

type SessionFactory = Box<dyn Fn() -> MockSession + Send + Sync>;

/// Launcher that hands out [`MockSession`]s, optionally failing first
pub struct MockLauncher {
    fail_first: u32,
    launches: AtomicU32,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    factory: SessionFactory,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self {
            fail_first: 0,
            launches: AtomicU32::new(0),
            sessions: Mutex::new(Vec::new()),
            factory: Box::new(|| MockSession::new().with_clickable_all()),
        }
    }
}

impl MockLauncher {
    /// Every launched page matches every selector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(mut self, failures: u32) -> Self {
        self.fail_first = failures;
        self
    }

    pub fn with_factory(mut self, factory: impl Fn() -> MockSession + Send + Sync + 'static) -> Self {
        self.factory = Box::new(factory);
        self
    }

    /// Launch attempts, failed ones included
    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// The `index`th successfully launched session
    pub fn session(&self, index: usize) -> Option<Arc<MockSession>> {
        self.sessions.lock().ok()?.get(index).cloned()
    }
}

#[async_trait]
impl SessionLauncher for MockLauncher {
    async fn launch(
        &self,
        _storage_state: Option<&Path>,
    ) -> Result<Arc<dyn AutomationSession>, SessionError> {
        let attempt = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(SessionError::Launch(format!("mock launch failure {attempt}")));
        }
        let session = Arc::new((self.factory)());
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push(session.clone());
        }
        Ok(session)
    }
}

#[derive(Debug, Clone)]
enum AdapterBehavior {
    Fail,
    Return(PathBuf),
    TransientThen(u32, PathBuf),
    Structural,
}

/// Source adapter with a fixed behavior
#[derive(Debug)]
pub struct MockAdapter {
    name: String,
    behavior: AdapterBehavior,
    downloads: AtomicU32,
    logins: AtomicU32,
}

impl MockAdapter {
    fn with_behavior(name: &str, behavior: AdapterBehavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            downloads: AtomicU32::new(0),
            logins: AtomicU32::new(0),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self::with_behavior(name, AdapterBehavior::Fail)
    }

    pub fn returning(name: &str, path: impl Into<PathBuf>) -> Self {
        Self::with_behavior(name, AdapterBehavior::Return(path.into()))
    }

    /// Fails transiently `failures` times, then returns `path`
    pub fn transient_then(name: &str, failures: u32, path: impl Into<PathBuf>) -> Self {
        Self::with_behavior(name, AdapterBehavior::TransientThen(failures, path.into()))
    }

    pub fn structural(name: &str) -> Self {
        Self::with_behavior(name, AdapterBehavior::Structural)
    }

    pub fn download_calls(&self) -> u32 {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn login(&self, _session: &dyn AutomationSession) -> Result<(), AdapterError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download(
        &self,
        _session: &dyn AutomationSession,
        _identifier: &str,
        _target_dir: &Path,
    ) -> Result<PathBuf, AdapterError> {
        let call = self.downloads.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.behavior {
            AdapterBehavior::Fail => Err(AdapterError::Failed(format!("{} has no copy", self.name))),
            AdapterBehavior::Return(path) => Ok(path.clone()),
            AdapterBehavior::TransientThen(failures, path) => {
                if call <= *failures {
                    Err(AdapterError::Transient(format!("{} busy", self.name)))
                } else {
                    Ok(path.clone())
                }
            }
            AdapterBehavior::Structural => Err(AdapterError::SiteStructure(format!(
                "{} page layout changed",
                self.name
            ))),
        }
    }
}

/// Control channel that keeps every notification
#[derive(Debug, Default)]
pub struct MockControlChannel {
    published: tokio::sync::Mutex<Vec<Notification>>,
    should_fail: bool,
}

impl MockControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub async fn published(&self) -> Vec<Notification> {
        self.published.lock().await.clone()
    }

    pub async fn kinds(&self) -> Vec<&'static str> {
        self.published.lock().await.iter().map(|n| n.kind()).collect()
    }
}

#[async_trait]
impl ControlChannel for MockControlChannel {
    async fn publish(&self, notification: &Notification) -> Result<(), ControlError> {
        if self.should_fail {
            return Err(ControlError::Publish("mock publish failure".to_string()));
        }
        self.published.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Metadata provider with a canned answer
#[derive(Debug)]
pub struct MockMetadataProvider {
    name: String,
    answer: Option<WorkMetadata>,
    delay: Duration,
}

impl MockMetadataProvider {
    pub fn new(name: &str, answer: WorkMetadata) -> Self {
        Self {
            name: name.to_string(),
            answer: Some(answer),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            answer: None,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl MetadataProvider for MockMetadataProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, _identifier: &str) -> Result<WorkMetadata, MetadataError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.answer.clone().ok_or(MetadataError::Status(503))
    }
}
