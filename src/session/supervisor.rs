//! Session supervisor
//!
//! Owns the browser session for the whole engine lifetime: launch, login,
//! detector attachment, the background keepalive/relogin/health tasks, and
//! recovery with exponential backoff when the session dies. Recovery requests
//! from any source are funnelled through one queue and handled in order, so
//! a crash reported twice relaunches once.

use crate::backoff::BackoffPolicy;
use crate::claim::ClaimCoordinator;
use crate::config::{EngineConfig, LoginSection, SessionSection};
use crate::control::{publish_best_effort, ControlChannel, Notification};
use crate::detector::hook::HOOK_ALIVE_PROBE;
use crate::detector::EventDetector;
use crate::observability::EngineMetrics;
use crate::orchestrator::AdapterRegistry;
use crate::session::{
    capture_snapshot, AutomationSession, SessionError, SessionHandle, SessionLauncher,
};
use crate::state::StateStore;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// In-page keepalive: a HEAD of the root and a favicon GET, each aborted
/// after 800ms so a hung request never piles up
const KEEPALIVE_SCRIPT: &str = r#"(async () => {
  const ping = async (path, method) => {
    const ctrl = new AbortController();
    const timer = setTimeout(() => ctrl.abort(), 800);
    try { await fetch(path, { method, credentials: 'include', cache: 'no-store', signal: ctrl.signal }); }
    catch (e) {}
    finally { clearTimeout(timer); }
  };
  await ping('/', 'HEAD');
  await ping('/favicon.ico', 'GET');
  return true;
})()"#;

/// Outcome of one launch-until-ready cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reason: String,
    /// Launch attempts made, including the successful one
    pub attempts: u32,
    /// Delays slept before each retry
    pub delays: Vec<Duration>,
    /// False only when shutdown interrupted the cycle
    pub recovered: bool,
}

#[derive(Debug)]
struct RecoveryRequest {
    reason: String,
    /// Session generation the request refers to; `None` always recovers
    generation: Option<u64>,
}

/// What the engine knows about the live page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionProbe {
    pub alive: bool,
    pub page_url: Option<String>,
    pub hook_alive: bool,
}

pub struct SessionSupervisor {
    launcher: Arc<dyn SessionLauncher>,
    handle: SessionHandle,
    detector: Arc<EventDetector>,
    adapters: AdapterRegistry,
    claims: Arc<ClaimCoordinator>,
    state: Arc<StateStore>,
    control: Arc<dyn ControlChannel>,
    metrics: Arc<EngineMetrics>,
    session: SessionSection,
    login: LoginSection,
    base_url: String,
    credentials: Option<(String, String)>,
    navigation_timeout: Duration,
    snapshot_dir: PathBuf,
    backoff: BackoffPolicy,
    generation: AtomicU64,
    shutdown: CancellationToken,
    session_token: Mutex<Option<CancellationToken>>,
    monitor_token: Mutex<Option<CancellationToken>>,
    recovery_tx: mpsc::Sender<RecoveryRequest>,
    recovery_rx: Mutex<Option<mpsc::Receiver<RecoveryRequest>>>,
}

impl SessionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &EngineConfig,
        launcher: Arc<dyn SessionLauncher>,
        handle: SessionHandle,
        detector: Arc<EventDetector>,
        adapters: AdapterRegistry,
        claims: Arc<ClaimCoordinator>,
        state: Arc<StateStore>,
        control: Arc<dyn ControlChannel>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        let (recovery_tx, recovery_rx) = mpsc::channel(8);
        Arc::new(Self {
            launcher,
            handle,
            detector,
            adapters,
            claims,
            state,
            control,
            metrics,
            session: config.session.clone(),
            login: config.board.login.clone(),
            base_url: config.board.base_url.clone(),
            credentials: config.board_credentials(),
            navigation_timeout: Duration::from_millis(config.board.navigation_timeout_ms),
            snapshot_dir: config.engine.snapshot_dir.clone(),
            backoff: config.session.backoff.clone(),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            session_token: Mutex::new(None),
            monitor_token: Mutex::new(None),
            recovery_tx,
            recovery_rx: Mutex::new(Some(recovery_rx)),
        })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Launch the first session, retrying with backoff until it is ready
    pub async fn start(self: &Arc<Self>) -> RecoveryReport {
        self.launch_until_ready("startup").await
    }

    /// Queue a recovery. Safe to call from any task.
    pub fn request_recovery(&self, reason: impl Into<String>) {
        self.enqueue(reason.into(), None);
    }

    fn enqueue(&self, reason: String, generation: Option<u64>) {
        if let Err(e) = self.recovery_tx.try_send(RecoveryRequest { reason, generation }) {
            debug!(error = %e, "Recovery already queued");
        }
    }

    /// Handle recovery requests until shutdown
    pub async fn run(self: Arc<Self>) {
        let Some(mut requests) = self.recovery_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            warn!("Supervisor loop already running");
            return;
        };

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    let current = self.generation.load(Ordering::SeqCst);
                    if request.generation.is_some_and(|g| g != current) {
                        debug!(reason = %request.reason, "Ignoring recovery request for a replaced session");
                        continue;
                    }
                    let report = self.recover(&request.reason).await;
                    if report.recovered {
                        self.metrics.session_recovered();
                        publish_best_effort(
                            self.control.as_ref(),
                            Notification::SessionRecovered { attempts: report.attempts },
                        )
                        .await;
                    }
                }
            }
        }
        debug!("Supervisor loop stopped");
    }

    /// Tear the current session down and relaunch it
    pub async fn recover(self: &Arc<Self>, reason: &str) -> RecoveryReport {
        let span = crate::session_span!(operation = "recovery", reason = %reason);
        async {
            warn!(reason, "Recovering browser session");
            self.teardown().await;
            self.detector.reset_transient();
            self.launch_until_ready(reason).await
        }
        .instrument(span)
        .await
    }

    /// First attempt is immediate, then the backoff schedule, indefinitely
    async fn launch_until_ready(self: &Arc<Self>, reason: &str) -> RecoveryReport {
        let mut report = RecoveryReport {
            reason: reason.to_string(),
            attempts: 0,
            delays: Vec::new(),
            recovered: false,
        };

        loop {
            if report.attempts > 0 {
                let delay = self.backoff.delay_for(report.attempts);
                report.delays.push(delay);
                info!(delay_ms = delay.as_millis() as u64, attempt = report.attempts + 1, "Relaunching after delay");
                tokio::select! {
                    _ = self.shutdown.cancelled() => return report,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            report.attempts += 1;

            match self.launch_once().await {
                Ok(()) => {
                    report.recovered = true;
                    info!(attempts = report.attempts, "Browser session ready");
                    return report;
                }
                Err(e) => {
                    self.metrics.relaunch_failed();
                    error!(attempt = report.attempts, error = %e, "Session launch failed");
                }
            }
        }
    }

    async fn launch_once(self: &Arc<Self>) -> Result<(), SessionError> {
        let storage = self.session.storage_state.clone();
        let session = self
            .launcher
            .launch(storage.exists().then_some(storage.as_path()))
            .await?;
        let token = self.shutdown.child_token();

        if let Err(e) = self.bootstrap(&session, &token).await {
            token.cancel();
            capture_snapshot(session.as_ref(), &self.snapshot_dir, "launch").await;
            if let Err(close) = session.close().await {
                debug!(error = %close, "Closing failed session");
            }
            return Err(e);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut slot) = self.session_token.lock() {
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }
        self.metrics.session_launched();
        self.metrics.set_session_alive(true);

        self.spawn_crash_watch(session.clone(), generation, token.clone());
        self.spawn_keepalive(session.clone(), token.clone());
        self.spawn_relogin(session.clone(), token.clone());
        self.spawn_health_reporter(session, generation, token);
        Ok(())
    }

    async fn bootstrap(
        self: &Arc<Self>,
        session: &Arc<dyn AutomationSession>,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        self.login(session.as_ref()).await?;
        // Flows may use the page as soon as it is logged in
        self.handle.replace(Some(session.clone()));
        self.detector.attach(session.clone(), token.child_token()).await?;

        for (source, result) in self.adapters.login_all(session.as_ref()).await {
            if result.is_err() {
                capture_snapshot(session.as_ref(), &self.snapshot_dir, &format!("login-{source}")).await;
            }
        }

        if let Err(e) = session.save_storage_state(&self.session.storage_state).await {
            warn!(error = %e, "Failed to persist storage state");
        }
        if let Err(e) = self.state.set_initialized() {
            warn!(error = %e, "Failed to persist initialized flag");
        }
        Ok(())
    }

    async fn login(&self, session: &dyn AutomationSession) -> Result<(), SessionError> {
        session.goto(&self.base_url, self.navigation_timeout).await?;

        if session.exists(&self.login.username_selector).await? {
            match &self.credentials {
                Some((username, password)) => {
                    session.fill(&self.login.username_selector, username).await?;
                    session.fill(&self.login.password_selector, password).await?;
                    session
                        .click_first(
                            std::slice::from_ref(&self.login.submit_selector),
                            self.session.action_timeout(),
                        )
                        .await?;
                    info!("Submitted board login form");
                }
                None => warn!("Login form shown but no board credentials configured"),
            }
        }

        session
            .wait_for_selector(&self.login.ready_selector, self.navigation_timeout)
            .await
    }

    async fn teardown(&self) {
        if let Ok(mut slot) = self.session_token.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
        if let Ok(mut slot) = self.monitor_token.lock() {
            slot.take();
        }
        if let Some(session) = self.handle.replace(None) {
            if let Err(e) = session.close().await {
                debug!(error = %e, "Error closing session");
            }
        }
        self.metrics.set_session_alive(false);
    }

    /// Stop everything and close the browser
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.teardown().await;
        info!("Session supervisor stopped");
    }

    /// Current page and hook liveness for diagnostics
    pub async fn probe(&self) -> SessionProbe {
        let Ok(session) = self.handle.current() else {
            return SessionProbe::default();
        };
        let alive = session.health().borrow().is_alive();
        SessionProbe {
            alive,
            page_url: session.current_url().await.ok(),
            hook_alive: hook_alive(session.as_ref()).await,
        }
    }

    /// Take a screenshot every monitor interval for `minutes`
    pub fn start_monitor(self: &Arc<Self>, minutes: u64) -> Result<(), SessionError> {
        let session = self.handle.current()?;
        let parent = self
            .session_token
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or(SessionError::NoSession)?;
        let token = parent.child_token();
        if let Ok(mut slot) = self.monitor_token.lock() {
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }

        let dir = self.snapshot_dir.join("monitor");
        let interval = Duration::from_secs(self.session.monitor_interval_secs.max(1));
        let control = self.control.clone();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(minutes * 60);
        info!(minutes, "Monitor started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = ticker.tick() => {
                        if let Some(path) = capture_snapshot(session.as_ref(), &dir, "monitor").await {
                            publish_best_effort(
                                control.as_ref(),
                                Notification::Screenshot { path: path.display().to_string() },
                            )
                            .await;
                        }
                    }
                }
            }
            info!("Monitor stopped");
        });
        Ok(())
    }

    /// Returns whether a monitor was running
    pub fn stop_monitor(&self) -> bool {
        match self.monitor_token.lock().ok().and_then(|mut slot| slot.take()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn spawn_crash_watch(
        self: &Arc<Self>,
        session: Arc<dyn AutomationSession>,
        generation: u64,
        token: CancellationToken,
    ) {
        let supervisor = Arc::downgrade(self);
        let mut health = session.health();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = health.changed() => {
                        let status = health.borrow_and_update().clone();
                        if changed.is_ok() && status.is_alive() {
                            continue;
                        }
                        let Some(supervisor) = supervisor.upgrade() else { break };
                        warn!(status = ?status, "Browser session lost");
                        supervisor.metrics.set_session_alive(false);
                        supervisor.enqueue(format!("session lost: {status:?}"), Some(generation));
                        break;
                    }
                }
            }
        });
    }

    fn spawn_keepalive(self: &Arc<Self>, session: Arc<dyn AutomationSession>, token: CancellationToken) {
        let supervisor = Arc::downgrade(self);
        let (min, max) = (self.session.keepalive_min_secs, self.session.keepalive_max_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(random_interval(min, max)) => {}
                }
                let Some(supervisor) = supervisor.upgrade() else { break };
                if !supervisor.state.is_enabled() || supervisor.claims.is_busy() {
                    continue;
                }
                match session.evaluate(KEEPALIVE_SCRIPT).await {
                    Ok(_) => debug!("Keepalive sent"),
                    Err(e) => debug!(error = %e, "Keepalive failed"),
                }
            }
        });
    }

    fn spawn_relogin(self: &Arc<Self>, session: Arc<dyn AutomationSession>, token: CancellationToken) {
        let supervisor = Arc::downgrade(self);
        let (min, max) = (self.session.relogin_min_secs, self.session.relogin_max_secs);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(random_interval(min, max)) => {}
                }
                let Some(supervisor) = supervisor.upgrade() else { break };
                if supervisor.claims.is_busy() {
                    debug!("Slot busy, postponing source relogin");
                    continue;
                }
                info!("Refreshing source logins");
                supervisor.adapters.login_all(session.as_ref()).await;
            }
        });
    }

    fn spawn_health_reporter(
        self: &Arc<Self>,
        session: Arc<dyn AutomationSession>,
        generation: u64,
        token: CancellationToken,
    ) {
        let supervisor = Arc::downgrade(self);
        let period = Duration::from_secs(self.session.health_report_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(supervisor) = supervisor.upgrade() else { break };
                let session_alive = session.health().borrow().is_alive();
                let hook_alive = hook_alive(session.as_ref()).await;
                let snapshot = supervisor.state.snapshot();

                publish_best_effort(
                    supervisor.control.as_ref(),
                    Notification::HealthReport {
                        session_alive,
                        hook_alive,
                        enabled: snapshot.enabled,
                        active: snapshot.active,
                        skip_size: snapshot.skip.len(),
                    },
                )
                .await;

                if !session_alive || !hook_alive {
                    warn!(session_alive, hook_alive, "Health check failed, forcing recovery");
                    supervisor.enqueue("health check failed".to_string(), Some(generation));
                    break;
                }
            }
        });
    }
}

async fn hook_alive(session: &dyn AutomationSession) -> bool {
    matches!(
        session.evaluate(HOOK_ALIVE_PROBE).await,
        Ok(serde_json::Value::Bool(true))
    )
}

fn random_interval(min_secs: u64, max_secs: u64) -> Duration {
    let (low, high) = (min_secs.min(max_secs), min_secs.max(max_secs));
    Duration::from_secs(rand::thread_rng().gen_range(low..=high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockControlChannel, MockLauncher};
    use tempfile::TempDir;

    struct Fixture {
        supervisor: Arc<SessionSupervisor>,
        launcher: Arc<MockLauncher>,
        control: Arc<MockControlChannel>,
        _dir: TempDir,
    }

    fn fixture(launcher: MockLauncher) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::test_config();
        config.engine.snapshot_dir = dir.path().join("snapshots");
        config.session.storage_state = dir.path().join("storage.json");

        let metrics = Arc::new(EngineMetrics::new());
        let state = Arc::new(StateStore::load(dir.path().join("state.json")));
        let handle = SessionHandle::new();
        let (detector, _stream) = EventDetector::new(&config, state.clone(), metrics.clone());
        let claims = Arc::new(ClaimCoordinator::new(
            &config,
            state.clone(),
            handle.clone(),
            metrics.clone(),
        ));
        let launcher = Arc::new(launcher);
        let control = Arc::new(MockControlChannel::new());

        let supervisor = SessionSupervisor::new(
            &config,
            launcher.clone(),
            handle,
            detector,
            AdapterRegistry::new(),
            claims,
            state,
            control.clone(),
            metrics,
        );
        Fixture {
            supervisor,
            launcher,
            control,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_relaunch_backoff_schedule() {
        let f = fixture(MockLauncher::new().failing_first(3));
        let started = tokio::time::Instant::now();

        let report = f.supervisor.start().await;

        assert!(report.recovered);
        assert_eq!(report.attempts, 4);
        assert_eq!(
            report.delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20)
            ]
        );
        assert_eq!(started.elapsed(), Duration::from_secs(35));
        assert_eq!(f.launcher.launches(), 4);
        assert!(f.supervisor.handle().is_attached());
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_launch_logs_in() {
        let f = fixture(MockLauncher::new());
        let report = f.supervisor.start().await;
        assert_eq!(report.attempts, 1);
        assert!(report.delays.is_empty());

        let session = f.launcher.session(0).unwrap();
        let calls = session.calls();
        assert_eq!(calls[0], "goto:https://board.example/");
        assert!(calls.iter().any(|c| c == "wait:.requests"));
        assert!(calls.iter().any(|c| c.starts_with("bridge:")));
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_closes_old_session() {
        let f = fixture(MockLauncher::new());
        f.supervisor.start().await;

        let report = f.supervisor.recover("operator restart").await;
        assert!(report.recovered);
        assert_eq!(f.launcher.launches(), 2);
        assert!(f.launcher.session(0).unwrap().is_closed());
        assert!(!f.launcher.session(1).unwrap().is_closed());
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_crash_triggers_recovery_and_notification() {
        let f = fixture(MockLauncher::new());
        f.supervisor.start().await;
        tokio::spawn(f.supervisor.clone().run());

        f.launcher.session(0).unwrap().crash("renderer gone");

        for _ in 0..50 {
            if f.launcher.launches() == 2 && !f.control.published().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(f.launcher.launches(), 2);
        let published = f.control.published().await;
        assert!(published
            .iter()
            .any(|n| matches!(n, Notification::SessionRecovered { attempts: 1 })));
        f.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_monitor_requires_session() {
        let f = fixture(MockLauncher::new());
        assert!(f.supervisor.start_monitor(1).is_err());
        assert!(!f.supervisor.stop_monitor());

        f.supervisor.start().await;
        f.supervisor.start_monitor(1).unwrap();
        assert!(f.supervisor.stop_monitor());
        f.supervisor.shutdown().await;
    }

    #[test]
    fn test_random_interval_bounds() {
        for _ in 0..100 {
            let d = random_interval(20, 40);
            assert!(d >= Duration::from_secs(20) && d <= Duration::from_secs(40));
        }
        assert_eq!(random_interval(5, 5), Duration::from_secs(5));
    }
}
