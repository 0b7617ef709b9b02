//! End-to-end lifecycle tests
//!
//! The engine runs against a mock browser and a real HTTP source served by
//! wiremock: detection on the network tap, the claim race, download,
//! sanitizing and upload, plus session recovery driven by crashes and
//! operator signals.

mod test_helpers;

use docrunner::config::{EngineConfig, SourceConfig};
use docrunner::context::EngineContext;
use docrunner::control::{ControlSignal, Notification};
use docrunner::engine::Engine;
use docrunner::metadata::MetadataResolver;
use docrunner::orchestrator::AdapterRegistry;
use docrunner::session::NetworkEvent;
use docrunner::testing::fixtures::{write_pdf, PageSpec};
use docrunner::testing::{fetch_redirect, MockControlChannel, MockLauncher, MockSession};
use docrunner::EngineResult;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_helpers::{eventually, wait_for_kind, GOOD_TITLE};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const IDENTIFIER: &str = "10.1000/xyz.42";

struct Harness {
    engine: Arc<Engine>,
    launcher: Arc<MockLauncher>,
    control: Arc<MockControlChannel>,
    signals: mpsc::Sender<ControlSignal>,
    runner: JoinHandle<EngineResult<()>>,
    _dir: TempDir,
}

impl Harness {
    async fn start(dir: TempDir, config: EngineConfig) -> Self {
        let launcher = Arc::new(MockLauncher::new().with_factory(board_page));
        let control = Arc::new(MockControlChannel::new());
        let adapters = AdapterRegistry::from_config(&config.sources).unwrap();
        let resolver = MetadataResolver::new(Vec::new(), Duration::from_secs(1));

        let ctx = EngineContext::from_config(config, control.clone());
        let engine = Engine::new(ctx, launcher.clone(), adapters, resolver);
        let (signals, signal_rx) = mpsc::channel(8);
        let runner = tokio::spawn(engine.clone().run(signal_rx));

        let harness = Self {
            engine,
            launcher,
            control,
            signals,
            runner,
            _dir: dir,
        };
        harness.wait_for_page(0).await;
        harness
    }

    /// Wait until the `index`th page is up with the detector attached
    async fn wait_for_page(&self, index: usize) {
        eventually("board page ready", || {
            self.launcher
                .session(index)
                .is_some_and(|s| !s.calls_with_prefix("bridge:").is_empty())
        })
        .await;
    }

    fn page(&self, index: usize) -> Arc<MockSession> {
        self.launcher.session(index).unwrap()
    }

    async fn stop(self) {
        self.engine.shutdown().await;
        self.runner.await.unwrap().unwrap();
    }
}

/// A board page where every claim wins and every selector exists
fn board_page() -> MockSession {
    MockSession::new()
        .with_clickable_all()
        .with_default_fetch(fetch_redirect("https://board.example/work/10.1000%2Fxyz.42"))
        .with_body(
            "listing-1",
            &serde_json::json!({
                "docs": [{
                    "_id": "rec-1",
                    "doi": IDENTIFIER,
                    "title": GOOD_TITLE,
                    "request": {"from": "reader", "reward": "2"}
                }]
            })
            .to_string(),
        )
}

async fn serve_pdf(server: &MockServer, dir: &TempDir) {
    let pdf = dir.path().join("source.pdf");
    write_pdf(
        &pdf,
        &[PageSpec {
            logo: None,
            stamp: true,
        }],
    );
    Mock::given(method("GET"))
        .and(path("/pdf/10.1000%2Fxyz.42"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(std::fs::read(&pdf).unwrap()))
        .mount(server)
        .await;
}

fn with_source(config: &mut EngineConfig, server: &MockServer) {
    config.sources.order = vec!["mirror".to_string()];
    config.sources.adapters.insert(
        "mirror".to_string(),
        SourceConfig {
            kind: "http".to_string(),
            enabled: true,
            url_template: Some(format!("{}/pdf/{{identifier_encoded}}", server.uri())),
            login_url: None,
            username_env: None,
            password_env: None,
            timeout_secs: 5,
            headers: Default::default(),
        },
    );
}

async fn announce_listing(page: &MockSession) {
    assert!(
        page.emit_network(NetworkEvent::ResponseStarted {
            exchange_id: "listing-1".to_string(),
            url: "https://board.example/api/requests?page=1".to_string(),
        })
        .await
    );
    assert!(
        page.emit_network(NetworkEvent::BodyAvailable {
            exchange_id: "listing-1".to_string(),
        })
        .await
    );
}

#[tokio::test]
async fn test_detected_request_is_fulfilled_end_to_end() {
    let dir = TempDir::new().unwrap();
    let server = MockServer::start().await;
    serve_pdf(&server, &dir).await;
    let mut config = test_helpers::test_config(dir.path());
    with_source(&mut config, &server);

    let harness = Harness::start(dir, config).await;
    let page = harness.page(0);
    announce_listing(&page).await;

    wait_for_kind(&harness.control, "fulfillment_succeeded", 1).await;
    assert_eq!(
        harness.control.kinds().await,
        vec![
            "candidate_found",
            "fulfillment_started",
            "download_succeeded",
            "fulfillment_succeeded"
        ]
    );
    let published = harness.control.published().await;
    assert!(matches!(
        &published[3],
        Notification::FulfillmentSucceeded { identifier, source, sanitized: true }
            if identifier == IDENTIFIER && source == "mirror"
    ));

    assert_eq!(page.calls_with_prefix("fetch:"), vec!["fetch:/take/10.1000%2Fxyz.42"]);
    assert_eq!(page.calls_with_prefix("upload:").len(), 1);
    let ctx = harness.engine.context();
    assert!(ctx.state.is_skipped(IDENTIFIER));
    assert!(ctx.state.active().is_none());
    assert!(!harness.engine.claims().is_busy());

    harness.stop().await;
}

#[tokio::test]
async fn test_same_request_on_both_channels_is_handled_once() {
    let dir = TempDir::new().unwrap();
    let mut config = test_helpers::test_config(dir.path());
    config.engine.dry_run = true;

    let harness = Harness::start(dir, config).await;
    let page = harness.page(0);
    announce_listing(&page).await;
    wait_for_kind(&harness.control, "candidate_found", 1).await;

    let hook_copy = format!(
        r#"{{"kind":"listing","docs":[{{"_id":"rec-1","doi":"{IDENTIFIER}","title":"{GOOD_TITLE}"}}]}}"#
    );
    assert!(page.emit_bridge(&hook_copy).await);
    assert!(
        page.emit_bridge(r#"{"kind":"request_doc","doc":{"doi":"10.1000/other","title":"Another Long Enough Title About Proteins"}}"#)
            .await
    );
    wait_for_kind(&harness.control, "candidate_found", 2).await;

    let identifiers: Vec<String> = harness
        .control
        .published()
        .await
        .into_iter()
        .filter_map(|n| match n {
            Notification::CandidateFound { identifier, .. } => Some(identifier),
            _ => None,
        })
        .collect();
    assert_eq!(identifiers, vec![IDENTIFIER, "10.1000/other"]);
    assert!(page.calls_with_prefix("fetch:").is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_crashed_session_is_relaunched() {
    let dir = TempDir::new().unwrap();
    let config = test_helpers::test_config(dir.path());

    let harness = Harness::start(dir, config).await;
    harness.page(0).crash("renderer gone");

    wait_for_kind(&harness.control, "session_recovered", 1).await;
    harness.wait_for_page(1).await;
    assert!(harness.page(0).is_closed());
    assert_eq!(harness.launcher.launches(), 2);
    assert!(harness.engine.context().session.is_attached());

    harness.stop().await;
}

#[tokio::test]
async fn test_operator_signals_drive_the_engine() {
    let dir = TempDir::new().unwrap();
    let config = test_helpers::test_config(dir.path());

    let harness = Harness::start(dir, config).await;

    harness.signals.send(ControlSignal::Disable).await.unwrap();
    wait_for_kind(&harness.control, "enabled_changed", 1).await;
    assert!(!harness.engine.context().state.is_enabled());

    harness.signals.send(ControlSignal::Restart).await.unwrap();
    wait_for_kind(&harness.control, "session_recovered", 1).await;
    harness.wait_for_page(1).await;
    assert!(harness.page(0).is_closed());

    harness.signals.send(ControlSignal::Diagnose).await.unwrap();
    wait_for_kind(&harness.control, "diagnostic", 1).await;
    let diagnostics = harness
        .control
        .published()
        .await
        .into_iter()
        .find_map(|n| match n {
            Notification::Diagnostic { diagnostics } => Some(diagnostics),
            _ => None,
        })
        .unwrap();
    assert!(!diagnostics.enabled);
    assert!(diagnostics.session_alive);
    assert!(!diagnostics.slot_busy);

    harness.stop().await;
}
