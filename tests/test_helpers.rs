//! Test helpers and utilities for integration tests

use docrunner::config::EngineConfig;
use docrunner::testing::MockControlChannel;
use std::path::Path;
use std::time::Duration;

#[allow(dead_code)]
pub const GOOD_TITLE: &str = "A Study of Transcription Factor Binding in Yeast";

/// Minimal configuration with every file it writes kept under `dir`
#[allow(dead_code)]
pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::from_toml_str(
        r#"
[engine]
id = "integration-engine"

[board]
base_url = "https://board.example/"

[metadata]
crossref = false
openalex = false
"#,
    )
    .expect("test config should parse");
    config.engine.state_file = dir.join("state.json");
    config.engine.download_dir = dir.join("downloads");
    config.engine.snapshot_dir = dir.join("snapshots");
    config.session.storage_state = dir.join("session_state.json");
    config.board.upload.settle_ms = 0;
    config
}

/// Poll `condition` until it holds, failing the test after five seconds
#[allow(dead_code)]
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `control` has published `count` notifications of `kind`
#[allow(dead_code)]
pub async fn wait_for_kind(control: &MockControlChannel, kind: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let kinds = control.kinds().await;
        if kinds.iter().filter(|k| **k == kind).count() >= count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} x {kind}; published so far: {kinds:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
