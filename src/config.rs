//! Engine configuration
//!
//! Loaded from TOML. Credentials are never stored in the file: sections name
//! the environment variables that hold them and those are resolved at runtime.

use crate::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Source adapter kinds the engine knows how to build
pub const KNOWN_SOURCE_KINDS: &[&str] = &["http"];

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub board: BoardSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub sources: SourcesSection,
    #[serde(default)]
    pub sanitizer: SanitizerSection,
    #[serde(default)]
    pub metadata: MetadataSection,
    /// MQTT control channel (optional, log-only when absent)
    pub control: Option<ControlSection>,
    /// Health HTTP server (optional)
    pub health: Option<HealthSection>,
}

/// Engine-wide switches and paths
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSection {
    /// Engine identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Detect and notify only; never claim or download
    #[serde(default)]
    pub dry_run: bool,
    /// Raise default log level to DEBUG
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Where diagnostic screenshots go
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    /// Keep downloaded documents after a successful upload
    #[serde(default)]
    pub keep_local_files: bool,
    /// Capacity of the candidate queue between detector and engine
    #[serde(default = "default_candidate_queue")]
    pub candidate_queue: usize,
    /// Capacity of the page bridge queue
    #[serde(default = "default_bridge_queue")]
    pub bridge_queue: usize,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

fn default_candidate_queue() -> usize {
    64
}

fn default_bridge_queue() -> usize {
    128
}

/// The work-request board
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardSection {
    pub base_url: String,
    /// Environment variable containing the board username
    pub username_env: Option<String>,
    /// Environment variable containing the board password
    pub password_env: Option<String>,
    #[serde(default)]
    pub login: LoginSection,
    #[serde(default = "default_claim_path")]
    pub claim_path: String,
    #[serde(default = "default_cancel_path")]
    pub cancel_path: String,
    /// Endpoints whose bodies carry `{docs: [...]}`
    #[serde(default = "default_listing_endpoints")]
    pub listing_endpoints: Vec<String>,
    /// Endpoints whose bodies carry a single request
    #[serde(default = "default_request_endpoints")]
    pub request_endpoints: Vec<String>,
    #[serde(default = "default_claim_success_prefixes")]
    pub claim_success_prefixes: Vec<String>,
    #[serde(default = "default_cancel_success_prefixes")]
    pub cancel_success_prefixes: Vec<String>,
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
    #[serde(default = "default_cancel_step_timeout_ms")]
    pub cancel_step_timeout_ms: u64,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    #[serde(default)]
    pub upload: UploadSection,
}

fn default_claim_path() -> String {
    "/take/".to_string()
}

fn default_cancel_path() -> String {
    "/refuse/".to_string()
}

fn default_listing_endpoints() -> Vec<String> {
    vec!["/requests".to_string()]
}

fn default_request_endpoints() -> Vec<String> {
    vec!["/request".to_string()]
}

fn default_claim_success_prefixes() -> Vec<String> {
    vec!["/work/".to_string(), "/requests/".to_string()]
}

fn default_cancel_success_prefixes() -> Vec<String> {
    vec!["/requests".to_string()]
}

fn default_claim_timeout_ms() -> u64 {
    10_000
}

fn default_cancel_step_timeout_ms() -> u64 {
    15_000
}

fn default_navigation_timeout_ms() -> u64 {
    30_000
}

/// Board login form
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginSection {
    #[serde(default = "default_username_selector")]
    pub username_selector: String,
    #[serde(default = "default_password_selector")]
    pub password_selector: String,
    #[serde(default = "default_submit_selector")]
    pub submit_selector: String,
    /// Present once the board has rendered the request list
    #[serde(default = "default_ready_selector")]
    pub ready_selector: String,
}

fn default_username_selector() -> String {
    "input[name=\"username\"]".to_string()
}

fn default_password_selector() -> String {
    "input[name=\"password\"]".to_string()
}

fn default_submit_selector() -> String {
    "button[type=\"submit\"]".to_string()
}

fn default_ready_selector() -> String {
    ".requests".to_string()
}

impl Default for LoginSection {
    fn default() -> Self {
        Self {
            username_selector: default_username_selector(),
            password_selector: default_password_selector(),
            submit_selector: default_submit_selector(),
            ready_selector: default_ready_selector(),
        }
    }
}

/// Submission form on a request's detail page
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSection {
    #[serde(default = "default_file_input")]
    pub file_input: String,
    /// Selectors clicked in order after the file is attached
    #[serde(default = "default_click_sequence")]
    pub click_sequence: Vec<String>,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_file_input() -> String {
    "input[type=\"file\"]".to_string()
}

fn default_click_sequence() -> Vec<String> {
    vec![
        "#progress".to_string(),
        ".signatures .remove".to_string(),
        ".clean > .button".to_string(),
        "a.submit".to_string(),
    ]
}

fn default_settle_ms() -> u64 {
    3_000
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            file_input: default_file_input(),
            click_sequence: default_click_sequence(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// Browser session and its background tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default)]
    pub headful: bool,
    pub chromium_path: Option<PathBuf>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Cookie jar persisted between launches
    #[serde(default = "default_storage_state")]
    pub storage_state: PathBuf,
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    #[serde(default = "default_keepalive_min_secs")]
    pub keepalive_min_secs: u64,
    #[serde(default = "default_keepalive_max_secs")]
    pub keepalive_max_secs: u64,
    #[serde(default = "default_relogin_min_secs")]
    pub relogin_min_secs: u64,
    #[serde(default = "default_relogin_max_secs")]
    pub relogin_max_secs: u64,
    #[serde(default = "default_health_report_secs")]
    pub health_report_secs: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Relaunch backoff after a crash
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_storage_state() -> PathBuf {
    PathBuf::from("session_state.json")
}

fn default_action_timeout_ms() -> u64 {
    10_000
}

fn default_keepalive_min_secs() -> u64 {
    20
}

fn default_keepalive_max_secs() -> u64 {
    40
}

fn default_relogin_min_secs() -> u64 {
    4 * 3600
}

fn default_relogin_max_secs() -> u64 {
    6 * 3600
}

fn default_health_report_secs() -> u64 {
    24 * 3600
}

fn default_monitor_interval_secs() -> u64 {
    30
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            headful: false,
            chromium_path: None,
            extra_args: Vec::new(),
            storage_state: default_storage_state(),
            action_timeout_ms: default_action_timeout_ms(),
            keepalive_min_secs: default_keepalive_min_secs(),
            keepalive_max_secs: default_keepalive_max_secs(),
            relogin_min_secs: default_relogin_min_secs(),
            relogin_max_secs: default_relogin_max_secs(),
            health_report_secs: default_health_report_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SessionSection {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }
}

/// Document sources and their priority
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourcesSection {
    /// Priority order of source names
    #[serde(default)]
    pub order: Vec<String>,
    /// Restrict the run to one source
    pub only: Option<String>,
    /// Tries per source, counting the first
    #[serde(default = "default_attempts_per_source")]
    pub attempts_per_source: u32,
    #[serde(default = "default_source_retry")]
    pub retry: BackoffPolicy,
    #[serde(default)]
    pub adapters: HashMap<String, SourceConfig>,
}

fn default_attempts_per_source() -> u32 {
    2
}

fn default_source_retry() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(10))
}

impl Default for SourcesSection {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            only: None,
            attempts_per_source: default_attempts_per_source(),
            retry: default_source_retry(),
            adapters: HashMap::new(),
        }
    }
}

impl SourcesSection {
    /// Ordered names of the sources a run should try
    pub fn effective_order(&self) -> Vec<String> {
        if let Some(only) = &self.only {
            return vec![only.clone()];
        }
        self.order
            .iter()
            .filter(|name| self.adapters.get(*name).map_or(true, |a| a.enabled))
            .cloned()
            .collect()
    }

    /// Retry policy bounded by `attempts_per_source`
    pub fn retry_policy(&self) -> BackoffPolicy {
        self.retry
            .clone()
            .with_max_attempts(Some(self.attempts_per_source.saturating_sub(1)))
    }
}

/// One document source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Adapter implementation (see [`KNOWN_SOURCE_KINDS`])
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// URL with an `{identifier}` placeholder
    pub url_template: Option<String>,
    /// Probed on login; any 2xx/3xx counts as reachable
    pub login_url: Option<String>,
    pub username_env: Option<String>,
    pub password_env: Option<String>,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_source_timeout_secs() -> u64 {
    120
}

/// Header-watermark redaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SanitizerSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_header_band_pt")]
    pub header_band_pt: f32,
    #[serde(default = "default_max_image_height_pt")]
    pub max_image_height_pt: f32,
    #[serde(default = "default_max_image_width_ratio")]
    pub max_image_width_ratio: f32,
    #[serde(default = "default_min_repetition_ratio")]
    pub min_repetition_ratio: f32,
    #[serde(default = "default_min_repeating_pages")]
    pub min_repeating_pages: usize,
    /// Median image centre must sit within band * factor
    #[serde(default = "default_near_top_factor")]
    pub near_top_factor: f32,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_true")]
    pub include_first_page: bool,
    /// Rewrite the file even when nothing was removed
    #[serde(default)]
    pub force_write: bool,
}

fn default_header_band_pt() -> f32 {
    70.0
}

fn default_max_image_height_pt() -> f32 {
    95.0
}

fn default_max_image_width_ratio() -> f32 {
    0.85
}

fn default_min_repetition_ratio() -> f32 {
    0.40
}

fn default_min_repeating_pages() -> usize {
    3
}

fn default_near_top_factor() -> f32 {
    1.25
}

fn default_keywords() -> Vec<String> {
    ["downloaded from", "iranpaper", "tarjomano", "joopy", "ترجمانو"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SanitizerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            header_band_pt: default_header_band_pt(),
            max_image_height_pt: default_max_image_height_pt(),
            max_image_width_ratio: default_max_image_width_ratio(),
            min_repetition_ratio: default_min_repetition_ratio(),
            min_repeating_pages: default_min_repeating_pages(),
            near_top_factor: default_near_top_factor(),
            keywords: default_keywords(),
            include_first_page: true,
            force_write: false,
        }
    }
}

/// Bibliographic metadata providers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataSection {
    #[serde(default = "default_true")]
    pub crossref: bool,
    #[serde(default = "default_true")]
    pub openalex: bool,
    #[serde(default = "default_metadata_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_crossref_base_url")]
    pub crossref_base_url: String,
    #[serde(default = "default_openalex_base_url")]
    pub openalex_base_url: String,
}

fn default_metadata_timeout_secs() -> u64 {
    8
}

fn default_user_agent() -> String {
    format!("docrunner/{}", env!("CARGO_PKG_VERSION"))
}

fn default_crossref_base_url() -> String {
    "https://api.crossref.org".to_string()
}

fn default_openalex_base_url() -> String {
    "https://api.openalex.org".to_string()
}

impl Default for MetadataSection {
    fn default() -> Self {
        Self {
            crossref: true,
            openalex: true,
            timeout_secs: default_metadata_timeout_secs(),
            user_agent: default_user_agent(),
            crossref_base_url: default_crossref_base_url(),
            openalex_base_url: default_openalex_base_url(),
        }
    }
}

/// MQTT control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_reconnect_policy")]
    pub reconnect: BackoffPolicy,
}

fn default_topic_prefix() -> String {
    "/docrunner".to_string()
}

fn default_reconnect_policy() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(5))
}

/// Health HTTP server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid engine ID format: {0}")]
    InvalidEngineId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_engine_id(&self.engine.id)?;

        url::Url::parse(&self.board.base_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("board.base_url '{}': {e}", self.board.base_url))
        })?;

        for (name, policy) in [
            ("session.backoff", &self.session.backoff),
            ("sources.retry", &self.sources.retry),
        ] {
            policy
                .validate()
                .map_err(|e| ConfigError::InvalidConfig(format!("{name}: {e}")))?;
        }

        if self.session.keepalive_min_secs > self.session.keepalive_max_secs {
            return Err(ConfigError::InvalidConfig(
                "session.keepalive_min_secs exceeds keepalive_max_secs".to_string(),
            ));
        }
        if self.session.relogin_min_secs > self.session.relogin_max_secs {
            return Err(ConfigError::InvalidConfig(
                "session.relogin_min_secs exceeds relogin_max_secs".to_string(),
            ));
        }

        for (name, ratio) in [
            ("max_image_width_ratio", self.sanitizer.max_image_width_ratio),
            ("min_repetition_ratio", self.sanitizer.min_repetition_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "sanitizer.{name} must be in (0, 1], got {ratio}"
                )));
            }
        }

        if self.sources.attempts_per_source == 0 {
            return Err(ConfigError::InvalidConfig(
                "sources.attempts_per_source must be at least 1".to_string(),
            ));
        }
        for (name, source) in &self.sources.adapters {
            if source.enabled && !KNOWN_SOURCE_KINDS.contains(&source.kind.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "source '{name}' has unknown kind '{}'",
                    source.kind
                )));
            }
        }

        if let Some(control) = &self.control {
            control
                .reconnect
                .validate()
                .map_err(|e| ConfigError::InvalidConfig(format!("control.reconnect: {e}")))?;
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Helper method to get environment variable with error propagation
    pub fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Board credentials, when both variables are configured and set
    pub fn board_credentials(&self) -> Option<(String, String)> {
        let username = Self::get_env_var_optional(self.board.username_env.as_ref())?;
        let password = Self::get_env_var_optional(self.board.password_env.as_ref())?;
        Some((username, password))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[engine]
id = "test-engine"

[board]
base_url = "https://board.example/"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate engine ID format
fn validate_engine_id(engine_id: &str) -> Result<(), ConfigError> {
    let valid_chars = engine_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if engine_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidEngineId(format!(
            "Engine ID '{engine_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = EngineConfig::test_config();

        assert_eq!(config.engine.id, "test-engine");
        assert!(!config.engine.dry_run);
        assert_eq!(config.engine.state_file, PathBuf::from("state.json"));
        assert_eq!(config.board.claim_path, "/take/");
        assert_eq!(config.board.cancel_path, "/refuse/");
        assert_eq!(
            config.board.claim_success_prefixes,
            vec!["/work/".to_string(), "/requests/".to_string()]
        );
        assert_eq!(config.session.backoff.initial_ms, 5_000);
        assert_eq!(config.session.backoff.max_ms, 60_000);
        assert_eq!(config.sanitizer.header_band_pt, 70.0);
        assert_eq!(config.sanitizer.keywords.len(), 5);
        assert_eq!(config.metadata.timeout_secs, 8);
        assert!(config.control.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let toml_content = r##"
[engine]
id = "runner-1"
dry_run = true
debug = true
keep_local_files = true

[board]
base_url = "https://board.example/"
username_env = "BOARD_USER"
password_env = "BOARD_PASS"
claim_success_prefixes = ["/work/"]

[board.upload]
click_sequence = ["#go"]

[session]
headful = true
keepalive_min_secs = 5
keepalive_max_secs = 6

[session.backoff]
initial_ms = 1000
max_ms = 8000

[sources]
order = ["primary", "mirror"]
attempts_per_source = 3

[sources.adapters.primary]
kind = "http"
url_template = "https://primary.example/{identifier}.pdf"

[sources.adapters.mirror]
kind = "http"
enabled = false
url_template = "https://mirror.example/get?doi={identifier}"

[sanitizer]
header_band_pt = 60.0
keywords = ["watermark"]

[control]
broker_url = "mqtt://localhost:1883"

[health]
port = 9090
"##;

        let config = EngineConfig::from_toml_str(toml_content).unwrap();
        assert!(config.engine.dry_run);
        assert_eq!(config.board.upload.click_sequence, vec!["#go".to_string()]);
        assert_eq!(config.board.upload.file_input, "input[type=\"file\"]");
        assert_eq!(config.session.backoff.max_ms, 8000);
        assert_eq!(config.sources.effective_order(), vec!["primary".to_string()]);
        assert_eq!(config.sources.retry_policy().max_attempts, Some(2));
        assert_eq!(config.sanitizer.keywords, vec!["watermark".to_string()]);
        assert_eq!(config.control.unwrap().topic_prefix, "/docrunner");
        assert_eq!(config.health.unwrap().port, 9090);
    }

    #[test]
    fn test_only_source_overrides_order() {
        let mut sources = SourcesSection {
            order: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        sources.only = Some("b".to_string());
        assert_eq!(sources.effective_order(), vec!["b".to_string()]);
    }

    #[test]
    fn test_invalid_engine_id() {
        assert!(validate_engine_id("invalid@engine").is_err());
        assert!(validate_engine_id("").is_err());
        assert!(validate_engine_id("valid-engine_1.0").is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::test_config();
        config.sanitizer.min_repetition_ratio = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        let mut config = EngineConfig::test_config();
        config.board.base_url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::test_config();
        config.session.backoff.initial_ms = 120_000;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::test_config();
        config.sources.adapters.insert(
            "weird".to_string(),
            SourceConfig {
                kind: "ftp".to_string(),
                enabled: true,
                url_template: None,
                login_url: None,
                username_env: None,
                password_env: None,
                timeout_secs: 10,
                headers: HashMap::new(),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_required_section() {
        let result = EngineConfig::from_toml_str("[engine]\nid = \"x\"\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_board_credentials_require_both_vars() {
        let mut config = EngineConfig::test_config();
        config.board.username_env = Some("DOCRUNNER_TEST_USER_UNSET".to_string());
        config.board.password_env = Some("DOCRUNNER_TEST_PASS_UNSET".to_string());
        assert!(config.board_credentials().is_none());
    }
}
