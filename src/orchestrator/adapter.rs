//! Document source adapters
//!
//! An adapter logs in to one source and downloads a document for an
//! identifier. Adapters are stateless between calls; the registry resolves
//! the configured source names to instances.

use crate::config::{SourceConfig, SourcesSection};
use crate::session::{AutomationSession, SessionError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Timeouts, dropped connections, 5xx: retried with backoff
    #[error("transient failure: {0}")]
    Transient(String),
    /// An element the workflow expects is missing: no retry, screenshot
    #[error("site structure changed: {0}")]
    SiteStructure(String),
    #[error("{0}")]
    Failed(String),
    #[error("adapter configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, AdapterError::SiteStructure(_))
    }
}

impl From<SessionError> for AdapterError {
    fn from(error: SessionError) -> Self {
        if error.is_transient() {
            AdapterError::Transient(error.to_string())
        } else if error.is_structural() {
            AdapterError::SiteStructure(error.to_string())
        } else {
            AdapterError::Failed(error.to_string())
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            AdapterError::Transient(error.to_string())
        } else {
            AdapterError::Failed(error.to_string())
        }
    }
}

/// Fixed contract every document source implements
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn login(&self, session: &dyn AutomationSession) -> Result<(), AdapterError>;

    /// Download the document for `identifier` into `target_dir`
    async fn download(
        &self,
        session: &dyn AutomationSession,
        identifier: &str,
        target_dir: &Path,
    ) -> Result<PathBuf, AdapterError>;
}

/// Filesystem-safe stem for an identifier
pub fn file_stem_for(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Downloads over HTTP from a URL template
///
/// `{identifier}` is substituted verbatim, `{identifier_encoded}` fully
/// percent-encoded.
pub struct HttpTemplateAdapter {
    name: String,
    url_template: String,
    login_url: Option<String>,
    credentials: Option<(String, String)>,
    client: reqwest::Client,
}

impl HttpTemplateAdapter {
    pub fn from_config(name: &str, config: &SourceConfig) -> Result<Self, AdapterError> {
        let url_template = config
            .url_template
            .clone()
            .ok_or_else(|| AdapterError::Config(format!("source '{name}' has no url_template")))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let header_name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| AdapterError::Config(format!("header '{key}': {e}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| AdapterError::Config(format!("header '{key}': {e}")))?;
            headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| AdapterError::Config(e.to_string()))?;

        let credentials = config.username_env.as_ref().and_then(|user_env| {
            let username = std::env::var(user_env).ok()?;
            let password = config
                .password_env
                .as_ref()
                .and_then(|env| std::env::var(env).ok())
                .unwrap_or_default();
            Some((username, password))
        });

        Ok(Self {
            name: name.to_string(),
            url_template,
            login_url: config.login_url.clone(),
            credentials,
            client,
        })
    }

    pub fn url_for(&self, identifier: &str) -> String {
        self.url_template
            .replace("{identifier_encoded}", &urlencoding::encode(identifier))
            .replace("{identifier}", identifier)
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.credentials {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }
}

#[async_trait]
impl SourceAdapter for HttpTemplateAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn login(&self, _session: &dyn AutomationSession) -> Result<(), AdapterError> {
        let Some(login_url) = &self.login_url else {
            return Ok(());
        };

        let response = self.request(login_url).send().await?;
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            debug!(source = %self.name, status = status.as_u16(), "Source reachable");
            Ok(())
        } else if status.is_server_error() {
            Err(AdapterError::Transient(format!("login probe returned {status}")))
        } else {
            Err(AdapterError::Failed(format!("login probe returned {status}")))
        }
    }

    async fn download(
        &self,
        _session: &dyn AutomationSession,
        identifier: &str,
        target_dir: &Path,
    ) -> Result<PathBuf, AdapterError> {
        let url = self.url_for(identifier);
        debug!(source = %self.name, url = %url, "Downloading document");

        let response = self.request(&url).send().await?;
        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(AdapterError::Transient(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(AdapterError::Failed(format!("{url} returned {status}")));
        }

        let body = response.bytes().await?;
        if !body.starts_with(b"%PDF") {
            return Err(AdapterError::Failed(format!(
                "{url} did not return a PDF ({} bytes)",
                body.len()
            )));
        }

        tokio::fs::create_dir_all(target_dir).await?;
        let path = target_dir.join(format!("{}.pdf", file_stem_for(identifier)));
        tokio::fs::write(&path, &body).await?;
        info!(source = %self.name, path = %path.display(), bytes = body.len(), "Document downloaded");
        Ok(path)
    }
}

/// Source name to adapter lookup
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every enabled source table
    pub fn from_config(sources: &SourcesSection) -> Result<Self, AdapterError> {
        let mut registry = Self::new();
        for (name, config) in &sources.adapters {
            if !config.enabled {
                debug!(source = %name, "Source disabled");
                continue;
            }
            let adapter: Arc<dyn SourceAdapter> = match config.kind.as_str() {
                "http" => Arc::new(HttpTemplateAdapter::from_config(name, config)?),
                other => {
                    return Err(AdapterError::Config(format!(
                        "source '{name}' has unknown kind '{other}'"
                    )))
                }
            };
            registry.register(adapter);
        }
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Log in to every adapter; failures are reported, never fatal
    pub async fn login_all(
        &self,
        session: &dyn AutomationSession,
    ) -> Vec<(String, Result<(), AdapterError>)> {
        let mut names: Vec<&String> = self.adapters.keys().collect();
        names.sort();

        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let result = self.adapters[name].login(session).await;
            if let Err(e) = &result {
                warn!(source = %name, error = %e, "Source login failed");
            }
            results.push((name.clone(), result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockSession;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_config(template: String) -> SourceConfig {
        SourceConfig {
            kind: "http".to_string(),
            enabled: true,
            url_template: Some(template),
            login_url: None,
            username_env: None,
            password_env: None,
            timeout_secs: 5,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_url_template_substitution() {
        let adapter = HttpTemplateAdapter::from_config(
            "mirror",
            &http_config("https://mirror.test/{identifier}?q={identifier_encoded}".to_string()),
        )
        .unwrap();

        assert_eq!(
            adapter.url_for("10.1000/abc"),
            "https://mirror.test/10.1000/abc?q=10.1000%2Fabc"
        );
    }

    #[test]
    fn test_missing_template_is_config_error() {
        let mut config = http_config(String::new());
        config.url_template = None;
        assert!(matches!(
            HttpTemplateAdapter::from_config("broken", &config),
            Err(AdapterError::Config(_))
        ));
    }

    #[test]
    fn test_file_stem_is_filesystem_safe() {
        assert_eq!(file_stem_for("10.1000/abc:def"), "10.1000_abc_def");
    }

    #[tokio::test]
    async fn test_download_writes_pdf() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pdf/10.1000/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.5\nbody".to_vec()))
            .mount(&server)
            .await;

        let adapter = HttpTemplateAdapter::from_config(
            "mirror",
            &http_config(format!("{}/pdf/{{identifier}}", server.uri())),
        )
        .unwrap();
        let dir = TempDir::new().unwrap();
        let session = MockSession::new();

        let path = adapter
            .download(&session, "10.1000/abc", dir.path())
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("10.1000_abc.pdf"));
        assert!(std::fs::read(&path).unwrap().starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn test_download_classifies_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>captcha</html>"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let session = MockSession::new();

        let busy = HttpTemplateAdapter::from_config(
            "busy",
            &http_config(format!("{}/busy", server.uri())),
        )
        .unwrap();
        let err = busy.download(&session, "x", dir.path()).await.unwrap_err();
        assert!(err.is_transient());

        let html = HttpTemplateAdapter::from_config(
            "html",
            &http_config(format!("{}/html", server.uri())),
        )
        .unwrap();
        let err = html.download(&session, "x", dir.path()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Failed(_)));
    }

    #[tokio::test]
    async fn test_login_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut config = http_config(format!("{}/{{identifier}}", server.uri()));
        config.login_url = Some(format!("{}/login", server.uri()));
        let adapter = HttpTemplateAdapter::from_config("mirror", &config).unwrap();

        assert!(adapter.login(&MockSession::new()).await.is_ok());
    }

    #[test]
    fn test_registry_from_config() {
        let mut sources = SourcesSection::default();
        sources
            .adapters
            .insert("mirror".to_string(), http_config("https://m.test/{identifier}".to_string()));
        let mut disabled = http_config("https://d.test/{identifier}".to_string());
        disabled.enabled = false;
        sources.adapters.insert("disabled".to_string(), disabled);

        let registry = AdapterRegistry::from_config(&sources).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("mirror").is_some());
        assert!(registry.get("disabled").is_none());

        let mut unknown = http_config("https://u.test".to_string());
        unknown.kind = "ftp".to_string();
        sources.adapters.insert("unknown".to_string(), unknown);
        assert!(AdapterRegistry::from_config(&sources).is_err());
    }
}
