//! Chromium-backed automation session using chromiumoxide (CDP)

use super::{AutomationSession, FetchOutcome, NetworkEvent, SessionError, SessionHealth, SessionLauncher};
use crate::config::SessionSection;
use async_trait::async_trait;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::inspector::EventTargetCrashed;
use chromiumoxide::cdp::browser_protocol::network::{
    Cookie, CookieParam, EnableParams as NetworkEnableParams, EventLoadingFinished,
    EventResponseReceived, GetResponseBodyParams, RequestId,
};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EvaluateParams, EventBindingCalled};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Capacity of the network event queue handed to the detector
const NETWORK_QUEUE: usize = 256;

/// Find a Chromium binary from the config or `DOCRUNNER_CHROMIUM_PATH`.
///
/// Returns `None` when neither is set, in which case chromiumoxide falls back
/// to its own executable detection.
pub fn find_chromium(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "Configured Chromium path does not exist");
    }

    std::env::var("DOCRUNNER_CHROMIUM_PATH")
        .ok()
        .map(PathBuf::from)
        .filter(|p| p.exists())
}

fn cdp_error(e: impl std::fmt::Display) -> SessionError {
    SessionError::Protocol(e.to_string())
}

/// Launches headless (or headful) Chromium pages
pub struct ChromiumLauncher {
    config: SessionSection,
}

impl ChromiumLauncher {
    pub fn new(config: SessionSection) -> Self {
        Self { config }
    }

    fn browser_config(&self) -> Result<BrowserConfig, SessionError> {
        let mut builder = BrowserConfig::builder()
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-blink-features=AutomationControlled");

        if self.config.headful {
            builder = builder.with_head();
        }
        if let Some(path) = find_chromium(self.config.chromium_path.as_deref()) {
            builder = builder.chrome_executable(path);
        }
        for arg in &self.config.extra_args {
            builder = builder.arg(arg.as_str());
        }

        builder.build().map_err(SessionError::Launch)
    }
}

#[async_trait]
impl SessionLauncher for ChromiumLauncher {
    async fn launch(
        &self,
        storage_state: Option<&Path>,
    ) -> Result<Arc<dyn AutomationSession>, SessionError> {
        let config = self.browser_config()?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        let (health_tx, health_rx) = watch::channel(SessionHealth::Alive);
        let health_tx = Arc::new(health_tx);

        let handler_health = health_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "Browser handler event error");
                }
            }
            let _ = handler_health.send(SessionHealth::Closed(
                "browser connection ended".to_string(),
            ));
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        let mut crashes = page
            .event_listener::<EventTargetCrashed>()
            .await
            .map_err(cdp_error)?;
        let crash_health = health_tx.clone();
        tokio::spawn(async move {
            if crashes.next().await.is_some() {
                warn!("Page target crashed");
                let _ = crash_health.send(SessionHealth::Crashed("target crashed".to_string()));
            }
        });

        let session = ChromiumSession {
            browser: Mutex::new(browser),
            page,
            health_tx,
            health_rx,
            action_timeout: Duration::from_millis(self.config.action_timeout_ms),
        };

        if let Some(path) = storage_state.filter(|p| p.exists()) {
            if let Err(e) = session.restore_storage_state(path).await {
                warn!(path = %path.display(), error = %e, "Could not restore session cookies");
            }
        }

        info!(headful = self.config.headful, "Chromium session launched");
        Ok(Arc::new(session))
    }
}

/// A single Chromium page
pub struct ChromiumSession {
    browser: Mutex<Browser>,
    page: Page,
    health_tx: Arc<watch::Sender<SessionHealth>>,
    health_rx: watch::Receiver<SessionHealth>,
    action_timeout: Duration,
}

impl ChromiumSession {
    async fn restore_storage_state(&self, path: &Path) -> Result<(), SessionError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let cookies: Vec<Cookie> =
            serde_json::from_str(&raw).map_err(|e| SessionError::Protocol(e.to_string()))?;

        let params: Vec<CookieParam> = cookies
            .into_iter()
            .map(|cookie| {
                let mut param = CookieParam::new(cookie.name, cookie.value);
                param.domain = Some(cookie.domain);
                param.path = Some(cookie.path);
                param.secure = Some(cookie.secure);
                param.http_only = Some(cookie.http_only);
                param
            })
            .collect();

        let count = params.len();
        self.page.set_cookies(params).await.map_err(cdp_error)?;
        debug!(count, "Restored session cookies");
        Ok(())
    }

    async fn with_timeout<T, F>(&self, operation: &str, timeout: Duration, fut: F) -> Result<T, SessionError>
    where
        F: std::future::Future<Output = Result<T, SessionError>>,
    {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| SessionError::timeout(operation, timeout))?
    }
}

#[async_trait]
impl AutomationSession for ChromiumSession {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), SessionError> {
        self.with_timeout("goto", timeout, async {
            self.page
                .goto(url)
                .await
                .map_err(|e| SessionError::Navigation {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            Ok(())
        })
        .await
    }

    async fn evaluate(&self, script: &str) -> Result<Value, SessionError> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(SessionError::Script)?;

        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(|e| SessionError::Script(e.to_string()))?;

        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn fetch(&self, path: &str, timeout: Duration) -> Result<FetchOutcome, SessionError> {
        let script = fetch_script(path, timeout);
        let value = self
            .with_timeout("fetch", timeout + Duration::from_secs(1), self.evaluate(&script))
            .await?;
        serde_json::from_value(value).map_err(|e| SessionError::Script(e.to_string()))
    }

    async fn click_first(
        &self,
        selectors: &[String],
        timeout: Duration,
    ) -> Result<String, SessionError> {
        for selector in selectors {
            let attempt = tokio::time::timeout(timeout, async {
                let element = self.page.find_element(selector.as_str()).await?;
                element.click().await?;
                Ok::<_, chromiumoxide::error::CdpError>(())
            })
            .await;

            match attempt {
                Ok(Ok(())) => return Ok(selector.clone()),
                Ok(Err(e)) => debug!(selector = %selector, error = %e, "Selector did not click"),
                Err(_) => debug!(selector = %selector, "Selector click timed out"),
            }
        }

        Err(SessionError::ElementNotFound {
            selector: selectors.join(" | "),
        })
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), SessionError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| SessionError::ElementNotFound {
                selector: selector.to_string(),
            })?;
        let selector_json = serde_json::to_string(selector).map_err(|e| SessionError::Script(e.to_string()))?;
        self.evaluate(&format!(
            "(() => {{ const el = document.querySelector({selector_json}); if (el) el.value = ''; }})()"
        ))
        .await?;
        element.click().await.map_err(cdp_error)?;
        element.type_str(value).await.map_err(cdp_error)?;
        Ok(())
    }

    async fn exists(&self, selector: &str) -> Result<bool, SessionError> {
        match self.page.find_elements(selector).await {
            Ok(elements) => Ok(!elements.is_empty()),
            Err(_) => Ok(false),
        }
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.exists(selector).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SessionError::ElementNotFound {
                    selector: selector.to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn set_input_file(&self, selector: &str, path: &Path) -> Result<(), SessionError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| SessionError::ElementNotFound {
                selector: selector.to_string(),
            })?;

        let params = SetFileInputFilesParams::builder()
            .files(vec![path.to_string_lossy().to_string()])
            .backend_node_id(element.backend_node_id)
            .build()
            .map_err(SessionError::Protocol)?;

        self.with_timeout("set_input_file", self.action_timeout, async {
            self.page.execute(params).await.map_err(cdp_error)?;
            Ok(())
        })
        .await
    }

    async fn screenshot(&self, path: &Path) -> Result<(), SessionError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.page
            .save_screenshot(ScreenshotParams::builder().full_page(true).build(), path)
            .await
            .map_err(cdp_error)?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, SessionError> {
        Ok(self
            .page
            .url()
            .await
            .map_err(cdp_error)?
            .unwrap_or_default())
    }

    async fn network_events(&self) -> Result<mpsc::Receiver<NetworkEvent>, SessionError> {
        self.page
            .execute(NetworkEnableParams::default())
            .await
            .map_err(cdp_error)?;

        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(cdp_error)?;
        let mut finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(cdp_error)?;

        let (tx, rx) = mpsc::channel(NETWORK_QUEUE);

        let started_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                let message = NetworkEvent::ResponseStarted {
                    exchange_id: event.request_id.inner().clone(),
                    url: event.response.url.clone(),
                };
                if started_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(event) = finished.next().await {
                let message = NetworkEvent::BodyAvailable {
                    exchange_id: event.request_id.inner().clone(),
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn response_body(&self, exchange_id: &str) -> Result<String, SessionError> {
        let response = self
            .page
            .execute(GetResponseBodyParams::new(RequestId::new(exchange_id.to_string())))
            .await
            .map_err(cdp_error)?;

        let body = &response.result;
        if body.base64_encoded {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(body.body.as_bytes())
                .map_err(|e| SessionError::Protocol(e.to_string()))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            Ok(body.body.clone())
        }
    }

    async fn install_bridge(
        &self,
        binding: &str,
        script: &str,
        sink: mpsc::Sender<String>,
    ) -> Result<(), SessionError> {
        let mut calls = self
            .page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(cdp_error)?;
        self.page
            .execute(AddBindingParams::new(binding))
            .await
            .map_err(cdp_error)?;

        let name = binding.to_string();
        tokio::spawn(async move {
            while let Some(call) = calls.next().await {
                if call.name != name {
                    continue;
                }
                // Bounded queue: a full queue sheds the message instead of stalling CDP
                if let Err(e) = sink.try_send(call.payload.clone()) {
                    if matches!(e, mpsc::error::TrySendError::Closed(_)) {
                        break;
                    }
                    warn!("Bridge queue full, dropping page message");
                }
            }
        });

        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(script))
            .await
            .map_err(cdp_error)?;
        // Also install into the document that is already loaded
        self.evaluate(script).await?;
        Ok(())
    }

    async fn save_storage_state(&self, path: &Path) -> Result<(), SessionError> {
        let cookies = self.page.get_cookies().await.map_err(cdp_error)?;
        let payload =
            serde_json::to_vec_pretty(&cookies).map_err(|e| SessionError::Protocol(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, payload).await?;
        debug!(count = cookies.len(), path = %path.display(), "Saved session cookies");
        Ok(())
    }

    fn health(&self) -> watch::Receiver<SessionHealth> {
        self.health_rx.clone()
    }

    async fn close(&self) -> Result<(), SessionError> {
        let _ = self
            .health_tx
            .send(SessionHealth::Closed("closed by engine".to_string()));
        let _ = self.page.clone().close().await;
        let mut browser = self.browser.lock().await;
        browser.close().await.map_err(cdp_error)?;
        Ok(())
    }
}

/// In-page fetch that reports redirects instead of following them
fn fetch_script(path: &str, timeout: Duration) -> String {
    let path_json = serde_json::to_string(path).unwrap_or_else(|_| "\"/\"".to_string());
    let timeout_ms = timeout.as_millis();
    format!(
        r#"(async () => {{
  const ctrl = new AbortController();
  const timer = setTimeout(() => ctrl.abort(), {timeout_ms});
  try {{
    const res = await fetch({path_json}, {{ method: 'GET', credentials: 'include', redirect: 'manual', signal: ctrl.signal }});
    const landing = new URL(res.url || {path_json}, location.href).href;
    return {{ status: res.status, ok: res.ok, redirected: res.redirected || res.type === 'opaqueredirect', url: landing }};
  }} finally {{
    clearTimeout(timer);
  }}
}})()"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_script_embeds_escaped_path() {
        let script = fetch_script("/take/10.1%2F\"x", Duration::from_secs(5));
        assert!(script.contains(r#""/take/10.1%2F\"x""#));
        assert!(script.contains("redirect: 'manual'"));
        assert!(script.contains("credentials: 'include'"));
        assert!(script.contains("5000"));
    }

    #[test]
    fn test_find_chromium_ignores_missing_configured_path() {
        let missing = Path::new("/definitely/not/a/chrome");
        // Only the env var can produce a result here
        let found = find_chromium(Some(missing));
        if std::env::var("DOCRUNNER_CHROMIUM_PATH").is_err() {
            assert!(found.is_none());
        }
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_session_roundtrip() {
        let launcher = ChromiumLauncher::new(SessionSection::default());
        let session = launcher.launch(None).await.expect("launch failed");

        session
            .goto("data:text/html,<h1 id='t'>Hello</h1>", Duration::from_secs(10))
            .await
            .expect("navigation failed");
        assert!(session.exists("#t").await.unwrap());

        let text = session
            .evaluate("document.querySelector('#t').textContent")
            .await
            .unwrap();
        assert_eq!(text.as_str(), Some("Hello"));

        session.close().await.expect("close failed");
    }
}
