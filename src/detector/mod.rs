//! Event detector
//!
//! Two channels surface new board requests: a network tap on the session's
//! response stream and a hook script inside the page. Both feed one handler
//! that deduplicates by record id and work identifier (first writer wins)
//! before anything reaches the engine.

pub mod hook;
pub mod network;
pub mod payload;

use crate::config::EngineConfig;
use crate::observability::metrics::EngineMetrics;
use crate::request::{Candidate, DetectionChannel};
use crate::session::{AutomationSession, SessionError};
use crate::state::StateStore;
use futures::Stream;
use hook::{hook_script, BRIDGE_BINDING};
use network::{docs_from_body, EndpointMatcher, ExchangeCorrelator};
use payload::{BoardDoc, BridgeMessage};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HOOK_HEARTBEAT: Duration = Duration::from_secs(60);

/// First-writer-wins record of what has already been surfaced
#[derive(Debug, Default)]
pub struct DedupCache {
    record_ids: HashSet<String>,
    identifiers: HashSet<String>,
}

impl DedupCache {
    /// Mark the document as seen; `false` if either key was seen before
    pub fn first_sighting(&mut self, record_id: Option<&str>, identifier: &str) -> bool {
        let seen_record = record_id.is_some_and(|r| self.record_ids.contains(r));
        if seen_record || self.identifiers.contains(identifier) {
            return false;
        }
        self.identifiers.insert(identifier.to_string());
        if let Some(record_id) = record_id {
            self.record_ids.insert(record_id.to_string());
        }
        true
    }

    pub fn clear(&mut self) {
        self.record_ids.clear();
        self.identifiers.clear();
    }

    /// (record ids, identifiers)
    pub fn sizes(&self) -> (usize, usize) {
        (self.record_ids.len(), self.identifiers.len())
    }
}

/// Lazy, never-ending stream of candidates. Not restartable: there is one per detector.
pub struct CandidateStream {
    rx: mpsc::Receiver<Candidate>,
}

impl CandidateStream {
    pub async fn next(&mut self) -> Option<Candidate> {
        self.rx.recv().await
    }
}

impl Stream for CandidateStream {
    type Item = Candidate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Dual-channel request detector
pub struct EventDetector {
    matcher: EndpointMatcher,
    listing_endpoints: Vec<String>,
    bridge_queue: usize,
    dedup: Mutex<DedupCache>,
    state: Arc<StateStore>,
    metrics: Arc<EngineMetrics>,
    candidates: mpsc::Sender<Candidate>,
}

impl EventDetector {
    pub fn new(
        config: &EngineConfig,
        state: Arc<StateStore>,
        metrics: Arc<EngineMetrics>,
    ) -> (Arc<Self>, CandidateStream) {
        let (tx, rx) = mpsc::channel(config.engine.candidate_queue.max(1));
        let detector = Arc::new(Self {
            matcher: EndpointMatcher::new(
                &config.board.listing_endpoints,
                &config.board.request_endpoints,
            ),
            listing_endpoints: config.board.listing_endpoints.clone(),
            bridge_queue: config.engine.bridge_queue.max(1),
            dedup: Mutex::new(DedupCache::default()),
            state,
            metrics,
            candidates: tx,
        });
        (detector, CandidateStream { rx })
    }

    /// Wire both channels to `session`; the pumps stop when `cancel` fires
    pub async fn attach(
        self: &Arc<Self>,
        session: Arc<dyn AutomationSession>,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        let mut network = session.network_events().await?;
        let (bridge_tx, mut bridge_rx) = mpsc::channel::<String>(self.bridge_queue);
        let script = hook_script(&self.listing_endpoints, HOOK_HEARTBEAT);
        session.install_bridge(BRIDGE_BINDING, &script, bridge_tx).await?;

        let detector = self.clone();
        let tap_session = session.clone();
        let tap_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut correlator = ExchangeCorrelator::new();
            loop {
                tokio::select! {
                    _ = tap_cancel.cancelled() => break,
                    event = network.recv() => {
                        let Some(event) = event else { break };
                        if let Some((exchange_id, url)) = correlator.observe(event, &detector.matcher) {
                            detector.read_exchange(tap_session.as_ref(), &exchange_id, &url).await;
                        }
                    }
                }
            }
            debug!("Network tap stopped");
        });

        let detector = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    raw = bridge_rx.recv() => {
                        let Some(raw) = raw else { break };
                        detector.handle_bridge_message(&raw).await;
                    }
                }
            }
            debug!("Page bridge drain stopped");
        });

        info!("Event detector attached to session");
        Ok(())
    }

    async fn read_exchange(&self, session: &dyn AutomationSession, exchange_id: &str, url: &str) {
        match session.response_body(exchange_id).await {
            Ok(body) => {
                let docs = docs_from_body(&body);
                debug!(url = %url, docs = docs.len(), "Read board response body");
                for doc in docs {
                    self.handle_doc(doc, DetectionChannel::NetworkTap).await;
                }
            }
            // Evicted bodies are routine
            Err(e) if is_missing_resource(&e) => {
                debug!(exchange_id, "Response body no longer available");
            }
            Err(e) => warn!(url = %url, error = %e, "Failed to read response body"),
        }
    }

    /// Validate and dispatch one raw message from the page bridge
    pub async fn handle_bridge_message(&self, raw: &str) {
        match BridgeMessage::parse(raw) {
            Ok(BridgeMessage::Heartbeat) => {
                self.metrics.hook_heartbeat();
            }
            Ok(message) => {
                for doc in message.docs() {
                    self.handle_doc(doc, DetectionChannel::PageHook).await;
                }
            }
            Err(e) => {
                self.metrics.bridge_message_quarantined();
                warn!(error = %e, "Quarantined malformed bridge message");
            }
        }
    }

    /// Shared handler for both channels. Returns whether a candidate was emitted.
    pub async fn handle_doc(&self, doc: BoardDoc, channel: DetectionChannel) -> bool {
        if self.state.is_skipped(&doc.identifier) {
            self.metrics.duplicate_suppressed();
            return false;
        }

        let first = match self.dedup.lock() {
            Ok(mut cache) => cache.first_sighting(doc.record_id.as_deref(), &doc.identifier),
            Err(_) => false,
        };
        if !first {
            self.metrics.duplicate_suppressed();
            return false;
        }

        self.metrics.candidate_detected();
        info!(
            channel = %channel,
            identifier = %doc.identifier,
            url = %doc.detail,
            "New request detected"
        );

        let candidate = Candidate {
            request: doc.into_request(),
            channel,
        };
        self.candidates.send(candidate).await.is_ok()
    }

    /// Forget transient dedup state (called after a session restart)
    pub fn reset_transient(&self) {
        if let Ok(mut cache) = self.dedup.lock() {
            cache.clear();
        }
        debug!("Detector dedup caches cleared");
    }

    pub fn dedup_sizes(&self) -> (usize, usize) {
        self.dedup.lock().map(|c| c.sizes()).unwrap_or((0, 0))
    }
}

fn is_missing_resource(error: &SessionError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("no resource with given identifier") || message.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detector() -> (Arc<EventDetector>, CandidateStream, Arc<StateStore>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let state = Arc::new(StateStore::load(dir.path().join("state.json")));
        let (detector, stream) = EventDetector::new(
            &EngineConfig::test_config(),
            state.clone(),
            Arc::new(EngineMetrics::new()),
        );
        (detector, stream, state, dir)
    }

    fn doc(record: &str, identifier: &str) -> BoardDoc {
        BoardDoc::from_value(&json!({"_id": record, "doi": identifier})).unwrap()
    }

    #[test]
    fn test_dedup_either_key_suppresses() {
        let mut cache = DedupCache::default();
        assert!(cache.first_sighting(Some("r1"), "10.1/a"));
        assert!(!cache.first_sighting(Some("r1"), "10.1/b"));
        assert!(!cache.first_sighting(Some("r2"), "10.1/a"));
        assert!(!cache.first_sighting(None, "10.1/a"));
        assert!(cache.first_sighting(None, "10.1/c"));
        assert_eq!(cache.sizes(), (1, 2));
    }

    #[tokio::test]
    async fn test_cross_channel_duplicate_suppressed() {
        let (detector, mut stream, _state, _dir) = detector();

        assert!(detector.handle_doc(doc("r1", "10.1/a"), DetectionChannel::NetworkTap).await);
        assert!(!detector.handle_doc(doc("r1", "10.1/a"), DetectionChannel::PageHook).await);

        let candidate = stream.next().await.unwrap();
        assert_eq!(candidate.channel, DetectionChannel::NetworkTap);
        assert_eq!(candidate.request.identifier, "10.1/a");
    }

    #[tokio::test]
    async fn test_skipped_identifier_never_emitted() {
        let (detector, _stream, state, _dir) = detector();
        state.mark_skipped("10.1/done").unwrap();

        assert!(!detector.handle_doc(doc("r9", "10.1/done"), DetectionChannel::PageHook).await);
        assert_eq!(detector.dedup_sizes(), (0, 0));
    }

    #[tokio::test]
    async fn test_reset_allows_redetection() {
        let (detector, _stream, _state, _dir) = detector();

        assert!(detector.handle_doc(doc("r1", "10.1/a"), DetectionChannel::PageHook).await);
        detector.reset_transient();
        assert!(detector.handle_doc(doc("r1", "10.1/a"), DetectionChannel::PageHook).await);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_collapse() {
        let (detector, mut stream, _state, _dir) = detector();

        let mut handles = Vec::new();
        for i in 0..16 {
            let detector = detector.clone();
            let channel = if i % 2 == 0 {
                DetectionChannel::PageHook
            } else {
                DetectionChannel::NetworkTap
            };
            handles.push(tokio::spawn(async move {
                detector.handle_doc(doc("r1", "10.1/race"), channel).await
            }));
        }

        let mut emitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 1);
        assert!(stream.next().await.is_some());
    }

    #[tokio::test]
    async fn test_bridge_listing_and_quarantine() {
        let (detector, mut stream, _state, _dir) = detector();

        detector
            .handle_bridge_message(r#"{"kind":"listing","docs":[{"doi":"a"},{"doi":"b"}]}"#)
            .await;
        detector.handle_bridge_message("garbage").await;

        assert_eq!(stream.next().await.unwrap().request.identifier, "a");
        assert_eq!(stream.next().await.unwrap().request.identifier, "b");
        assert_eq!(detector.metrics.snapshot().detection.bridge_messages_quarantined, 1);
    }
}
