//! Network-tap channel: endpoint matching and exchange correlation

use super::payload::{doc_from_single, docs_from_listing, BoardDoc};
use crate::session::NetworkEvent;
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Upper bound on exchanges awaiting their body
const MAX_PENDING_EXCHANGES: usize = 1024;

/// Decides which response URLs carry board requests
#[derive(Debug, Clone)]
pub struct EndpointMatcher {
    endpoints: Vec<String>,
}

impl EndpointMatcher {
    pub fn new(listing: &[String], single: &[String]) -> Self {
        let endpoints = listing
            .iter()
            .chain(single.iter())
            .filter(|e| !e.is_empty())
            .cloned()
            .collect();
        Self { endpoints }
    }

    /// Whether the path of `url` contains one of the board endpoints
    pub fn matches(&self, url: &str) -> bool {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        self.endpoints.iter().any(|e| path.contains(e.as_str()))
    }
}

/// Extract board documents from a response body of either shape
pub fn docs_from_body(body: &str) -> Vec<BoardDoc> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return Vec::new();
    };
    if value.get("docs").is_some() {
        docs_from_listing(&value)
    } else {
        doc_from_single(&value).into_iter().collect()
    }
}

/// Pairs "response started" with "body available" by exchange id so each
/// matching body is read once
#[derive(Debug, Default)]
pub struct ExchangeCorrelator {
    pending: HashMap<String, String>,
}

impl ExchangeCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event; returns `(exchange_id, url)` when a body is ready to read
    pub fn observe(
        &mut self,
        event: NetworkEvent,
        matcher: &EndpointMatcher,
    ) -> Option<(String, String)> {
        match event {
            NetworkEvent::ResponseStarted { exchange_id, url } => {
                if matcher.matches(&url) {
                    if self.pending.len() >= MAX_PENDING_EXCHANGES {
                        warn!(
                            pending = self.pending.len(),
                            "Too many exchanges without a body, dropping pending set"
                        );
                        self.pending.clear();
                    }
                    self.pending.insert(exchange_id, url);
                }
                None
            }
            NetworkEvent::BodyAvailable { exchange_id } => self
                .pending
                .remove(&exchange_id)
                .map(|url| (exchange_id, url)),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
