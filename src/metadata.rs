//! Bibliographic metadata lookup
//!
//! Providers are queried concurrently, each under its own timeout. For every
//! field the first provider in configured order with a non-empty value wins;
//! a provider that fails contributes nothing.

use crate::config::MetadataSection;
use crate::prefilter::{word_count, MIN_TITLE_WORDS};
use crate::request::RejectReason;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned status {0}")]
    Status(u16),
    #[error("unexpected response: {0}")]
    Parse(String),
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMetadata {
    pub title: Option<String>,
    pub venue: Option<String>,
    pub year: Option<i32>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    #[serde(rename = "type")]
    pub work_type: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl WorkMetadata {
    /// Fill fields still empty here from `other`
    pub fn merge_missing(&mut self, other: WorkMetadata) {
        if self.title.is_none() {
            self.title = non_empty(other.title);
        }
        if self.venue.is_none() {
            self.venue = non_empty(other.venue);
        }
        if self.year.is_none() {
            self.year = other.year;
        }
        if self.abstract_text.is_none() {
            self.abstract_text = non_empty(other.abstract_text);
        }
        if self.work_type.is_none() {
            self.work_type = non_empty(other.work_type);
        }
    }

    /// Post-claim screening: short titles and book-type works are handed back
    pub fn rejection(&self) -> Option<RejectReason> {
        let title = self.title.as_deref().unwrap_or_default();
        if word_count(title) < MIN_TITLE_WORDS {
            return Some(RejectReason::ShortTitlePost);
        }
        let is_book = self
            .work_type
            .as_deref()
            .is_some_and(|t| t.to_lowercase().contains("book"));
        is_book.then_some(RejectReason::BookTypePost)
    }
}

/// Rebuild plain text from an OpenAlex `abstract_inverted_index`
pub fn inverted_index_to_text(index: &Map<String, Value>) -> String {
    let mut positioned: Vec<(u64, &str)> = index
        .iter()
        .flat_map(|(word, positions)| {
            positions
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(Value::as_u64)
                .map(move |p| (p, word.as_str()))
        })
        .collect();
    positioned.sort_by_key(|(p, _)| *p);
    positioned
        .into_iter()
        .map(|(_, w)| w)
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn lookup(&self, identifier: &str) -> Result<WorkMetadata, MetadataError>;
}

fn string_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) => non_empty(Some(s.clone())),
        Value::Array(items) => items.iter().find_map(|v| non_empty(v.as_str().map(String::from))),
        _ => None,
    }
}

async fn get_json(client: &reqwest::Client, url: &str) -> Result<Value, MetadataError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(MetadataError::Status(status.as_u16()));
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| MetadataError::Parse(e.to_string()))
}

pub struct CrossrefProvider {
    client: reqwest::Client,
    base_url: String,
}

impl CrossrefProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MetadataProvider for CrossrefProvider {
    fn name(&self) -> &str {
        "crossref"
    }

    async fn lookup(&self, identifier: &str) -> Result<WorkMetadata, MetadataError> {
        let url = format!("{}/works/{}", self.base_url, identifier);
        let body = get_json(&self.client, &url).await?;
        let message = body
            .get("message")
            .ok_or_else(|| MetadataError::Parse("missing 'message'".to_string()))?;

        Ok(WorkMetadata {
            title: string_at(message, "/title"),
            venue: string_at(message, "/container-title"),
            year: message
                .pointer("/issued/date-parts/0/0")
                .and_then(Value::as_i64)
                .map(|y| y as i32),
            abstract_text: string_at(message, "/abstract"),
            work_type: string_at(message, "/type"),
        })
    }
}

pub struct OpenAlexProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAlexProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MetadataProvider for OpenAlexProvider {
    fn name(&self) -> &str {
        "openalex"
    }

    async fn lookup(&self, identifier: &str) -> Result<WorkMetadata, MetadataError> {
        let url = format!("{}/works/doi:{}", self.base_url, identifier);
        let work = get_json(&self.client, &url).await?;

        let abstract_text = match work.get("abstract_inverted_index") {
            Some(Value::Object(index)) => non_empty(Some(inverted_index_to_text(index))),
            Some(Value::String(text)) => non_empty(Some(text.clone())),
            _ => None,
        };

        Ok(WorkMetadata {
            title: string_at(&work, "/title").or_else(|| string_at(&work, "/display_name")),
            venue: string_at(&work, "/primary_location/source/display_name"),
            year: work
                .get("publication_year")
                .and_then(Value::as_i64)
                .map(|y| y as i32),
            abstract_text,
            work_type: string_at(&work, "/type"),
        })
    }
}

pub struct MetadataResolver {
    providers: Vec<Arc<dyn MetadataProvider>>,
    timeout: Duration,
}

impl MetadataResolver {
    pub fn new(providers: Vec<Arc<dyn MetadataProvider>>, timeout: Duration) -> Self {
        Self { providers, timeout }
    }

    /// Crossref then OpenAlex, as enabled
    pub fn from_config(config: &MetadataSection) -> Result<Self, MetadataError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        let mut providers: Vec<Arc<dyn MetadataProvider>> = Vec::new();
        if config.crossref {
            providers.push(Arc::new(CrossrefProvider::new(
                client.clone(),
                config.crossref_base_url.clone(),
            )));
        }
        if config.openalex {
            providers.push(Arc::new(OpenAlexProvider::new(
                client,
                config.openalex_base_url.clone(),
            )));
        }
        Ok(Self::new(providers, timeout))
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub async fn resolve(&self, identifier: &str) -> WorkMetadata {
        let lookups = self.providers.iter().map(|provider| async move {
            let result = tokio::time::timeout(self.timeout, provider.lookup(identifier))
                .await
                .unwrap_or(Err(MetadataError::Timeout(self.timeout)));
            (provider.name(), result)
        });

        let mut merged = WorkMetadata::default();
        for (name, result) in join_all(lookups).await {
            match result {
                Ok(found) => {
                    debug!(provider = name, identifier, "Metadata found");
                    merged.merge_missing(found);
                }
                Err(e) => warn!(provider = name, identifier, error = %e, "Metadata lookup failed"),
            }
        }
        merged
    }
}
