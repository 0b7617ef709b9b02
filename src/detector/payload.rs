//! Board payload shapes and the page bridge message schema
//!
//! Board documents are loosely shaped JSON, so fields are read leniently.
//! Bridge messages come from script running inside the page and are parsed
//! strictly; anything that does not match the schema is quarantined.

use crate::request::Request;
use serde::Deserialize;
use serde_json::Value;

/// The request fields the engine uses from a board document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardDoc {
    pub record_id: Option<String>,
    pub identifier: String,
    pub title: Option<String>,
    pub detail: String,
    pub requester: String,
    pub reward: String,
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn first_field(doc: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| non_empty_str(doc.get(*key)))
}

impl BoardDoc {
    /// Extract a document; `None` when it carries no identifier
    pub fn from_value(doc: &Value) -> Option<Self> {
        let identifier = first_field(doc, &["doi", "DOI", "id"])?;
        let request = doc.get("request");

        Some(Self {
            record_id: first_field(doc, &["_id"]),
            title: first_field(doc, &["title", "Title"]),
            detail: first_field(doc, &["detail", "url"]).unwrap_or_else(|| format!("/{identifier}")),
            requester: request
                .and_then(|r| non_empty_str(r.get("from")))
                .unwrap_or_default(),
            reward: request
                .and_then(|r| non_empty_str(r.get("reward")))
                .unwrap_or_default(),
            identifier,
        })
    }

    pub fn into_request(self) -> Request {
        let mut request = Request::new(self.identifier).with_detail(self.detail);
        request.record_id = self.record_id;
        request.title = self.title;
        request.requester = self.requester;
        request.reward = self.reward;
        request
    }
}

/// Documents in a listing body: `{"docs": [...]}`
pub fn docs_from_listing(body: &Value) -> Vec<BoardDoc> {
    body.get("docs")
        .and_then(Value::as_array)
        .map(|docs| docs.iter().filter_map(BoardDoc::from_value).collect())
        .unwrap_or_default()
}

/// Document in a single-request body: `success.data` or `data`
pub fn doc_from_single(body: &Value) -> Option<BoardDoc> {
    body.get("success")
        .and_then(|s| s.get("data"))
        .or_else(|| body.get("data"))
        .and_then(BoardDoc::from_value)
}

/// Messages the page hook sends over the bridge
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// One document delivered through the site's request event
    RequestDoc { doc: Value },
    /// A listing intercepted from the site's data fetch
    Listing { docs: Vec<Value> },
    /// Periodic liveness signal from the hook
    Heartbeat,
}

/// Why a bridge message was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeRejection {
    #[error("payload is not valid JSON for the bridge schema: {0}")]
    Schema(String),
    #[error("payload exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Upper bound on a single bridge payload
pub const MAX_BRIDGE_PAYLOAD: usize = 512 * 1024;

impl BridgeMessage {
    pub fn parse(raw: &str) -> Result<Self, BridgeRejection> {
        if raw.len() > MAX_BRIDGE_PAYLOAD {
            return Err(BridgeRejection::TooLarge {
                limit: MAX_BRIDGE_PAYLOAD,
            });
        }
        serde_json::from_str(raw).map_err(|e| BridgeRejection::Schema(e.to_string()))
    }

    /// Board documents carried by the message
    pub fn docs(&self) -> Vec<BoardDoc> {
        match self {
            BridgeMessage::RequestDoc { doc } => BoardDoc::from_value(doc).into_iter().collect(),
            BridgeMessage::Listing { docs } => docs.iter().filter_map(BoardDoc::from_value).collect(),
            BridgeMessage::Heartbeat => Vec::new(),
        }
    }
}
