//! docrunner - request lifecycle engine
//!
//! Watches a work-request board for new items, races to claim one, fetches
//! the requested document from alternate sources, strips header watermarks
//! from it and submits it back, surviving browser crashes and process
//! restarts along the way.
//!
//! # Overview
//!
//! - [`detector`]: dual-channel discovery (network tap and in-page hook) with dedup
//! - [`prefilter`] and [`metadata`]: cheap pre-claim and post-claim screening
//! - [`claim`]: race-to-claim against a single busy slot
//! - [`orchestrator`]: multi-source download, cancellation fallback, submission
//! - [`sanitizer`]: header-watermark redaction for PDFs
//! - [`session`]: the browser session and its supervisor
//! - [`control`]: notifications out, operator signals in (MQTT or log)
//! - [`engine`]: the pipeline that ties them together
//!
//! # Quick Start
//!
//! ```rust
//! use docrunner::prefilter::{evaluate, PrefilterVerdict};
//! use docrunner::request::RejectReason;
//!
//! assert_eq!(
//!     evaluate("AI"),
//!     PrefilterVerdict::Reject(RejectReason::ShortTitlePre)
//! );
//! assert!(evaluate("A Study of Transcription Factor Binding in Yeast").is_accept());
//! ```

pub mod backoff;
pub mod claim;
pub mod config;
pub mod context;
pub mod control;
pub mod detector;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod observability;
pub mod orchestrator;
pub mod prefilter;
pub mod request;
pub mod sanitizer;
pub mod session;
pub mod state;
pub mod testing;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use config::EngineConfig;
pub use context::EngineContext;
pub use control::{ControlChannel, ControlSignal, Notification};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use request::{Request, RequestStatus};
pub use state::StateStore;
