//! Observability: structured logging, metrics collection and health endpoints

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{EngineMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{claim_span, mqtt_span, pipeline_span, session_span};
