//! Engine error taxonomy
//!
//! Module-level errors (`SessionError`, `AdapterError`, `StateError`, ...) are
//! wrapped by [`EngineError`], and [`EngineError::kind`] maps each one onto
//! the failure classes the lifecycle reacts to.

use crate::config::ConfigError;
use crate::control::ControlError;
use crate::metadata::MetadataError;
use crate::orchestrator::AdapterError;
use crate::request::RequestStatus;
use crate::sanitizer::SanitizeError;
use crate::session::SessionError;
use crate::state::StateError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Transient network error: {message}")]
    TransientNetwork { message: String },

    #[error("Site structure error: {message}")]
    SiteStructure { message: String },

    #[error("Session crashed: {message}")]
    SessionCrash { message: String },

    #[error("Cancellation failed for {identifier}: {message}")]
    CancellationFailure { identifier: String, message: String },

    #[error("Invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Sanitization failed: {0}")]
    Sanitization(#[from] SanitizeError),

    #[error("State persistence failed: {0}")]
    Persistence(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Control channel error: {0}")]
    Control(#[from] ControlError),

    #[error("Source adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Metadata lookup failed: {0}")]
    Metadata(#[from] MetadataError),
}

/// Failure classes the lifecycle distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried with backoff at the call site
    TransientNetwork,
    /// Fatal for one adapter attempt; falls through to the next source
    SiteStructure,
    /// Owned by the session supervisor
    SessionCrash,
    /// Leaves the slot occupied and raises an alert
    CancellationFailure,
    /// Soft: the unsanitized document is uploaded
    SanitizationFailure,
    /// Fatal to the current operation
    PersistenceSave,
    Configuration,
    ControlChannel,
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            EngineError::SiteStructure { .. } => ErrorKind::SiteStructure,
            EngineError::SessionCrash { .. } => ErrorKind::SessionCrash,
            EngineError::CancellationFailure { .. } => ErrorKind::CancellationFailure,
            EngineError::Sanitization(_) => ErrorKind::SanitizationFailure,
            EngineError::Persistence(_) => ErrorKind::PersistenceSave,
            EngineError::Config(_) => ErrorKind::Configuration,
            EngineError::Control(_) => ErrorKind::ControlChannel,
            EngineError::Session(e) if e.is_transient() => ErrorKind::TransientNetwork,
            EngineError::Session(e) if e.is_structural() => ErrorKind::SiteStructure,
            EngineError::Session(SessionError::Closed) => ErrorKind::SessionCrash,
            EngineError::Session(_) => ErrorKind::Internal,
            EngineError::Adapter(e) if e.is_transient() => ErrorKind::TransientNetwork,
            EngineError::Adapter(e) if e.is_structural() => ErrorKind::SiteStructure,
            EngineError::Adapter(_) => ErrorKind::Internal,
            // Metadata is best effort; a failed lookup never blocks a claim
            EngineError::Metadata(_) => ErrorKind::TransientNetwork,
            EngineError::InvalidTransition { .. } | EngineError::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the error must stop the current operation outright
    pub fn escalates(&self) -> bool {
        matches!(self.kind(), ErrorKind::PersistenceSave | ErrorKind::Internal)
    }

    /// Message safe to publish on the control channel
    pub fn public_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    pub fn site_structure<S: Into<String>>(message: S) -> Self {
        Self::SiteStructure {
            message: message.into(),
        }
    }

    pub fn session_crash<S: Into<String>>(message: S) -> Self {
        Self::SessionCrash {
            message: message.into(),
        }
    }

    pub fn cancellation_failure<I: Into<String>, S: Into<String>>(identifier: I, message: S) -> Self {
        Self::CancellationFailure {
            identifier: identifier.into(),
            message: message.into(),
        }
    }

    pub fn invalid_transition(from: RequestStatus, to: RequestStatus) -> Self {
        Self::InvalidTransition { from, to }
    }

    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret|cookie)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_PUBLIC_MESSAGE: usize = 500;

/// Mask secrets and truncate before a message leaves the process
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN.replace_all(message, "${1}=***").to_string();
    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_PUBLIC_MESSAGE {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_PUBLIC_MESSAGE - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_constructors_and_display() {
        let error = EngineError::transient("claim call timed out");
        assert!(matches!(error, EngineError::TransientNetwork { .. }));
        assert_eq!(error.to_string(), "Transient network error: claim call timed out");

        let error = EngineError::cancellation_failure("10.1/x", "all steps failed");
        assert!(error.to_string().contains("10.1/x"));
        assert!(error.to_string().contains("all steps failed"));
    }

    #[test]
    fn test_invalid_transition_display() {
        let error =
            EngineError::invalid_transition(RequestStatus::Discovered, RequestStatus::Uploading);
        assert_eq!(
            error.to_string(),
            "Invalid lifecycle transition: discovered -> uploading"
        );
        assert_eq!(error.kind(), ErrorKind::Internal);
        assert!(error.escalates());
    }

    #[test]
    fn test_session_errors_map_to_taxonomy() {
        let timeout: EngineError = SessionError::timeout("fetch", Duration::from_secs(3)).into();
        assert_eq!(timeout.kind(), ErrorKind::TransientNetwork);

        let missing: EngineError = SessionError::ElementNotFound {
            selector: "#progress".to_string(),
        }
        .into();
        assert_eq!(missing.kind(), ErrorKind::SiteStructure);

        let closed: EngineError = SessionError::Closed.into();
        assert_eq!(closed.kind(), ErrorKind::SessionCrash);
    }

    #[test]
    fn test_adapter_errors_map_to_taxonomy() {
        let transient: EngineError = AdapterError::Transient("503".into()).into();
        assert_eq!(transient.kind(), ErrorKind::TransientNetwork);

        let structural: EngineError = AdapterError::SiteStructure("no link".into()).into();
        assert_eq!(structural.kind(), ErrorKind::SiteStructure);
        assert!(!structural.escalates());
    }

    #[test]
    fn test_persistence_save_escalates() {
        let error: EngineError = StateError::Poisoned.into();
        assert_eq!(error.kind(), ErrorKind::PersistenceSave);
        assert!(error.escalates());
        assert!(!EngineError::site_structure("x").escalates());
    }

    #[test]
    fn test_error_message_sanitization() {
        let error = EngineError::internal_error(
            "Failed to authenticate: password=secret123 token=abc456",
        );
        let message = error.public_message();

        assert!(!message.contains("secret123"));
        assert!(!message.contains("abc456"));
        assert!(message.contains("password=***"));
        assert!(message.contains("token=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"ترجمانو".repeat(100));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_file_path_redaction() {
        let sanitized =
            sanitize_error_message("Failed to read /home/user/.ssh/id_rsa and /etc/secrets/api.key");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/user/.ssh/id_rsa"));
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let sanitized = sanitize_error_message(&"x".repeat(500));
        assert_eq!(sanitized.len(), 500);
        assert!(!sanitized.contains("truncated"));
    }

    #[test]
    fn test_sanitize_empty_message() {
        assert_eq!(sanitize_error_message(""), "");
    }
}
