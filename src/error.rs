//! Error taxonomy for the orchestrator
//!
//! Only `ConfigError` and `ValidationError` ever abort a request before a stage
//! runs. Stage-level failures are captured as [`StageErrorKind`] inside the result
//! envelope and never surface as Rust errors past the executor.

use serde::Serialize;
use thiserror::Error;

/// Top-level error type for orchestrator operations
#[derive(Debug, Error)]
pub enum EepError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Server error: {message}")]
    Server { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EepError {
    /// Create server error
    pub fn server<S: Into<String>>(message: S) -> Self {
        Self::Server {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for orchestrator operations
pub type EepResult<T> = Result<T, EepError>;

/// Malformed inbound request, rejected before any stage executes
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid field '{field}': {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Stable, client-facing classification of a stage failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    ConnectionError,
    TimeoutError,
    UpstreamError,
    DecodeError,
}

impl StageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageErrorKind::ConnectionError => "connection_error",
            StageErrorKind::TimeoutError => "timeout_error",
            StageErrorKind::UpstreamError => "upstream_error",
            StageErrorKind::DecodeError => "decode_error",
        }
    }

    /// The downstream service could not be reached in time, as opposed to
    /// answering with something unusable
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StageErrorKind::ConnectionError | StageErrorKind::TimeoutError
        )
    }
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sanitize error messages before they leave the process
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    // Remove common secret patterns
    if let Ok(secrets) = regex::Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+") {
        sanitized = secrets.replace_all(&sanitized, "${1}=***").to_string();
    }

    // Remove potential file paths that might contain sensitive info
    if let Ok(paths) =
        regex::Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
    {
        sanitized = paths.replace_all(&sanitized, "/***REDACTED***/").to_string();
    }

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let error = ValidationError::new("image", "must not be empty");
        assert_eq!(error.to_string(), "Invalid field 'image': must not be empty");
    }

    #[test]
    fn test_validation_error_converts_into_eep_error() {
        let error: EepError = ValidationError::new("stages", "unknown stage 'foo'").into();
        assert!(matches!(error, EepError::Validation(_)));
        assert!(error.to_string().contains("unknown stage"));
    }

    #[test]
    fn test_internal_error_constructor() {
        let error = EepError::internal("unexpected state");
        assert!(matches!(error, EepError::Internal { .. }));
        assert_eq!(error.to_string(), "Internal error: unexpected state");
    }

    #[test]
    fn test_stage_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&StageErrorKind::TimeoutError).unwrap();
        assert_eq!(json, "\"timeout_error\"");
        assert_eq!(StageErrorKind::DecodeError.as_str(), "decode_error");
    }

    #[test]
    fn test_unavailable_kinds() {
        assert!(StageErrorKind::ConnectionError.is_unavailable());
        assert!(StageErrorKind::TimeoutError.is_unavailable());
        assert!(!StageErrorKind::UpstreamError.is_unavailable());
        assert!(!StageErrorKind::DecodeError.is_unavailable());
    }

    #[test]
    fn test_error_message_sanitization() {
        let sanitized =
            sanitize_error_message("upstream said: password=secret123 token=abc456");

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"é".repeat(400));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_file_path_redaction() {
        let sanitized = sanitize_error_message("cannot open /home/user/.ssh/id_rsa");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/user/.ssh/id_rsa"));
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let sanitized = sanitize_error_message(&"x".repeat(500));
        assert_eq!(sanitized.len(), 500);
        assert!(!sanitized.contains("truncated"));
    }
}
