//! Cross-cutting error taxonomy
//!
//! Every failure in the system carries a category, a retryable flag, and
//! structured context. Categories classify *what* went wrong; retryability is
//! a property of the specific failure, not of its category.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error categories shared across subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network connectivity or transport failure
    Network,
    /// Database operation failure
    Database,
    /// Object/file storage failure
    Storage,
    /// Upstream data source failure
    Source,
    /// Payload could not be parsed
    Parse,
    /// Input failed validation
    Validation,
    /// Invalid or missing configuration
    Config,
    /// Authentication or authorization failure
    Auth,
    /// A named operation failed
    Operation,
    /// Workflow orchestration failure
    Orchestration,
    /// Internal invariant violation
    Internal,
    /// Unclassified
    Unknown,
}

impl ErrorKind {
    /// Default retryability for the category.
    ///
    /// Transient infrastructure categories default to retryable; logical
    /// failures do not. Individual errors may override.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Database | Self::Storage | Self::Source | Self::Internal
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Database => "database",
            Self::Storage => "storage",
            Self::Source => "source",
            Self::Parse => "parse",
            Self::Validation => "validation",
            Self::Config => "config",
            Self::Auth => "auth",
            Self::Operation => "operation",
            Self::Orchestration => "orchestration",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Structured error carried across component boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct SpineError {
    /// Human-readable failure description
    pub message: String,

    /// Failure category
    pub kind: ErrorKind,

    /// Whether a retry of the same operation may succeed
    pub retryable: bool,

    /// Suggested delay before retrying, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,

    /// Structured context (operation, workflow, run id, step, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl SpineError {
    /// Create an error with the category's default retryability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            retryable: kind.default_retryable(),
            retry_after: None,
            context: BTreeMap::new(),
        }
    }

    /// Validation failure (never retryable).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Internal failure (retryable by default).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Orchestration failure.
    pub fn orchestration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Orchestration, message)
    }

    /// Override the retryable flag.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Set a suggested retry delay.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Attach a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retryability() {
        assert!(ErrorKind::Network.default_retryable());
        assert!(ErrorKind::Database.default_retryable());
        assert!(!ErrorKind::Validation.default_retryable());
        assert!(!ErrorKind::Config.default_retryable());
        assert!(!ErrorKind::Auth.default_retryable());
    }

    #[test]
    fn test_error_construction() {
        let err = SpineError::validation("bad params")
            .with_context("operation", "task:ingest")
            .with_context("step", "normalize");

        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(!err.retryable);
        assert_eq!(err.context.get("operation").unwrap(), "task:ingest");
        assert_eq!(err.to_string(), "[validation] bad params");
    }

    #[test]
    fn test_retryable_override() {
        let err = SpineError::new(ErrorKind::Validation, "odd case").with_retryable(true);
        assert!(err.retryable);
    }

    #[test]
    fn test_serialization_round_trip() {
        let err = SpineError::internal("boom").with_retry_after(Duration::from_secs(5));
        let json = serde_json::to_string(&err).unwrap();
        let parsed: SpineError = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, ErrorKind::Internal);
        assert_eq!(parsed.retry_after, Some(Duration::from_secs(5)));
    }
}
