//! Adapter error taxonomy

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Categories of runtime adapter failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Spec rejected before submission
    Validation,
    /// Backend unreachable or refusing work
    RuntimeUnavailable,
    /// Backend quota or budget exhausted
    QuotaExceeded,
    /// Operation exceeded its deadline
    Timeout,
    /// Job was cancelled
    Cancelled,
    /// Unknown job or runtime
    NotFound,
    /// Unexpected adapter failure
    Internal,
}

impl ErrorCategory {
    /// Default retryability per category.
    pub fn default_retryable(self) -> bool {
        matches!(self, Self::RuntimeUnavailable | Self::Timeout | Self::Internal)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::RuntimeUnavailable => "runtime_unavailable",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

/// Structured failure from a runtime adapter or the engine.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("[{runtime}/{category}] {message}")]
pub struct JobError {
    /// Runtime adapter name the failure came from
    pub runtime: String,
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

impl JobError {
    pub fn new(
        runtime: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            runtime: runtime.into(),
            category,
            message: message.into(),
            retryable: category.default_retryable(),
            retry_after: None,
        }
    }

    pub fn validation(runtime: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(runtime, ErrorCategory::Validation, message)
    }

    pub fn unavailable(runtime: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(runtime, ErrorCategory::RuntimeUnavailable, message)
    }

    pub fn not_found(runtime: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(runtime, ErrorCategory::NotFound, message)
    }

    pub fn timeout(runtime: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(runtime, ErrorCategory::Timeout, message)
    }

    pub fn internal(runtime: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(runtime, ErrorCategory::Internal, message)
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}
