//! Operation result envelope

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use spine_storage::StoreError;

/// Standard error codes surfaced to transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    NotFound,
    Conflict,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Internal => "INTERNAL",
        };
        write!(f, "{name}")
    }
}

/// Structured operation error. No stack traces cross this boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&StoreError> for OperationError {
    fn from(e: &StoreError) -> Self {
        let code = match e {
            StoreError::NotFound(_) => ErrorCode::NotFound,
            StoreError::Conflict(_) | StoreError::IllegalTransition { .. } => ErrorCode::Conflict,
            StoreError::Database(_) | StoreError::Serialization(_) => ErrorCode::Internal,
        };
        Self {
            code,
            message: e.to_string(),
        }
    }
}

/// Elapsed-time tracker for operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

pub fn start_timer() -> Timer {
    Timer {
        start: Instant::now(),
    }
}

/// Envelope for single-payload operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<OperationError>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl<T> OperationResult<T> {
    pub fn ok(data: T, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            elapsed_ms,
            metadata: Map::new(),
        }
    }

    pub fn fail(code: ErrorCode, message: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(OperationError {
                code,
                message: message.into(),
            }),
            elapsed_ms,
            metadata: Map::new(),
        }
    }

    pub fn store_error(e: &StoreError, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(OperationError::from(e)),
            elapsed_ms,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Envelope for paginated list operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedResult<T> {
    pub success: bool,
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub error: Option<OperationError>,
    pub elapsed_ms: u64,
}

impl<T> PagedResult<T> {
    pub fn ok(items: Vec<T>, total: u64, limit: u32, offset: u32, elapsed_ms: u64) -> Self {
        Self {
            success: true,
            items,
            total,
            limit,
            offset,
            error: None,
            elapsed_ms,
        }
    }

    pub fn fail(code: ErrorCode, message: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            items: vec![],
            total: 0,
            limit: 0,
            offset: 0,
            error: Some(OperationError {
                code,
                message: message.into(),
            }),
            elapsed_ms,
        }
    }

    pub fn store_error(e: &StoreError, elapsed_ms: u64) -> Self {
        let error = OperationError::from(e);
        Self {
            success: false,
            items: vec![],
            total: 0,
            limit: 0,
            offset: 0,
            error: Some(error),
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_result() {
        let result = OperationResult::ok(42u32, 5);
        assert!(result.success);
        assert_eq!(result.data, Some(42));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_fail_result() {
        let result: OperationResult<()> = OperationResult::fail(ErrorCode::NotFound, "missing", 1);
        assert!(!result.success);
        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::NotFound);
        assert_eq!(error.code.to_string(), "NOT_FOUND");
    }

    #[test]
    fn test_store_error_mapping() {
        let not_found = StoreError::NotFound("x".to_string());
        assert_eq!(OperationError::from(&not_found).code, ErrorCode::NotFound);

        let conflict = StoreError::Conflict("dup".to_string());
        assert_eq!(OperationError::from(&conflict).code, ErrorCode::Conflict);

        let db = StoreError::Database("down".to_string());
        assert_eq!(OperationError::from(&db).code, ErrorCode::Internal);
    }

    #[test]
    fn test_serialization_shape() {
        let result = OperationResult::ok("payload", 3);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], serde_json::json!(true));
        assert_eq!(json["data"], serde_json::json!("payload"));
    }
}
