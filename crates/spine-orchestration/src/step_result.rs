//! Step result envelope
//!
//! Every step execution coerces into a `StepResult`: success flag, output,
//! context updates for the next snapshot, optional quality metrics, and an
//! error category the runner uses to decide retry eligibility.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fixed error categories for step failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepErrorCategory {
    Internal,
    DataQuality,
    Transient,
    Timeout,
    Dependency,
    Configuration,
}

impl StepErrorCategory {
    /// Whether a retry of the step may succeed. Data quality and
    /// configuration failures are deterministic; retrying them burns
    /// attempts for nothing.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Internal | Self::Transient | Self::Timeout)
    }
}

impl std::fmt::Display for StepErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Internal => "INTERNAL",
            Self::DataQuality => "DATA_QUALITY",
            Self::Transient => "TRANSIENT",
            Self::Timeout => "TIMEOUT",
            Self::Dependency => "DEPENDENCY",
            Self::Configuration => "CONFIGURATION",
        };
        write!(f, "{name}")
    }
}

/// Data quality metrics attached to a step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QualityMetrics {
    pub record_count: u64,
    pub valid_count: u64,
    pub null_count: u64,
    pub valid_rate: f64,
    pub passed: bool,
    #[serde(default)]
    pub custom: Map<String, Value>,
}

impl QualityMetrics {
    pub fn new(record_count: u64, valid_count: u64, null_count: u64) -> Self {
        let valid_rate = if record_count == 0 {
            1.0
        } else {
            valid_count as f64 / record_count as f64
        };
        Self {
            record_count,
            valid_count,
            null_count,
            valid_rate,
            passed: true,
            custom: Map::new(),
        }
    }

    pub fn with_passed(mut self, passed: bool) -> Self {
        self.passed = passed;
        self
    }
}

/// Result envelope returned by step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub output: Map<String, Value>,
    /// Merged into the context params for downstream steps
    #[serde(default)]
    pub context_updates: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<StepErrorCategory>,
    /// Events emitted by the step, recorded by the runner
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Value>,
    /// Branch override produced by choice steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
}

impl StepResult {
    /// Successful result with no output.
    pub fn ok() -> Self {
        Self {
            success: true,
            output: Map::new(),
            context_updates: Map::new(),
            quality: None,
            error: None,
            error_category: None,
            events: vec![],
            next_step: None,
        }
    }

    /// Successful result with output.
    pub fn ok_with(output: Map<String, Value>) -> Self {
        Self {
            output,
            ..Self::ok()
        }
    }

    /// Failed result with a message and category.
    pub fn failed(error: impl Into<String>, category: StepErrorCategory) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_category: Some(category),
            ..Self::ok()
        }
    }

    pub fn with_context_updates(mut self, updates: Map<String, Value>) -> Self {
        self.context_updates = updates;
        self
    }

    pub fn with_quality(mut self, quality: QualityMetrics) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_next_step(mut self, next_step: impl Into<String>) -> Self {
        self.next_step = Some(next_step.into());
        self
    }

    /// Coerce an arbitrary step return value into a `StepResult`.
    ///
    /// Rules: a serialized `StepResult` passes through; null becomes an
    /// empty success; a plain object becomes a success with that output; a
    /// bool becomes the success flag; any other primitive is wrapped under
    /// the `"value"` key.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::ok(),
            Value::Bool(success) => {
                if success {
                    Self::ok()
                } else {
                    Self::failed("step returned false", StepErrorCategory::Internal)
                }
            }
            Value::Object(map) => {
                if map.contains_key("success") {
                    if let Ok(result) =
                        serde_json::from_value::<StepResult>(Value::Object(map.clone()))
                    {
                        return result;
                    }
                }
                Self::ok_with(map)
            }
            primitive => {
                let mut output = Map::new();
                output.insert("value".to_string(), primitive);
                Self::ok_with(output)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_null() {
        let result = StepResult::from_value(Value::Null);
        assert!(result.success);
        assert!(result.output.is_empty());
    }

    #[test]
    fn test_from_value_bool() {
        assert!(StepResult::from_value(json!(true)).success);
        let failed = StepResult::from_value(json!(false));
        assert!(!failed.success);
        assert_eq!(failed.error_category, Some(StepErrorCategory::Internal));
    }

    #[test]
    fn test_from_value_object() {
        let result = StepResult::from_value(json!({"rows": 10}));
        assert!(result.success);
        assert_eq!(result.output.get("rows"), Some(&json!(10)));
    }

    #[test]
    fn test_from_value_step_result_passthrough() {
        let original = StepResult::failed("bad data", StepErrorCategory::DataQuality);
        let encoded = serde_json::to_value(&original).unwrap();
        let decoded = StepResult::from_value(encoded);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_from_value_primitive_wrapped() {
        let result = StepResult::from_value(json!(42));
        assert_eq!(result.output.get("value"), Some(&json!(42)));
    }

    #[test]
    fn test_quality_metrics_rate() {
        let q = QualityMetrics::new(100, 95, 5);
        assert!((q.valid_rate - 0.95).abs() < f64::EPSILON);
        assert!(q.passed);

        let empty = QualityMetrics::new(0, 0, 0);
        assert!((empty.valid_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retryable_categories() {
        assert!(StepErrorCategory::Transient.is_retryable());
        assert!(StepErrorCategory::Timeout.is_retryable());
        assert!(StepErrorCategory::Internal.is_retryable());
        assert!(!StepErrorCategory::DataQuality.is_retryable());
        assert!(!StepErrorCategory::Configuration.is_retryable());
        assert!(!StepErrorCategory::Dependency.is_retryable());
    }
}
