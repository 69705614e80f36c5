//! Operation references
//!
//! Operations are addressed as `kind:name` (e.g. `task:ingest`,
//! `workflow:daily_refresh`). A bare `name` defaults to kind `task`.
//! Unknown kinds are rejected.

use serde::{Deserialize, Serialize};

use crate::error::SpineError;

/// Recognised operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[default]
    Task,
    Workflow,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Workflow => write!(f, "workflow"),
        }
    }
}

/// A parsed `kind:name` operation reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationRef {
    pub kind: OperationKind,
    pub name: String,
}

impl OperationRef {
    pub fn task(name: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Task,
            name: name.into(),
        }
    }

    pub fn workflow(name: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Workflow,
            name: name.into(),
        }
    }

    /// Parse a `kind:name` identifier.
    ///
    /// A bare name defaults to kind `task`. The name part must be non-empty;
    /// kinds other than `task`/`workflow` are validation errors.
    pub fn parse(identifier: &str) -> Result<Self, SpineError> {
        let (kind_part, name) = match identifier.split_once(':') {
            Some((kind, name)) => (kind, name),
            None => ("task", identifier),
        };

        if name.is_empty() {
            return Err(SpineError::validation(format!(
                "operation identifier has empty name: {identifier:?}"
            )));
        }

        let kind = match kind_part {
            "task" => OperationKind::Task,
            "workflow" => OperationKind::Workflow,
            other => {
                return Err(SpineError::validation(format!(
                    "unknown operation kind: {other:?}"
                )))
            }
        };

        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for OperationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

impl std::str::FromStr for OperationRef {
    type Err = SpineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qualified() {
        let op = OperationRef::parse("task:ingest").unwrap();
        assert_eq!(op.kind, OperationKind::Task);
        assert_eq!(op.name, "ingest");
        assert_eq!(op.to_string(), "task:ingest");
    }

    #[test]
    fn test_parse_bare_defaults_to_task() {
        let op = OperationRef::parse("normalize").unwrap();
        assert_eq!(op.kind, OperationKind::Task);
        assert_eq!(op.name, "normalize");
    }

    #[test]
    fn test_parse_workflow_kind() {
        let op = OperationRef::parse("workflow:daily_refresh").unwrap();
        assert_eq!(op.kind, OperationKind::Workflow);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = OperationRef::parse("job:ingest").unwrap_err();
        assert!(err.to_string().contains("unknown operation kind"));
        assert!(!err.retryable);
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(OperationRef::parse("task:").is_err());
        assert!(OperationRef::parse("").is_err());
    }
}
