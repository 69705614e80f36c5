//! Workflow model — pure data, no execution logic
//!
//! Steps are a tagged sum type rather than a class hierarchy; the runner
//! matches on the variant. Definitions serialize cleanly to JSON/YAML.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::retry::StepRetryPolicy;

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the run immediately (default)
    #[default]
    Stop,
    /// Continue with steps that do not depend on the failed one
    Continue,
}

/// How steps are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One at a time, in topological order (default)
    #[default]
    Sequential,
    /// Concurrent dispatch respecting dependency edges
    Parallel,
}

/// Execution policy for a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub mode: ExecutionMode,
    /// Concurrent step bound, parallel mode only
    pub max_concurrency: usize,
    pub on_failure: FailurePolicy,
    /// Bound on the whole run
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_secs")]
    pub timeout: Option<Duration>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            max_concurrency: 4,
            on_failure: FailurePolicy::Stop,
            timeout: None,
        }
    }
}

impl ExecutionPolicy {
    pub fn sequential(on_failure: FailurePolicy) -> Self {
        Self {
            mode: ExecutionMode::Sequential,
            on_failure,
            ..Default::default()
        }
    }

    pub fn parallel(max_concurrency: usize, on_failure: FailurePolicy) -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            max_concurrency: max_concurrency.max(1),
            on_failure,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Condition evaluated by a choice step against the workflow context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Parameter equals a literal value
    ParamEquals { key: String, value: Value },
    /// Parameter is present and truthy (non-null, non-false, non-empty)
    ParamTruthy { key: String },
    /// A prior step's output value equals a literal
    OutputEquals {
        step: String,
        key: String,
        value: Value,
    },
}

/// The step variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Delegate to a registered operation by name
    Pipeline {
        operation: String,
        #[serde(default)]
        params: Map<String, Value>,
    },

    /// Invoke an in-process handler registered with the runner
    Lambda {
        handler: String,
        #[serde(default)]
        config: Map<String, Value>,
    },

    /// Branch: run `then_step` when the condition holds, else `else_step`
    Choice {
        condition: Condition,
        then_step: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        else_step: Option<String>,
    },

    /// Deliberate pause
    Wait {
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        until: Option<DateTime<Utc>>,
    },

    /// Fan out one operation over a collection in the context params
    Map {
        items_path: String,
        operation: String,
        max_concurrency: usize,
    },
}

impl StepKind {
    /// Short tag for persistence and display.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Pipeline { .. } => "pipeline",
            Self::Lambda { .. } => "lambda",
            Self::Choice { .. } => "choice",
            Self::Wait { .. } => "wait",
            Self::Map { .. } => "map",
        }
    }
}

/// One step within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the workflow
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub on_error: FailurePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<StepRetryPolicy>,
}

impl Step {
    pub fn pipeline(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Pipeline {
                operation: operation.into(),
                params: Map::new(),
            },
            depends_on: vec![],
            on_error: FailurePolicy::default(),
            retry: None,
        }
    }

    pub fn lambda(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Lambda {
                handler: handler.into(),
                config: Map::new(),
            },
            depends_on: vec![],
            on_error: FailurePolicy::default(),
            retry: None,
        }
    }

    pub fn choice(
        name: impl Into<String>,
        condition: Condition,
        then_step: impl Into<String>,
        else_step: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Choice {
                condition,
                then_step: then_step.into(),
                else_step,
            },
            depends_on: vec![],
            on_error: FailurePolicy::default(),
            retry: None,
        }
    }

    pub fn wait_seconds(name: impl Into<String>, seconds: u64) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Wait {
                duration_seconds: Some(seconds),
                until: None,
            },
            depends_on: vec![],
            on_error: FailurePolicy::default(),
            retry: None,
        }
    }

    pub fn map(
        name: impl Into<String>,
        items_path: impl Into<String>,
        operation: impl Into<String>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::Map {
                items_path: items_path.into(),
                operation: operation.into(),
                max_concurrency: max_concurrency.max(1),
            },
            depends_on: vec![],
            on_error: FailurePolicy::default(),
            retry: None,
        }
    }

    pub fn with_params(mut self, new_params: Map<String, Value>) -> Self {
        if let StepKind::Pipeline { ref mut params, .. } = self.kind {
            *params = new_params;
        }
        self
    }

    pub fn with_depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_on_error(mut self, policy: FailurePolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_retry(mut self, retry: StepRetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Step-level parameter overrides (pipeline steps only).
    pub fn params(&self) -> Map<String, Value> {
        match &self.kind {
            StepKind::Pipeline { params, .. } => params.clone(),
            _ => Map::new(),
        }
    }
}

/// A named DAG of steps with defaults and an execution policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub defaults: Map<String, Value>,
    #[serde(default)]
    pub policy: ExecutionPolicy,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_version() -> u32 {
    1
}

impl Workflow {
    /// Create a workflow, validating step-name uniqueness.
    pub fn new(
        name: impl Into<String>,
        steps: Vec<Step>,
    ) -> Result<Self, crate::planner::PlanError> {
        let workflow = Self {
            name: name.into(),
            domain: String::new(),
            version: 1,
            description: String::new(),
            steps,
            defaults: Map::new(),
            policy: ExecutionPolicy::default(),
            tags: vec![],
        };
        workflow.validate_names()?;
        Ok(workflow)
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn validate_names(&self) -> Result<(), crate::planner::PlanError> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(crate::planner::PlanError::DuplicateStep {
                    name: step.name.clone(),
                });
            }
        }
        Ok(())
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs: Option<u64> = Option::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_step_names_rejected() {
        let err = Workflow::new(
            "dup",
            vec![Step::pipeline("a", "op.one"), Step::pipeline("a", "op.two")],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::planner::PlanError::DuplicateStep { .. }
        ));
    }

    #[test]
    fn test_step_builders() {
        let step = Step::pipeline("ingest", "finra.ingest_week")
            .with_depends_on(["fetch"])
            .with_on_error(FailurePolicy::Continue);

        assert_eq!(step.name, "ingest");
        assert_eq!(step.depends_on, vec!["fetch"]);
        assert_eq!(step.on_error, FailurePolicy::Continue);
        assert_eq!(step.kind.type_name(), "pipeline");
    }

    #[test]
    fn test_workflow_serialization_round_trip() {
        let workflow = Workflow::new(
            "weekly_refresh",
            vec![
                Step::pipeline("ingest", "otc.ingest"),
                Step::pipeline("normalize", "otc.normalize").with_depends_on(["ingest"]),
            ],
        )
        .unwrap()
        .with_domain("otc")
        .with_policy(ExecutionPolicy::parallel(2, FailurePolicy::Continue));

        let json = serde_json::to_string(&workflow).unwrap();
        let parsed: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(workflow, parsed);
    }

    #[test]
    fn test_policy_factories() {
        let p = ExecutionPolicy::parallel(0, FailurePolicy::Stop);
        assert_eq!(p.max_concurrency, 1);
        assert_eq!(p.mode, ExecutionMode::Parallel);

        let s = ExecutionPolicy::sequential(FailurePolicy::Continue);
        assert_eq!(s.mode, ExecutionMode::Sequential);
    }

    #[test]
    fn test_step_params_only_for_pipelines() {
        let mut params = Map::new();
        params.insert("tier".to_string(), json!("T1"));
        let step = Step::pipeline("a", "op").with_params(params.clone());
        assert_eq!(step.params(), params);

        let wait = Step::wait_seconds("w", 5);
        assert!(wait.params().is_empty());
    }
}
