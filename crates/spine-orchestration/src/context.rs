//! Immutable workflow context
//!
//! Every step reads a consistent snapshot; the runner owns the current
//! reference and publishes a new one after each step. Nothing is mutated in
//! place, so parallel steps can hold their dispatch-time snapshot safely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use spine_core::{ids, utc_now};
use uuid::Uuid;

/// Lineage identifiers carried through a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub batch_id: Option<String>,
    pub parent_execution_id: Option<Uuid>,
}

impl ExecutionContext {
    pub fn new(batch_id: Option<String>) -> Self {
        Self {
            execution_id: ids::new_execution_id(),
            batch_id,
            parent_execution_id: None,
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Immutable snapshot that flows through workflow steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub run_id: Uuid,
    pub workflow_name: String,
    /// Input parameters plus accumulated context updates
    pub params: Map<String, Value>,
    /// Step outputs keyed by step name
    pub outputs: Map<String, Value>,
    /// Partition key for tracking (e.g. {"tier": "NMS_TIER_1"})
    pub partition: Map<String, Value>,
    pub execution: ExecutionContext,
    pub started_at: DateTime<Utc>,
    /// Caller info, dry_run flag, and other free-form metadata
    pub metadata: Map<String, Value>,
}

impl WorkflowContext {
    /// Create a fresh context for a run.
    pub fn create(
        workflow_name: impl Into<String>,
        params: Map<String, Value>,
        dry_run: bool,
    ) -> Self {
        let mut metadata = Map::new();
        metadata.insert("dry_run".to_string(), Value::Bool(dry_run));

        Self {
            run_id: ids::new_run_id(),
            workflow_name: workflow_name.into(),
            params,
            outputs: Map::new(),
            partition: Map::new(),
            execution: ExecutionContext::default(),
            started_at: utc_now(),
            metadata,
        }
    }

    pub fn with_partition(mut self, partition: Map<String, Value>) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_batch_id(mut self, batch_id: impl Into<String>) -> Self {
        self.execution.batch_id = Some(batch_id.into());
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn get_param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Output of a prior step, optionally a single key within it.
    pub fn get_output(&self, step_name: &str, key: Option<&str>) -> Option<&Value> {
        let output = self.outputs.get(step_name)?;
        match key {
            Some(key) => output.get(key),
            None => Some(output),
        }
    }

    pub fn has_output(&self, step_name: &str) -> bool {
        self.outputs.contains_key(step_name)
    }

    pub fn is_dry_run(&self) -> bool {
        self.metadata
            .get("dry_run")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    // =========================================================================
    // Mutation (returns new snapshots)
    // =========================================================================

    /// New context with a step's output recorded.
    pub fn with_output(&self, step_name: &str, output: Value) -> Self {
        let mut next = self.clone();
        next.outputs.insert(step_name.to_string(), output);
        next
    }

    /// New context with parameter updates merged (updates win).
    pub fn with_params(&self, updates: Map<String, Value>) -> Self {
        let mut next = self.clone();
        for (key, value) in updates {
            next.params.insert(key, value);
        }
        next
    }

    /// New context with metadata updates merged.
    pub fn with_metadata(&self, updates: Map<String, Value>) -> Self {
        let mut next = self.clone();
        for (key, value) in updates {
            next.metadata.insert(key, value);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_original_context_is_unchanged() {
        let ctx = WorkflowContext::create("wf", params(&[("tier", json!("T1"))]), false);
        let next = ctx.with_output("ingest", json!({"count": 10}));

        assert!(!ctx.has_output("ingest"));
        assert!(next.has_output("ingest"));
        assert_eq!(ctx.run_id, next.run_id);
    }

    #[test]
    fn test_with_params_merges() {
        let ctx = WorkflowContext::create("wf", params(&[("a", json!(1))]), false);
        let next = ctx.with_params(params(&[("a", json!(2)), ("b", json!(3))]));

        assert_eq!(ctx.get_param("a"), Some(&json!(1)));
        assert_eq!(next.get_param("a"), Some(&json!(2)));
        assert_eq!(next.get_param("b"), Some(&json!(3)));
    }

    #[test]
    fn test_get_output_key_lookup() {
        let ctx = WorkflowContext::create("wf", Map::new(), false)
            .with_output("ingest", json!({"record_count": 100}));

        assert_eq!(
            ctx.get_output("ingest", Some("record_count")),
            Some(&json!(100))
        );
        assert_eq!(ctx.get_output("ingest", Some("missing")), None);
        assert_eq!(ctx.get_output("missing", None), None);
    }

    #[test]
    fn test_dry_run_flag() {
        assert!(WorkflowContext::create("wf", Map::new(), true).is_dry_run());
        assert!(!WorkflowContext::create("wf", Map::new(), false).is_dry_run());
    }

    #[test]
    fn test_serialization_round_trip() {
        let ctx = WorkflowContext::create("wf", params(&[("k", json!("v"))]), false)
            .with_output("s1", json!({"n": 1}));
        let encoded = serde_json::to_string(&ctx).unwrap();
        let decoded: WorkflowContext = serde_json::from_str(&encoded).unwrap();
        assert_eq!(ctx, decoded);
    }
}
