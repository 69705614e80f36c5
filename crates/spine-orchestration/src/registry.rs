//! Workflow registry
//!
//! Name → definition lookup, written at startup and read concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use spine_core::SpineError;
use tracing::debug;

use crate::model::Workflow;

/// In-memory registry of workflow definitions.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow, replacing any prior definition with the name.
    pub fn register(&self, workflow: Workflow) {
        debug!(workflow = %workflow.name, "registered workflow");
        self.workflows
            .write()
            .insert(workflow.name.clone(), Arc::new(workflow));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Workflow>, SpineError> {
        self.workflows.read().get(name).cloned().ok_or_else(|| {
            SpineError::orchestration(format!("workflow not registered: {name}"))
                .with_retryable(false)
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.workflows.write().remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Step;

    #[test]
    fn test_register_and_get() {
        let registry = WorkflowRegistry::new();
        registry.register(Workflow::new("wf", vec![Step::pipeline("a", "op")]).unwrap());

        assert!(registry.contains("wf"));
        assert_eq!(registry.get("wf").unwrap().steps.len(), 1);
        assert_eq!(registry.list(), vec!["wf"]);
    }

    #[test]
    fn test_get_missing() {
        let registry = WorkflowRegistry::new();
        let err = registry.get("ghost").unwrap_err();
        assert!(!err.retryable);
    }

    #[test]
    fn test_unregister() {
        let registry = WorkflowRegistry::new();
        registry.register(Workflow::new("wf", vec![Step::pipeline("a", "op")]).unwrap());
        assert!(registry.unregister("wf"));
        assert!(!registry.unregister("wf"));
    }
}
