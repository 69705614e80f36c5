//! Handler registry
//!
//! Maps `kind:name` operation references to async handlers. Written at
//! startup, read concurrently by dispatcher workers. Handlers may declare
//! required parameters, checked before invocation.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use spine_core::{OperationKind, OperationRef, SpineError};

use crate::dispatcher::HandlerContext;

/// Async handler invoked by the dispatcher.
pub type TaskHandler =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, Result<Value, SpineError>> + Send + Sync>;

struct Registered {
    handler: TaskHandler,
    required_params: Vec<String>,
}

/// Name → handler lookup with the `kind:name` convention.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<OperationRef, Registered>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `kind:name`.
    pub fn register<F, Fut>(&self, kind: OperationKind, name: &str, handler: F)
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, SpineError>> + Send + 'static,
    {
        self.register_with_required_params(kind, name, Vec::new(), handler)
    }

    /// Register a handler that requires the listed parameter keys.
    pub fn register_with_required_params<F, Fut>(
        &self,
        kind: OperationKind,
        name: &str,
        required_params: Vec<String>,
        handler: F,
    ) where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, SpineError>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.write().insert(
            OperationRef {
                kind,
                name: name.to_string(),
            },
            Registered {
                handler,
                required_params,
            },
        );
    }

    /// Resolve a `kind:name` identifier (bare names default to `task`).
    ///
    /// Returns the handler and its required-parameter list.
    pub fn resolve(&self, identifier: &str) -> Result<(TaskHandler, Vec<String>), SpineError> {
        let operation = OperationRef::parse(identifier)?;
        let handlers = self.handlers.read();
        let registered = handlers.get(&operation).ok_or_else(|| {
            SpineError::internal(format!("no handler registered for {operation}"))
                .with_retryable(false)
        })?;
        Ok((
            Arc::clone(&registered.handler),
            registered.required_params.clone(),
        ))
    }

    pub fn contains(&self, identifier: &str) -> bool {
        OperationRef::parse(identifier)
            .map(|operation| self.handlers.read().contains_key(&operation))
            .unwrap_or(false)
    }

    /// Registered operation identifiers, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .keys()
            .map(|op| op.to_string())
            .collect();
        names.sort();
        names
    }
}

/// Check that every required key is present in the parameter object.
pub fn validate_required_params(required: &[String], params: &Value) -> Result<(), SpineError> {
    if required.is_empty() {
        return Ok(());
    }
    let object = params.as_object();
    let missing: Vec<&String> = required
        .iter()
        .filter(|key| !object.is_some_and(|map| map.contains_key(key.as_str())))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SpineError::validation(format!(
            "missing required parameters: {missing:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_resolve() {
        let registry = HandlerRegistry::new();
        registry.register(OperationKind::Task, "echo", |ctx: HandlerContext| async move {
            Ok(json!({"echoed": ctx.params}))
        });

        let (handler, required) = registry.resolve("task:echo").unwrap();
        assert!(required.is_empty());

        let ctx = HandlerContext::for_test(json!({"msg": "hi"}));
        let result = handler(ctx).await.unwrap();
        assert_eq!(result, json!({"echoed": {"msg": "hi"}}));
    }

    #[test]
    fn test_bare_name_defaults_to_task() {
        let registry = HandlerRegistry::new();
        registry.register(OperationKind::Task, "echo", |_ctx| async { Ok(json!({})) });

        assert!(registry.contains("echo"));
        assert!(registry.contains("task:echo"));
        assert!(!registry.contains("workflow:echo"));
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::new();
        let err = match registry.resolve("task:ghost") {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("no handler registered"));
        assert!(!err.retryable);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve("job:echo").is_err());
        assert!(!registry.contains("job:echo"));
    }

    #[test]
    fn test_required_params_validation() {
        let required = vec!["week_ending".to_string(), "tier".to_string()];

        assert!(validate_required_params(
            &required,
            &json!({"week_ending": "2026-01-03", "tier": "T1"})
        )
        .is_ok());

        let err =
            validate_required_params(&required, &json!({"week_ending": "2026-01-03"}))
                .unwrap_err();
        assert!(err.to_string().contains("tier"));

        // Non-object params fail when anything is required
        assert!(validate_required_params(&required, &json!(null)).is_err());
    }

    #[test]
    fn test_list_sorted() {
        let registry = HandlerRegistry::new();
        registry.register(OperationKind::Workflow, "refresh", |_ctx| async {
            Ok(json!({}))
        });
        registry.register(OperationKind::Task, "ingest", |_ctx| async { Ok(json!({})) });

        assert_eq!(registry.list(), vec!["task:ingest", "workflow:refresh"]);
    }
}
