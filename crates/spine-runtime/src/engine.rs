//! Job Engine — single entry point for job submission and lifecycle
//!
//! Submit flow: resolve the adapter through the router, validate the spec
//! against its capabilities, dedup on idempotency key through the ledger,
//! create the execution row, then dispatch to the adapter behind its circuit
//! breaker. Status / cancel / logs / cleanup resolve the adapter via the
//! runtime recorded on the execution row and delegate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spine_core::{ExecutionStatus, NewExecution};
use spine_storage::{ExecutionFilter, ExecutionLedger, Pagination, StoreError};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapter::{LogStream, RuntimeAdapter, RuntimeHealth};
use crate::breaker::{BreakerRegistry, CircuitBreakerConfig};
use crate::error::JobError;
use crate::router::AdapterRouter;
use crate::spec::{ContainerJobSpec, JobStatus};
use crate::validator::SpecValidator;

/// Result of a successful (or deduplicated) submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub execution_id: Uuid,
    pub external_ref: Option<String>,
    pub runtime: String,
    pub spec_hash: String,
}

/// Facade over router, validator, ledger and per-runtime breakers.
pub struct JobEngine {
    router: Arc<AdapterRouter>,
    ledger: Arc<dyn ExecutionLedger>,
    validator: SpecValidator,
    breakers: BreakerRegistry,
}

impl JobEngine {
    pub fn new(router: Arc<AdapterRouter>, ledger: Arc<dyn ExecutionLedger>) -> Self {
        Self {
            router,
            ledger,
            validator: SpecValidator::new(),
            breakers: BreakerRegistry::default(),
        }
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breakers = BreakerRegistry::new(config);
        self
    }

    pub fn router(&self) -> &AdapterRouter {
        &self.router
    }

    fn store_err(e: StoreError) -> JobError {
        let mut err = JobError::internal("engine", e.to_string());
        err.retryable = e.is_retryable();
        err
    }

    /// Submit a job spec.
    ///
    /// Idempotent on the spec's `idempotency_key`: repeated submissions
    /// return the original `SubmitResult` without touching the adapter.
    #[instrument(skip(self, spec), fields(job = %spec.name))]
    pub async fn submit(&self, spec: &ContainerJobSpec) -> Result<SubmitResult, JobError> {
        let adapter = self.router.resolve(spec)?;
        self.validator.validate_or_raise(spec, adapter.as_ref())?;
        let spec_hash = spec.spec_hash();

        if let Some(ref key) = spec.idempotency_key {
            if let Some(existing) = self
                .ledger
                .get_by_idempotency_key(key)
                .await
                .map_err(Self::store_err)?
            {
                debug!(execution_id = %existing.id, "submit deduplicated on idempotency key");
                return Ok(SubmitResult {
                    execution_id: existing.id,
                    external_ref: existing.external_ref,
                    runtime: existing.runtime.unwrap_or_else(|| adapter.name().to_string()),
                    spec_hash,
                });
            }
        }

        let mut new = NewExecution::new(
            spec.name.clone(),
            serde_json::to_value(spec)
                .map_err(|e| JobError::internal("engine", e.to_string()))?,
        )
        .with_lane("jobs");
        if let Some(ref key) = spec.idempotency_key {
            new = new.with_idempotency_key(key.clone());
        }

        let execution = self
            .ledger
            .create_execution(new)
            .await
            .map_err(Self::store_err)?;

        let breaker = self.breakers.get_or_create(adapter.name());
        if !breaker.try_acquire() {
            let err = JobError::unavailable(
                adapter.name(),
                format!("circuit open for runtime {}", adapter.name()),
            );
            self.ledger
                .update_status(
                    execution.id,
                    ExecutionStatus::Failed,
                    None,
                    Some(err.to_string()),
                )
                .await
                .map_err(Self::store_err)?;
            return Err(err);
        }

        match adapter.submit(spec).await {
            Ok(external_ref) => {
                breaker.record_success();
                self.ledger
                    .set_runtime(execution.id, adapter.name(), Some(&external_ref))
                    .await
                    .map_err(Self::store_err)?;

                info!(
                    execution_id = %execution.id,
                    runtime = adapter.name(),
                    external_ref = %external_ref,
                    "job submitted"
                );
                Ok(SubmitResult {
                    execution_id: execution.id,
                    external_ref: Some(external_ref),
                    runtime: adapter.name().to_string(),
                    spec_hash,
                })
            }
            Err(err) => {
                breaker.record_failure();
                warn!(
                    execution_id = %execution.id,
                    runtime = adapter.name(),
                    error = %err,
                    "adapter submit failed"
                );
                self.ledger
                    .update_status(
                        execution.id,
                        ExecutionStatus::Failed,
                        None,
                        Some(err.to_string()),
                    )
                    .await
                    .map_err(Self::store_err)?;
                Err(err)
            }
        }
    }

    /// Resolve the adapter and external reference for a recorded execution.
    async fn resolve_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<(Arc<dyn RuntimeAdapter>, String), JobError> {
        let execution = self
            .ledger
            .get_execution(execution_id)
            .await
            .map_err(Self::store_err)?
            .ok_or_else(|| {
                JobError::not_found("engine", format!("unknown execution: {execution_id}"))
            })?;

        let runtime = execution.runtime.ok_or_else(|| {
            JobError::not_found(
                "engine",
                format!("execution {execution_id} was never dispatched to a runtime"),
            )
        })?;
        let external_ref = execution.external_ref.ok_or_else(|| {
            JobError::not_found(
                "engine",
                format!("execution {execution_id} has no external reference"),
            )
        })?;

        let adapter = self
            .router
            .get(&runtime)
            .ok_or_else(|| JobError::not_found(&runtime, format!("runtime not registered: {runtime}")))?;

        Ok((adapter, external_ref))
    }

    /// Backend status for an execution.
    pub async fn status(&self, execution_id: Uuid) -> Result<JobStatus, JobError> {
        let (adapter, external_ref) = self.resolve_execution(execution_id).await?;
        adapter.status(&external_ref).await
    }

    /// Cancel an execution.
    ///
    /// Pending/queued rows are cancelled in the ledger directly; running jobs
    /// are cancelled through their adapter and the ledger row follows.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool, JobError> {
        if self
            .ledger
            .try_cancel(execution_id)
            .await
            .map_err(Self::store_err)?
        {
            return Ok(true);
        }

        let (adapter, external_ref) = self.resolve_execution(execution_id).await?;
        let cancelled = adapter.cancel(&external_ref).await?;
        if cancelled {
            // Best-effort ledger transition; the row may already be terminal.
            if let Err(e) = self
                .ledger
                .update_status(execution_id, ExecutionStatus::Cancelled, None, None)
                .await
            {
                debug!(execution_id = %execution_id, error = %e, "cancel ledger update skipped");
            }
        }
        Ok(cancelled)
    }

    /// Stream logs for an execution.
    pub async fn logs(&self, execution_id: Uuid) -> Result<LogStream, JobError> {
        let (adapter, external_ref) = self.resolve_execution(execution_id).await?;
        adapter.logs(&external_ref).await
    }

    /// Release backend resources for an execution. Idempotent.
    pub async fn cleanup(&self, execution_id: Uuid) -> Result<(), JobError> {
        let (adapter, external_ref) = self.resolve_execution(execution_id).await?;
        adapter.cleanup(&external_ref).await
    }

    /// List job executions from the ledger.
    pub async fn list_jobs(
        &self,
        filter: ExecutionFilter,
        page: Pagination,
    ) -> Result<(Vec<spine_core::Execution>, u64), JobError> {
        self.ledger
            .list_executions(filter, page)
            .await
            .map_err(Self::store_err)
    }

    /// Health of one runtime, or all registered runtimes.
    pub async fn health(&self, runtime: Option<&str>) -> Result<Vec<RuntimeHealth>, JobError> {
        match runtime {
            Some(name) => {
                let adapter = self.router.get(name).ok_or_else(|| {
                    JobError::not_found(name, format!("runtime not registered: {name}"))
                })?;
                Ok(vec![adapter.health().await])
            }
            None => {
                let mut reports = Vec::new();
                for adapter in self.router.all() {
                    reports.push(adapter.health().await);
                }
                reports.sort_by(|a, b| a.runtime.cmp(&b.runtime));
                Ok(reports)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::stub::StubAdapter;
    use spine_storage::MemoryStore;

    fn engine_with_stub(auto_succeed: bool) -> (JobEngine, Arc<StubAdapter>, Arc<MemoryStore>) {
        let stub = Arc::new(StubAdapter::new(auto_succeed));
        let router = Arc::new(AdapterRouter::new());
        router.register(Arc::clone(&stub) as Arc<dyn RuntimeAdapter>);

        let store = Arc::new(MemoryStore::new());
        let engine = JobEngine::new(router, Arc::clone(&store) as Arc<dyn ExecutionLedger>);
        (engine, stub, store)
    }

    fn spec(name: &str) -> ContainerJobSpec {
        ContainerJobSpec::new(name, "python:3.12").with_command(["echo", "hi"])
    }

    #[tokio::test]
    async fn test_submit_records_execution() {
        let (engine, _stub, store) = engine_with_stub(true);

        let result = engine.submit(&spec("data-processor")).await.unwrap();
        assert_eq!(result.runtime, "stub");
        assert!(result.external_ref.is_some());
        assert!(!result.spec_hash.is_empty());

        let execution = store
            .get_execution(result.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.runtime.as_deref(), Some("stub"));
        assert_eq!(execution.external_ref, result.external_ref);
    }

    #[tokio::test]
    async fn test_idempotent_submit_skips_adapter() {
        let (engine, stub, store) = engine_with_stub(true);
        let spec = spec("j").with_idempotency_key("k1");

        let first = engine.submit(&spec).await.unwrap();
        let second = engine.submit(&spec).await.unwrap();

        assert_eq!(first.execution_id, second.execution_id);
        assert_eq!(first.external_ref, second.external_ref);
        assert_eq!(stub.submit_count(), 1);

        let (_, total) = store
            .list_executions(ExecutionFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_validation_failure_rejected_before_dispatch() {
        let (engine, stub, _store) = engine_with_stub(true);
        let mut bad = spec("gpu");
        bad.resources.gpu = 1;

        let err = engine.submit(&bad).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert_eq!(stub.submit_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_failure_marks_execution_failed() {
        let (engine, stub, store) = engine_with_stub(true);
        stub.fail_submit
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = engine.submit(&spec("j")).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::RuntimeUnavailable);

        let (rows, _) = store
            .list_executions(ExecutionFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(rows[0].status, ExecutionStatus::Failed);
        assert!(rows[0].error.as_ref().unwrap().contains("injected"));
    }

    #[tokio::test]
    async fn test_status_and_cancel_roundtrip() {
        let (engine, _stub, _store) = engine_with_stub(false);

        let result = engine.submit(&spec("j")).await.unwrap();
        let status = engine.status(result.execution_id).await.unwrap();
        assert_eq!(status.state, crate::spec::JobState::Running);

        assert!(engine.cancel(result.execution_id).await.unwrap());
        let status = engine.status(result.execution_id).await.unwrap();
        assert_eq!(status.state, crate::spec::JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_repeated_failures() {
        let (engine, stub, _store) = engine_with_stub(true);
        let engine = JobEngine {
            breakers: BreakerRegistry::new(
                CircuitBreakerConfig::new()
                    .with_failure_threshold(2)
                    .with_recovery_timeout(std::time::Duration::from_secs(600)),
            ),
            ..engine
        };
        stub.fail_submit
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let _ = engine.submit(&spec("a")).await;
        let _ = engine.submit(&spec("b")).await;

        // Circuit now open: the adapter is no longer called
        let before = stub.submit_count();
        let err = engine.submit(&spec("c")).await.unwrap_err();
        assert!(err.message.contains("circuit open"));
        assert_eq!(stub.submit_count(), before);
    }

    #[tokio::test]
    async fn test_health_reports() {
        let (engine, stub, _store) = engine_with_stub(true);
        let reports = engine.health(None).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].healthy);

        stub.fail_health
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let reports = engine.health(Some("stub")).await.unwrap();
        assert!(!reports[0].healthy);
    }
}
