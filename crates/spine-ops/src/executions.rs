//! Execution operations

use spine_core::{NewExecution, OperationRef, TriggerSource};
use spine_storage::{DeadLetterStore, ExecutionFilter, ExecutionLedger, Pagination};
use tracing::warn;

use crate::context::OperationContext;
use crate::requests::{
    CancelExecutionRequest, GetExecutionEventsRequest, GetExecutionRequest,
    ListExecutionsRequest, RetryExecutionRequest, SubmitExecutionRequest,
};
use crate::responses::{EventSummary, ExecutionDetail, ExecutionSummary};
use crate::result::{start_timer, ErrorCode, OperationResult, PagedResult};

/// List executions with filters, newest first.
pub async fn list_executions(
    ctx: &OperationContext,
    request: ListExecutionsRequest,
) -> PagedResult<ExecutionSummary> {
    let timer = start_timer();

    let status = match request.status.as_deref().map(str::parse).transpose() {
        Ok(status) => status,
        Err(message) => {
            return PagedResult::fail(ErrorCode::ValidationFailed, message, timer.elapsed_ms())
        }
    };
    let trigger_source = match request
        .trigger_source
        .as_deref()
        .map(str::parse)
        .transpose()
    {
        Ok(trigger) => trigger,
        Err(message) => {
            return PagedResult::fail(ErrorCode::ValidationFailed, message, timer.elapsed_ms())
        }
    };

    let filter = ExecutionFilter {
        workflow: request.workflow,
        status,
        lane: request.lane,
        trigger_source,
        parent_execution_id: request.parent_execution_id,
        ..Default::default()
    };

    match ctx
        .store
        .list_executions(filter, Pagination::new(request.offset, request.limit))
        .await
    {
        Ok((rows, total)) => PagedResult::ok(
            rows.iter().map(ExecutionSummary::from).collect(),
            total,
            request.limit,
            request.offset,
            timer.elapsed_ms(),
        ),
        Err(e) => {
            warn!(error = %e, "list_executions failed");
            PagedResult::store_error(&e, timer.elapsed_ms())
        }
    }
}

/// Fetch one execution.
pub async fn get_execution(
    ctx: &OperationContext,
    request: GetExecutionRequest,
) -> OperationResult<ExecutionDetail> {
    let timer = start_timer();

    match ctx.store.get_execution(request.execution_id).await {
        Ok(Some(execution)) => {
            OperationResult::ok(ExecutionDetail::from(&execution), timer.elapsed_ms())
        }
        Ok(None) => OperationResult::fail(
            ErrorCode::NotFound,
            format!("execution not found: {}", request.execution_id),
            timer.elapsed_ms(),
        ),
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Submit a new execution.
///
/// Validates the operation identifier and rejects submissions whose logical
/// key already has an active (pending/queued/running) execution.
pub async fn submit_execution(
    ctx: &OperationContext,
    request: SubmitExecutionRequest,
) -> OperationResult<ExecutionSummary> {
    let timer = start_timer();

    let operation = match OperationRef::parse(&request.operation) {
        Ok(operation) => operation,
        Err(e) => {
            return OperationResult::fail(
                ErrorCode::ValidationFailed,
                e.to_string(),
                timer.elapsed_ms(),
            )
        }
    };

    if let Some(ref key) = request.logical_key {
        match ctx.store.find_active_by_logical_key(key).await {
            Ok(Some(active)) => {
                return OperationResult::fail(
                    ErrorCode::Conflict,
                    format!("active execution {active} already exists for logical key '{key}'"),
                    timer.elapsed_ms(),
                )
            }
            Ok(None) => {}
            Err(e) => return OperationResult::store_error(&e, timer.elapsed_ms()),
        }
    }

    let mut new = NewExecution::new(operation.to_string(), request.params)
        .with_trigger(TriggerSource::Api);
    if let Some(lane) = request.lane {
        new = new.with_lane(lane);
    }
    if let Some(key) = request.logical_key {
        new = new.with_logical_key(key);
    }
    if let Some(key) = request.idempotency_key {
        new = new.with_idempotency_key(key);
    }

    if ctx.dry_run {
        let preview = new.into_execution();
        return OperationResult::ok(ExecutionSummary::from(&preview), timer.elapsed_ms())
            .with_metadata("dry_run", serde_json::json!(true));
    }

    match ctx.store.create_execution(new).await {
        Ok(execution) => {
            OperationResult::ok(ExecutionSummary::from(&execution), timer.elapsed_ms())
        }
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Cancel a pending or queued execution.
pub async fn cancel_execution(
    ctx: &OperationContext,
    request: CancelExecutionRequest,
) -> OperationResult<bool> {
    let timer = start_timer();

    match ctx.store.try_cancel(request.execution_id).await {
        Ok(cancelled) => OperationResult::ok(cancelled, timer.elapsed_ms()),
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Replay a dead letter as a new execution.
///
/// Creates a child execution pointing at the failed one (audit trail stays
/// intact) and records the replay attempt on the dead letter.
pub async fn retry_execution(
    ctx: &OperationContext,
    request: RetryExecutionRequest,
) -> OperationResult<ExecutionSummary> {
    let timer = start_timer();

    let dead_letter = match ctx.store.get_dead_letter(request.dead_letter_id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            return OperationResult::fail(
                ErrorCode::NotFound,
                format!("dead letter not found: {}", request.dead_letter_id),
                timer.elapsed_ms(),
            )
        }
        Err(e) => return OperationResult::store_error(&e, timer.elapsed_ms()),
    };

    if !dead_letter.is_replayable() {
        return OperationResult::fail(
            ErrorCode::Conflict,
            format!(
                "dead letter {} is not replayable (retries {}/{}, resolved: {})",
                dead_letter.id,
                dead_letter.retry_count,
                dead_letter.max_retries,
                dead_letter.resolved_at.is_some()
            ),
            timer.elapsed_ms(),
        );
    }

    if ctx.dry_run {
        let preview = NewExecution::new(dead_letter.workflow.clone(), dead_letter.params.clone())
            .with_trigger(TriggerSource::Retry)
            .into_execution();
        return OperationResult::ok(ExecutionSummary::from(&preview), timer.elapsed_ms())
            .with_metadata("dry_run", serde_json::json!(true));
    }

    if let Err(e) = ctx.store.mark_retry_attempted(dead_letter.id).await {
        return OperationResult::store_error(&e, timer.elapsed_ms());
    }

    let replay = NewExecution::new(dead_letter.workflow.clone(), dead_letter.params.clone())
        .with_trigger(TriggerSource::Retry)
        .with_parent(dead_letter.execution_id);

    match ctx.store.create_execution(replay).await {
        Ok(execution) => {
            if let Err(e) = ctx.store.increment_retry(execution.id).await {
                warn!(execution_id = %execution.id, error = %e, "retry counter update failed");
            }
            OperationResult::ok(ExecutionSummary::from(&execution), timer.elapsed_ms())
        }
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Full event history for an execution.
pub async fn get_execution_events(
    ctx: &OperationContext,
    request: GetExecutionEventsRequest,
) -> PagedResult<EventSummary> {
    let timer = start_timer();

    match ctx.store.get_events(request.execution_id).await {
        Ok(events) => {
            let total = events.len() as u64;
            PagedResult::ok(
                events.iter().map(EventSummary::from).collect(),
                total,
                total as u32,
                0,
                timer.elapsed_ms(),
            )
        }
        Err(e) => PagedResult::store_error(&e, timer.elapsed_ms()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spine_storage::MemoryStore;
    use std::sync::Arc;

    fn ctx() -> OperationContext {
        OperationContext::new(Arc::new(MemoryStore::new()), "tester")
    }

    fn submit(operation: &str) -> SubmitExecutionRequest {
        SubmitExecutionRequest {
            operation: operation.to_string(),
            params: json!({"week": "2026-01-03"}),
            lane: None,
            logical_key: None,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_submit_and_get() {
        let ctx = ctx();
        let submitted = submit_execution(&ctx, submit("task:ingest")).await;
        assert!(submitted.success);
        let summary = submitted.data.unwrap();
        assert_eq!(summary.workflow, "task:ingest");

        let fetched = get_execution(
            &ctx,
            GetExecutionRequest {
                execution_id: summary.id,
            },
        )
        .await;
        assert!(fetched.success);
        assert_eq!(fetched.data.unwrap().params, json!({"week": "2026-01-03"}));
    }

    #[tokio::test]
    async fn test_submit_invalid_operation() {
        let ctx = ctx();
        let result = submit_execution(&ctx, submit("job:bogus")).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn test_logical_key_conflict() {
        let ctx = ctx();
        let mut request = submit("task:ingest");
        request.logical_key = Some("week-2026-01-03".to_string());

        assert!(submit_execution(&ctx, request.clone()).await.success);
        let second = submit_execution(&ctx, request).await;
        assert!(!second.success);
        assert_eq!(second.error.unwrap().code, ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_dry_run_submits_nothing() {
        let ctx = ctx().with_dry_run(true);
        let result = submit_execution(&ctx, submit("task:ingest")).await;
        assert!(result.success);
        assert_eq!(result.metadata.get("dry_run"), Some(&json!(true)));

        let listed = list_executions(&ctx, ListExecutionsRequest::default()).await;
        assert_eq!(listed.total, 0);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let ctx = ctx();
        let result = get_execution(
            &ctx,
            GetExecutionRequest {
                execution_id: uuid::Uuid::now_v7(),
            },
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_list_with_status_filter() {
        let ctx = ctx();
        submit_execution(&ctx, submit("task:a")).await;
        submit_execution(&ctx, submit("task:b")).await;

        let listed = list_executions(
            &ctx,
            ListExecutionsRequest {
                status: Some("pending".to_string()),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(listed.total, 2);

        let bad = list_executions(
            &ctx,
            ListExecutionsRequest {
                status: Some("bogus".to_string()),
                ..Default::default()
            },
        )
        .await;
        assert!(!bad.success);
        assert_eq!(bad.error.unwrap().code, ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn test_retry_dead_letter_creates_child() {
        let ctx = ctx();
        let execution_id = uuid::Uuid::now_v7();
        let entry = ctx
            .store
            .add_dead_letter(execution_id, "task:ingest", json!({"w": 1}), "boom", 2)
            .await
            .unwrap();

        let result = retry_execution(
            &ctx,
            RetryExecutionRequest {
                dead_letter_id: entry.id,
            },
        )
        .await;
        assert!(result.success);
        let replay = result.data.unwrap();
        assert_eq!(replay.trigger_source, "retry");

        let detail = get_execution(
            &ctx,
            GetExecutionRequest {
                execution_id: replay.id,
            },
        )
        .await
        .data
        .unwrap();
        assert_eq!(detail.parent_execution_id, Some(execution_id));

        // Replay accounting advanced
        let updated = ctx.store.get_dead_letter(entry.id).await.unwrap().unwrap();
        assert_eq!(updated.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted_is_conflict() {
        let ctx = ctx();
        let entry = ctx
            .store
            .add_dead_letter(uuid::Uuid::now_v7(), "task:x", json!({}), "boom", 1)
            .await
            .unwrap();
        ctx.store.mark_retry_attempted(entry.id).await.unwrap();

        let result = retry_execution(
            &ctx,
            RetryExecutionRequest {
                dead_letter_id: entry.id,
            },
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_events_listing() {
        let ctx = ctx();
        let submitted = submit_execution(&ctx, submit("task:ingest")).await;
        let id = submitted.data.unwrap().id;

        let events = get_execution_events(&ctx, GetExecutionEventsRequest { execution_id: id })
            .await;
        assert!(events.success);
        assert_eq!(events.items[0].event_type, "created");
    }
}
