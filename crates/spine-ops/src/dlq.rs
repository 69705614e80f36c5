//! Dead-letter queue operations

use spine_storage::{DeadLetterStore, Pagination};

use crate::context::OperationContext;
use crate::requests::{ListDeadLettersRequest, ResolveDeadLetterRequest};
use crate::responses::DeadLetterSummary;
use crate::result::{start_timer, ErrorCode, OperationResult, PagedResult};

/// List dead letters, unresolved by default.
pub async fn list_dead_letters(
    ctx: &OperationContext,
    request: ListDeadLettersRequest,
) -> PagedResult<DeadLetterSummary> {
    let timer = start_timer();
    let page = Pagination::new(request.offset, request.limit);

    let result = if request.include_resolved {
        ctx.store
            .list_all_dead_letters(request.workflow.as_deref(), page)
            .await
    } else {
        ctx.store
            .list_unresolved(request.workflow.as_deref(), page)
            .await
    };

    match result {
        Ok(entries) => {
            let total = entries.len() as u64;
            PagedResult::ok(
                entries.iter().map(DeadLetterSummary::from).collect(),
                total,
                request.limit,
                request.offset,
                timer.elapsed_ms(),
            )
        }
        Err(e) => PagedResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Resolve a dead letter. One-way; resolving twice is a conflict.
pub async fn resolve_dead_letter(
    ctx: &OperationContext,
    request: ResolveDeadLetterRequest,
) -> OperationResult<bool> {
    let timer = start_timer();

    if ctx.dry_run {
        return OperationResult::ok(false, timer.elapsed_ms())
            .with_metadata("dry_run", serde_json::json!(true));
    }

    match ctx
        .store
        .resolve_dead_letter(
            request.dead_letter_id,
            &ctx.caller,
            request.note.as_deref(),
        )
        .await
    {
        Ok(true) => OperationResult::ok(true, timer.elapsed_ms()),
        Ok(false) => OperationResult::fail(
            ErrorCode::Conflict,
            format!("dead letter {} is already resolved", request.dead_letter_id),
            timer.elapsed_ms(),
        ),
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Count of unresolved dead letters.
pub async fn count_unresolved(ctx: &OperationContext) -> OperationResult<u64> {
    let timer = start_timer();
    match ctx.store.count_unresolved().await {
        Ok(count) => OperationResult::ok(count, timer.elapsed_ms()),
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Aggregate DLQ statistics.
pub async fn dlq_stats(ctx: &OperationContext) -> OperationResult<spine_storage::DlqStats> {
    let timer = start_timer();
    match ctx.store.dlq_stats().await {
        Ok(stats) => OperationResult::ok(stats, timer.elapsed_ms()),
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}
