//! Workflow operations

use serde_json::{Map, Value};
use spine_orchestration::{WorkflowRegistry, WorkflowRunner};
use spine_storage::{Pagination, WorkflowRunStore};
use tracing::warn;

use crate::context::OperationContext;
use crate::requests::{
    GetWorkflowRequest, GetWorkflowStepsRequest, ListWorkflowRunsRequest, RunWorkflowRequest,
};
use crate::responses::{
    WorkflowRunOutcome, WorkflowRunSummary, WorkflowStepSummary, WorkflowSummary,
};
use crate::result::{start_timer, ErrorCode, OperationResult, PagedResult};

/// List registered workflows.
pub async fn list_workflows(
    _ctx: &OperationContext,
    registry: &WorkflowRegistry,
) -> PagedResult<WorkflowSummary> {
    let timer = start_timer();

    let mut summaries = Vec::new();
    for name in registry.list() {
        match registry.get(&name) {
            Ok(workflow) => summaries.push(WorkflowSummary {
                name: workflow.name.clone(),
                domain: workflow.domain.clone(),
                step_count: workflow.steps.len(),
                description: workflow.description.clone(),
            }),
            Err(e) => warn!(workflow = %name, error = %e, "workflow vanished during listing"),
        }
    }

    let total = summaries.len() as u64;
    PagedResult::ok(summaries, total, total as u32, 0, timer.elapsed_ms())
}

/// Get a workflow definition.
pub async fn get_workflow(
    _ctx: &OperationContext,
    registry: &WorkflowRegistry,
    request: GetWorkflowRequest,
) -> OperationResult<WorkflowSummary> {
    let timer = start_timer();

    if request.name.is_empty() {
        return OperationResult::fail(
            ErrorCode::ValidationFailed,
            "workflow name is required",
            timer.elapsed_ms(),
        );
    }

    match registry.get(&request.name) {
        Ok(workflow) => OperationResult::ok(
            WorkflowSummary {
                name: workflow.name.clone(),
                domain: workflow.domain.clone(),
                step_count: workflow.steps.len(),
                description: workflow.description.clone(),
            },
            timer.elapsed_ms(),
        ),
        Err(e) => OperationResult::fail(ErrorCode::NotFound, e.to_string(), timer.elapsed_ms()),
    }
}

/// Run a registered workflow to completion and report the outcome.
pub async fn run_workflow(
    ctx: &OperationContext,
    registry: &WorkflowRegistry,
    runner: &WorkflowRunner,
    request: RunWorkflowRequest,
) -> OperationResult<WorkflowRunOutcome> {
    let timer = start_timer();

    let workflow = match registry.get(&request.name) {
        Ok(workflow) => workflow,
        Err(e) => {
            return OperationResult::fail(ErrorCode::NotFound, e.to_string(), timer.elapsed_ms())
        }
    };

    let params: Map<String, Value> = match request.params {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return OperationResult::fail(
                ErrorCode::ValidationFailed,
                format!("workflow params must be an object, got {other}"),
                timer.elapsed_ms(),
            )
        }
    };

    if ctx.dry_run {
        // Plan-only pass: validates the DAG without executing anything
        let planner = spine_orchestration::Planner::new();
        return match planner.resolve(&workflow, &params) {
            Ok(plan) => OperationResult::ok(
                WorkflowRunOutcome {
                    run_id: uuid::Uuid::now_v7(),
                    workflow_name: workflow.name.clone(),
                    status: "planned".to_string(),
                    step_statuses: plan
                        .steps
                        .iter()
                        .map(|s| (s.step.name.clone(), "planned".to_string()))
                        .collect(),
                },
                timer.elapsed_ms(),
            )
            .with_metadata("dry_run", serde_json::json!(true)),
            Err(e) => OperationResult::fail(
                ErrorCode::ValidationFailed,
                e.to_string(),
                timer.elapsed_ms(),
            ),
        };
    }

    match runner.execute(&workflow, params).await {
        Ok(result) => OperationResult::ok(
            WorkflowRunOutcome {
                run_id: result.run_id,
                workflow_name: result.workflow_name.clone(),
                status: result.status.to_string(),
                step_statuses: result
                    .steps
                    .iter()
                    .map(|s| (s.step_name.clone(), s.status.to_string()))
                    .collect(),
            },
            timer.elapsed_ms(),
        ),
        Err(e) => OperationResult::fail(
            ErrorCode::ValidationFailed,
            e.to_string(),
            timer.elapsed_ms(),
        ),
    }
}

/// List recorded workflow runs.
pub async fn list_workflow_runs(
    ctx: &OperationContext,
    request: ListWorkflowRunsRequest,
) -> PagedResult<WorkflowRunSummary> {
    let timer = start_timer();

    match ctx
        .store
        .list_workflow_runs(
            request.workflow.as_deref(),
            Pagination::new(request.offset, request.limit),
        )
        .await
    {
        Ok(runs) => {
            let total = runs.len() as u64;
            PagedResult::ok(
                runs.iter().map(WorkflowRunSummary::from).collect(),
                total,
                request.limit,
                request.offset,
                timer.elapsed_ms(),
            )
        }
        Err(e) => PagedResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Step rows for one workflow run.
pub async fn get_workflow_steps(
    ctx: &OperationContext,
    request: GetWorkflowStepsRequest,
) -> PagedResult<WorkflowStepSummary> {
    let timer = start_timer();

    match ctx.store.list_workflow_steps(request.run_id).await {
        Ok(steps) => {
            let total = steps.len() as u64;
            PagedResult::ok(
                steps.iter().map(WorkflowStepSummary::from).collect(),
                total,
                total as u32,
                0,
                timer.elapsed_ms(),
            )
        }
        Err(e) => PagedResult::store_error(&e, timer.elapsed_ms()),
    }
}
