//! Schedule operations

use spine_core::{utc_now, NewExecution, OperationKind, TriggerSource};
use spine_storage::{ExecutionLedger, NewSchedule, Pagination, ScheduleStore, ScheduleUpdate};
use spine_worker::{compute_next_run, validate_cron_expression};

use crate::context::OperationContext;
use crate::requests::{
    CreateScheduleRequest, ListSchedulesRequest, ScheduleIdRequest, UpdateScheduleRequest,
};
use crate::responses::{ExecutionSummary, ScheduleRunSummary, ScheduleSummary};
use crate::result::{start_timer, ErrorCode, OperationResult, PagedResult};

fn parse_target_type(s: &str) -> Result<OperationKind, String> {
    match s {
        "task" => Ok(OperationKind::Task),
        "workflow" => Ok(OperationKind::Workflow),
        other => Err(format!("target_type must be task or workflow, got '{other}'")),
    }
}

/// Create a schedule, validating the trigger definition and computing the
/// first `next_run_at`.
pub async fn create_schedule(
    ctx: &OperationContext,
    request: CreateScheduleRequest,
) -> OperationResult<ScheduleSummary> {
    let timer = start_timer();

    let target_type = match parse_target_type(&request.target_type) {
        Ok(kind) => kind,
        Err(message) => {
            return OperationResult::fail(
                ErrorCode::ValidationFailed,
                message,
                timer.elapsed_ms(),
            )
        }
    };

    let mut new = match request.kind.as_str() {
        "cron" => {
            let Some(ref expression) = request.cron_expression else {
                return OperationResult::fail(
                    ErrorCode::ValidationFailed,
                    "cron schedules require cron_expression",
                    timer.elapsed_ms(),
                );
            };
            if let Err(e) = validate_cron_expression(expression) {
                return OperationResult::fail(
                    ErrorCode::ValidationFailed,
                    e.to_string(),
                    timer.elapsed_ms(),
                );
            }
            NewSchedule::cron(&request.name, target_type, &request.target_name, expression)
        }
        "interval" => {
            let Some(seconds) = request.interval_seconds.filter(|s| *s >= 1) else {
                return OperationResult::fail(
                    ErrorCode::ValidationFailed,
                    "interval schedules require interval_seconds >= 1",
                    timer.elapsed_ms(),
                );
            };
            NewSchedule::interval(
                &request.name,
                target_type,
                &request.target_name,
                std::time::Duration::from_secs(seconds),
            )
        }
        other => {
            return OperationResult::fail(
                ErrorCode::ValidationFailed,
                format!("kind must be cron or interval, got '{other}'"),
                timer.elapsed_ms(),
            )
        }
    };

    new = new
        .with_timezone(request.timezone)
        .with_params(request.params_template)
        .with_misfire_grace(std::time::Duration::from_secs(request.misfire_grace_seconds))
        .with_enabled(request.enabled);

    if ctx.dry_run {
        let preview = ScheduleSummary {
            id: uuid::Uuid::now_v7(),
            name: new.name.clone(),
            target: format!("{}:{}", new.target_type, new.target_name),
            kind: new.kind.to_string(),
            enabled: new.enabled,
            last_run_at: None,
            next_run_at: None,
        };
        return OperationResult::ok(preview, timer.elapsed_ms())
            .with_metadata("dry_run", serde_json::json!(true));
    }

    let created = match ctx.store.create_schedule(new).await {
        Ok(schedule) => schedule,
        Err(e) => return OperationResult::store_error(&e, timer.elapsed_ms()),
    };

    // Seed next_run_at so the scheduler can pick it up
    let next = match compute_next_run(&created, utc_now()) {
        Ok(next) => next,
        Err(e) => {
            return OperationResult::fail(
                ErrorCode::ValidationFailed,
                e.to_string(),
                timer.elapsed_ms(),
            )
        }
    };
    if let Some(next) = next {
        if let Err(e) = ctx
            .store
            .update_schedule(
                created.id,
                ScheduleUpdate {
                    next_run_at: Some(next),
                    ..Default::default()
                },
            )
            .await
        {
            return OperationResult::store_error(&e, timer.elapsed_ms());
        }
    }

    match ctx.store.get_schedule(created.id).await {
        Ok(Some(schedule)) => {
            OperationResult::ok(ScheduleSummary::from(&schedule), timer.elapsed_ms())
        }
        Ok(None) => OperationResult::fail(
            ErrorCode::Internal,
            "schedule disappeared after creation",
            timer.elapsed_ms(),
        ),
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// List schedules.
pub async fn list_schedules(
    ctx: &OperationContext,
    request: ListSchedulesRequest,
) -> PagedResult<ScheduleSummary> {
    let timer = start_timer();

    match ctx
        .store
        .list_schedules(
            request.enabled_only,
            Pagination::new(request.offset, request.limit),
        )
        .await
    {
        Ok(schedules) => {
            let total = schedules.len() as u64;
            PagedResult::ok(
                schedules.iter().map(ScheduleSummary::from).collect(),
                total,
                request.limit,
                request.offset,
                timer.elapsed_ms(),
            )
        }
        Err(e) => PagedResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Fetch one schedule.
pub async fn get_schedule(
    ctx: &OperationContext,
    request: ScheduleIdRequest,
) -> OperationResult<ScheduleSummary> {
    let timer = start_timer();

    match ctx.store.get_schedule(request.schedule_id).await {
        Ok(Some(schedule)) => {
            OperationResult::ok(ScheduleSummary::from(&schedule), timer.elapsed_ms())
        }
        Ok(None) => OperationResult::fail(
            ErrorCode::NotFound,
            format!("schedule not found: {}", request.schedule_id),
            timer.elapsed_ms(),
        ),
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Update a schedule's trigger, parameters or enabled flag.
pub async fn update_schedule(
    ctx: &OperationContext,
    request: UpdateScheduleRequest,
) -> OperationResult<bool> {
    let timer = start_timer();

    if let Some(ref expression) = request.cron_expression {
        if let Err(e) = validate_cron_expression(expression) {
            return OperationResult::fail(
                ErrorCode::ValidationFailed,
                e.to_string(),
                timer.elapsed_ms(),
            );
        }
    }

    let update = ScheduleUpdate {
        cron_expression: request.cron_expression,
        interval_seconds: request.interval_seconds,
        params_template: request.params_template,
        enabled: request.enabled,
        next_run_at: None,
        misfire_grace_seconds: request.misfire_grace_seconds,
    };

    match ctx.store.update_schedule(request.schedule_id, update).await {
        Ok(true) => {
            // Trigger change invalidates the computed next run
            if let Ok(Some(schedule)) = ctx.store.get_schedule(request.schedule_id).await {
                if let Ok(Some(next)) = compute_next_run(&schedule, utc_now()) {
                    let _ = ctx
                        .store
                        .update_schedule(
                            request.schedule_id,
                            ScheduleUpdate {
                                next_run_at: Some(next),
                                ..Default::default()
                            },
                        )
                        .await;
                }
            }
            OperationResult::ok(true, timer.elapsed_ms())
        }
        Ok(false) => OperationResult::fail(
            ErrorCode::NotFound,
            format!("schedule not found: {}", request.schedule_id),
            timer.elapsed_ms(),
        ),
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Delete a schedule.
pub async fn delete_schedule(
    ctx: &OperationContext,
    request: ScheduleIdRequest,
) -> OperationResult<bool> {
    let timer = start_timer();

    match ctx.store.delete_schedule(request.schedule_id).await {
        Ok(true) => OperationResult::ok(true, timer.elapsed_ms()),
        Ok(false) => OperationResult::fail(
            ErrorCode::NotFound,
            format!("schedule not found: {}", request.schedule_id),
            timer.elapsed_ms(),
        ),
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

async fn set_enabled(
    ctx: &OperationContext,
    schedule_id: uuid::Uuid,
    enabled: bool,
    timer: crate::result::Timer,
) -> OperationResult<bool> {
    match ctx
        .store
        .update_schedule(
            schedule_id,
            ScheduleUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    {
        Ok(true) => OperationResult::ok(true, timer.elapsed_ms()),
        Ok(false) => OperationResult::fail(
            ErrorCode::NotFound,
            format!("schedule not found: {schedule_id}"),
            timer.elapsed_ms(),
        ),
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Pause a schedule.
pub async fn pause_schedule(
    ctx: &OperationContext,
    request: ScheduleIdRequest,
) -> OperationResult<bool> {
    set_enabled(ctx, request.schedule_id, false, start_timer()).await
}

/// Resume a paused schedule.
pub async fn resume_schedule(
    ctx: &OperationContext,
    request: ScheduleIdRequest,
) -> OperationResult<bool> {
    set_enabled(ctx, request.schedule_id, true, start_timer()).await
}

/// Trigger a schedule's target immediately, outside its cadence.
pub async fn trigger_schedule(
    ctx: &OperationContext,
    request: ScheduleIdRequest,
) -> OperationResult<ExecutionSummary> {
    let timer = start_timer();

    let schedule = match ctx.store.get_schedule(request.schedule_id).await {
        Ok(Some(schedule)) => schedule,
        Ok(None) => {
            return OperationResult::fail(
                ErrorCode::NotFound,
                format!("schedule not found: {}", request.schedule_id),
                timer.elapsed_ms(),
            )
        }
        Err(e) => return OperationResult::store_error(&e, timer.elapsed_ms()),
    };

    let workflow = format!("{}:{}", schedule.target_type, schedule.target_name);
    let new = NewExecution::new(workflow, schedule.params_template.clone())
        .with_lane("scheduled")
        .with_trigger(TriggerSource::Schedule);

    match ctx.store.create_execution(new).await {
        Ok(execution) => {
            OperationResult::ok(ExecutionSummary::from(&execution), timer.elapsed_ms())
        }
        Err(e) => OperationResult::store_error(&e, timer.elapsed_ms()),
    }
}

/// Tick audit rows for one schedule.
pub async fn list_schedule_runs(
    ctx: &OperationContext,
    request: ScheduleIdRequest,
) -> PagedResult<ScheduleRunSummary> {
    let timer = start_timer();

    match ctx
        .store
        .list_schedule_runs(request.schedule_id, Pagination::default())
        .await
    {
        Ok(runs) => {
            let total = runs.len() as u64;
            PagedResult::ok(
                runs.iter().map(ScheduleRunSummary::from).collect(),
                total,
                total as u32,
                0,
                timer.elapsed_ms(),
            )
        }
        Err(e) => PagedResult::store_error(&e, timer.elapsed_ms()),
    }
}
