//! Workflow runner
//!
//! Executes an [`ExecutionPlan`] over a backing [`Runnable`]. The runner
//! owns the single current [`WorkflowContext`] reference and publishes a new
//! snapshot after each step; parallel steps hold the snapshot they were
//! dispatched with.
//!
//! Failure policy: under STOP the first failure skips everything that has
//! not started; under CONTINUE only the failed step's dependents are
//! skipped and independent subgraphs keep running.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use spine_core::{ids, utc_now};
use spine_storage::{
    RunStatus, StepStatus, WorkflowRunEvent, WorkflowRunRecord, WorkflowRunStore,
    WorkflowStepRecord,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::WorkflowContext;
use crate::model::{Condition, ExecutionMode, FailurePolicy, StepKind, Workflow};
use crate::planner::{ExecutionPlan, PlanError, PlannedStep, Planner};
use crate::step_result::{StepErrorCategory, StepResult};

/// One operation dispatch handed to a [`Runnable`].
#[derive(Debug, Clone)]
pub struct OperationRun {
    pub operation: String,
    pub params: Map<String, Value>,
    pub parent_run_id: Option<String>,
    pub correlation_id: Option<String>,
}

/// Backing executor for pipeline steps (job-engine bridge, in-process
/// dispatcher, test double).
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    async fn run_operation(&self, run: OperationRun) -> StepResult;
}

/// In-process step handler registered with the runner.
pub type LambdaHandler = Arc<
    dyn Fn(WorkflowContext, Map<String, Value>) -> BoxFuture<'static, StepResult> + Send + Sync,
>;

/// Final state of one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_name: String,
    pub status: StepStatus,
    pub result: Option<StepResult>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of a workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowRunResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub steps: Vec<StepOutcome>,
    pub context: WorkflowContext,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl WorkflowRunResult {
    pub fn step(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step_name == name)
    }
}

/// Executes planned workflows.
pub struct WorkflowRunner {
    runnable: Arc<dyn Runnable>,
    lambdas: RwLock<HashMap<String, LambdaHandler>>,
    run_store: Option<Arc<dyn WorkflowRunStore>>,
    planner: Planner,
}

impl WorkflowRunner {
    pub fn new(runnable: Arc<dyn Runnable>) -> Self {
        Self {
            runnable,
            lambdas: RwLock::new(HashMap::new()),
            run_store: None,
            planner: Planner::new(),
        }
    }

    /// Persist run/step/event rows through the given store.
    pub fn with_run_store(mut self, store: Arc<dyn WorkflowRunStore>) -> Self {
        self.run_store = Some(store);
        self
    }

    pub fn with_planner(mut self, planner: Planner) -> Self {
        self.planner = planner;
        self
    }

    /// Register an in-process handler for lambda steps.
    pub fn register_lambda<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(WorkflowContext, Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StepResult> + Send + 'static,
    {
        let handler: LambdaHandler = Arc::new(move |ctx, config| Box::pin(handler(ctx, config)));
        self.lambdas.write().insert(name.to_string(), handler);
    }

    /// Plan and execute a workflow.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        run_params: Map<String, Value>,
    ) -> Result<WorkflowRunResult, PlanError> {
        self.execute_with_cancel(workflow, run_params, CancellationToken::new())
            .await
    }

    /// Plan and execute with an external cancellation token. Cancellation is
    /// honoured between steps: not-yet-started steps are skipped and the run
    /// finishes as `cancelled`.
    pub async fn execute_with_cancel(
        &self,
        workflow: &Workflow,
        run_params: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<WorkflowRunResult, PlanError> {
        let plan = self.planner.resolve(workflow, &run_params)?;
        let ctx = WorkflowContext::create(&workflow.name, run_params, false);
        let started_at = utc_now();

        info!(
            workflow = %workflow.name,
            run_id = %ctx.run_id,
            steps = plan.steps.len(),
            mode = ?plan.policy.mode,
            "workflow run starting"
        );

        self.record_run_start(&ctx, workflow, started_at).await;

        let mut state = RunState::new(&plan, ctx, cancel);
        match plan.policy.mode {
            ExecutionMode::Sequential => self.run_sequential(&plan, &mut state).await,
            ExecutionMode::Parallel => self.run_parallel(&plan, &mut state).await,
        }

        let status = state.final_status(plan.policy.on_failure);
        let completed_at = utc_now();
        self.record_run_end(state.ctx.run_id, status, completed_at)
            .await;

        info!(
            workflow = %workflow.name,
            run_id = %state.ctx.run_id,
            status = %status,
            "workflow run finished"
        );

        let ordered = plan
            .steps
            .iter()
            .filter_map(|p| state.outcomes.remove(&p.step.name))
            .collect();

        Ok(WorkflowRunResult {
            run_id: state.ctx.run_id,
            workflow_name: workflow.name.clone(),
            status,
            steps: ordered,
            context: state.ctx,
            started_at,
            completed_at,
        })
    }

    // =========================================================================
    // Sequential execution
    // =========================================================================

    async fn run_sequential(&self, plan: &ExecutionPlan, state: &mut RunState) {
        for planned in &plan.steps {
            if let Some(reason) = state.skip_reason(planned, plan.policy.on_failure) {
                self.mark_skipped(state, planned, &reason).await;
                continue;
            }

            self.dispatch_one(planned, state).await;
        }
    }

    async fn dispatch_one(&self, planned: &PlannedStep, state: &mut RunState) {
        let step_started = utc_now();
        state
            .statuses
            .insert(planned.step.name.clone(), StepStatus::Running);
        self.record_event(state.ctx.run_id, Some(&planned.step.name), "step_started")
            .await;

        let (result, attempts) = run_step_with_retry(
            Arc::clone(&self.runnable),
            self.lambda_snapshot(),
            planned.clone(),
            state.ctx.clone(),
            state.cancel.clone(),
        )
        .await;

        state.apply_completion(planned, result, attempts, step_started);
        let outcome = &state.outcomes[&planned.step.name];
        self.record_step(state.ctx.run_id, planned, outcome).await;
        self.record_event(
            state.ctx.run_id,
            Some(&planned.step.name),
            if outcome.status == StepStatus::Completed {
                "step_completed"
            } else {
                "step_failed"
            },
        )
        .await;
    }

    // =========================================================================
    // Parallel execution
    // =========================================================================

    async fn run_parallel(&self, plan: &ExecutionPlan, state: &mut RunState) {
        let max_concurrency = plan.policy.max_concurrency.max(1);
        let mut in_flight: JoinSet<(String, StepResult, u32)> = JoinSet::new();
        let mut dispatch_times: HashMap<String, DateTime<Utc>> = HashMap::new();

        loop {
            // Launch every ready step, bounded by max_concurrency.
            let mut launched = false;
            for planned in &plan.steps {
                if state.is_settled(&planned.step.name)
                    || state.is_running(&planned.step.name)
                {
                    continue;
                }

                if let Some(reason) = state.skip_reason(planned, plan.policy.on_failure) {
                    self.mark_skipped(state, planned, &reason).await;
                    launched = true;
                    continue;
                }

                if !state.deps_completed(planned) || in_flight.len() >= max_concurrency {
                    continue;
                }

                state
                    .statuses
                    .insert(planned.step.name.clone(), StepStatus::Running);
                dispatch_times.insert(planned.step.name.clone(), utc_now());
                self.record_event(state.ctx.run_id, Some(&planned.step.name), "step_started")
                    .await;

                let runnable = Arc::clone(&self.runnable);
                let lambdas = self.lambda_snapshot();
                let planned = planned.clone();
                let ctx = state.ctx.clone();
                let cancel = state.cancel.clone();
                in_flight.spawn(async move {
                    let name = planned.step.name.clone();
                    let (result, attempts) =
                        run_step_with_retry(runnable, lambdas, planned, ctx, cancel).await;
                    (name, result, attempts)
                });
                launched = true;
            }

            if in_flight.is_empty() {
                if launched {
                    // Skips may have unblocked (or doomed) more steps.
                    continue;
                }
                break;
            }

            // Wait for any completion before dispatching more.
            match in_flight.join_next().await {
                Some(Ok((name, result, attempts))) => {
                    let Some(planned) = plan.steps.iter().find(|p| p.step.name == name) else {
                        continue;
                    };
                    let started = dispatch_times.remove(&name).unwrap_or_else(utc_now);
                    state.apply_completion(planned, result, attempts, started);
                    let outcome = &state.outcomes[&name];
                    self.record_step(state.ctx.run_id, planned, outcome).await;
                    self.record_event(
                        state.ctx.run_id,
                        Some(&name),
                        if outcome.status == StepStatus::Completed {
                            "step_completed"
                        } else {
                            "step_failed"
                        },
                    )
                    .await;
                }
                Some(Err(join_err)) => {
                    warn!(error = %join_err, "workflow step task panicked");
                }
                None => break,
            }
        }
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn lambda_snapshot(&self) -> Arc<HashMap<String, LambdaHandler>> {
        Arc::new(self.lambdas.read().clone())
    }

    async fn mark_skipped(&self, state: &mut RunState, planned: &PlannedStep, reason: &str) {
        debug!(step = %planned.step.name, reason, "step skipped");
        state.mark_skipped(&planned.step.name);
        let outcome = &state.outcomes[&planned.step.name];
        self.record_step(state.ctx.run_id, planned, outcome).await;
        self.record_event(state.ctx.run_id, Some(&planned.step.name), "step_skipped")
            .await;
    }

    async fn record_run_start(
        &self,
        ctx: &WorkflowContext,
        workflow: &Workflow,
        started_at: DateTime<Utc>,
    ) {
        let Some(ref store) = self.run_store else {
            return;
        };
        let record = WorkflowRunRecord {
            id: ctx.run_id,
            workflow_name: workflow.name.clone(),
            domain: workflow.domain.clone(),
            status: RunStatus::Running,
            trigger: "api".to_string(),
            started_at,
            completed_at: None,
        };
        if let Err(e) = store.create_workflow_run(record).await {
            warn!(error = %e, "failed to record workflow run start");
        }
    }

    async fn record_run_end(&self, run_id: Uuid, status: RunStatus, completed_at: DateTime<Utc>) {
        let Some(ref store) = self.run_store else {
            return;
        };
        if let Err(e) = store
            .update_workflow_run_status(run_id, status, Some(completed_at))
            .await
        {
            warn!(error = %e, "failed to record workflow run end");
        }
        let _ = store
            .record_workflow_event(WorkflowRunEvent {
                id: ids::new_event_id(),
                run_id,
                step_name: None,
                event_type: format!("run_{status}"),
                timestamp: completed_at,
                data: Value::Object(Default::default()),
            })
            .await;
    }

    async fn record_step(&self, run_id: Uuid, planned: &PlannedStep, outcome: &StepOutcome) {
        let Some(ref store) = self.run_store else {
            return;
        };
        let record = WorkflowStepRecord {
            id: ids::new_event_id(),
            run_id,
            step_name: planned.step.name.clone(),
            step_type: planned.step.kind.type_name().to_string(),
            sequence_order: planned.sequence_order,
            status: outcome.status,
            attempt_count: outcome.attempts,
            started_at: outcome.started_at,
            completed_at: outcome.completed_at,
            error: outcome.result.as_ref().and_then(|r| r.error.clone()),
            output: outcome
                .result
                .as_ref()
                .map(|r| Value::Object(r.output.clone())),
        };
        if let Err(e) = store.upsert_workflow_step(record).await {
            warn!(error = %e, "failed to record workflow step");
        }
    }

    async fn record_event(&self, run_id: Uuid, step_name: Option<&str>, event_type: &str) {
        let Some(ref store) = self.run_store else {
            return;
        };
        let event = WorkflowRunEvent {
            id: ids::new_event_id(),
            run_id,
            step_name: step_name.map(|s| s.to_string()),
            event_type: event_type.to_string(),
            timestamp: utc_now(),
            data: Value::Object(Default::default()),
        };
        if let Err(e) = store.record_workflow_event(event).await {
            warn!(error = %e, "failed to record workflow event");
        }
    }
}

/// Mutable run bookkeeping shared by both execution modes.
struct RunState {
    ctx: WorkflowContext,
    statuses: HashMap<String, StepStatus>,
    outcomes: HashMap<String, StepOutcome>,
    /// Choice branches that were not selected
    unselected: HashSet<String>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    timed_out: bool,
}

impl RunState {
    fn new(plan: &ExecutionPlan, ctx: WorkflowContext, cancel: CancellationToken) -> Self {
        let statuses = plan
            .steps
            .iter()
            .map(|p| (p.step.name.clone(), StepStatus::Pending))
            .collect();
        Self {
            ctx,
            statuses,
            outcomes: HashMap::new(),
            unselected: HashSet::new(),
            cancel,
            deadline: plan.policy.timeout.map(|t| Instant::now() + t),
            timed_out: false,
        }
    }

    fn is_settled(&self, name: &str) -> bool {
        matches!(
            self.statuses.get(name),
            Some(StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
        )
    }

    fn is_running(&self, name: &str) -> bool {
        matches!(self.statuses.get(name), Some(StepStatus::Running))
    }

    fn any_failed(&self) -> bool {
        self.statuses.values().any(|s| *s == StepStatus::Failed)
    }

    fn deps_completed(&self, planned: &PlannedStep) -> bool {
        planned
            .step
            .depends_on
            .iter()
            .all(|dep| self.statuses.get(dep.as_str()) == Some(&StepStatus::Completed))
    }

    /// Reason to skip this step without running it, if any.
    fn skip_reason(&mut self, planned: &PlannedStep, policy: FailurePolicy) -> Option<String> {
        if self.cancel.is_cancelled() {
            return Some("run cancelled".to_string());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.timed_out = true;
                return Some("run timeout exceeded".to_string());
            }
        }
        if self.unselected.contains(&planned.step.name) {
            return Some("branch not selected".to_string());
        }
        if policy == FailurePolicy::Stop && self.any_failed() {
            return Some("earlier step failed".to_string());
        }
        let blocked_by: Vec<&String> = planned
            .step
            .depends_on
            .iter()
            .filter(|dep| {
                matches!(
                    self.statuses.get(dep.as_str()),
                    Some(StepStatus::Failed | StepStatus::Skipped)
                )
            })
            .collect();
        if !blocked_by.is_empty() {
            return Some(format!("dependency failed or skipped: {blocked_by:?}"));
        }
        None
    }

    fn mark_skipped(&mut self, name: &str) {
        self.statuses.insert(name.to_string(), StepStatus::Skipped);
        self.outcomes.insert(
            name.to_string(),
            StepOutcome {
                step_name: name.to_string(),
                status: StepStatus::Skipped,
                result: None,
                attempts: 0,
                started_at: None,
                completed_at: None,
            },
        );
    }

    /// Fold a finished step back into the run: publish the next context
    /// snapshot, track branch selection, store the outcome.
    fn apply_completion(
        &mut self,
        planned: &PlannedStep,
        result: StepResult,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) {
        let name = &planned.step.name;
        let status = if result.success {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        self.statuses.insert(name.clone(), status);

        if result.success {
            self.ctx = self
                .ctx
                .with_output(name, Value::Object(result.output.clone()))
                .with_params(result.context_updates.clone());

            if let StepKind::Choice {
                ref then_step,
                ref else_step,
                ..
            } = planned.step.kind
            {
                let selected = result.next_step.as_deref();
                if selected != Some(then_step.as_str()) {
                    self.unselected.insert(then_step.clone());
                }
                if let Some(else_name) = else_step {
                    if selected != Some(else_name.as_str()) {
                        self.unselected.insert(else_name.clone());
                    }
                }
            }
        }

        self.outcomes.insert(
            name.clone(),
            StepOutcome {
                step_name: name.clone(),
                status,
                result: Some(result),
                attempts,
                started_at: Some(started_at),
                completed_at: Some(utc_now()),
            },
        );
    }

    /// Aggregate run status per the result rules.
    fn final_status(&self, policy: FailurePolicy) -> RunStatus {
        if self.cancel.is_cancelled() {
            return RunStatus::Cancelled;
        }

        let failed = self
            .statuses
            .values()
            .filter(|s| **s == StepStatus::Failed)
            .count();
        let completed = self
            .statuses
            .values()
            .filter(|s| **s == StepStatus::Completed)
            .count();

        if failed == 0 && !self.timed_out {
            RunStatus::Completed
        } else if failed > 0 && policy == FailurePolicy::Continue && completed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }
}

// =============================================================================
// Step execution
// =============================================================================

/// Execute one step with its retry policy. Returns the final result and the
/// number of attempts made.
async fn run_step_with_retry(
    runnable: Arc<dyn Runnable>,
    lambdas: Arc<HashMap<String, LambdaHandler>>,
    planned: PlannedStep,
    ctx: WorkflowContext,
    cancel: CancellationToken,
) -> (StepResult, u32) {
    let mut attempt = 1u32;
    loop {
        let result = execute_step(&runnable, &lambdas, &planned, &ctx).await;
        if result.success {
            return (result, attempt);
        }

        let Some(ref retry) = planned.step.retry else {
            return (result, attempt);
        };
        let retryable = result
            .error_category
            .map(StepErrorCategory::is_retryable)
            .unwrap_or(true);
        if !retryable || !retry.has_attempts_remaining(attempt) || cancel.is_cancelled() {
            return (result, attempt);
        }

        attempt += 1;
        let delay = retry.delay_for_attempt(attempt);
        debug!(
            step = %planned.step.name,
            attempt,
            delay_ms = delay.as_millis(),
            "retrying step"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return (result, attempt - 1),
        }
    }
}

async fn execute_step(
    runnable: &Arc<dyn Runnable>,
    lambdas: &HashMap<String, LambdaHandler>,
    planned: &PlannedStep,
    ctx: &WorkflowContext,
) -> StepResult {
    match &planned.step.kind {
        StepKind::Pipeline { operation, .. } => {
            // Context updates flow in through ctx.params; planned params
            // (defaults < run < step) take precedence on overlap.
            let mut params = ctx.params.clone();
            for (key, value) in &planned.params {
                params.insert(key.clone(), value.clone());
            }
            runnable
                .run_operation(OperationRun {
                    operation: operation.clone(),
                    params,
                    parent_run_id: Some(ctx.run_id.to_string()),
                    correlation_id: ctx.execution.batch_id.clone(),
                })
                .await
        }

        StepKind::Lambda { handler, config } => match lambdas.get(handler) {
            Some(lambda) => lambda(ctx.clone(), config.clone()).await,
            None => StepResult::failed(
                format!("no lambda handler registered: {handler}"),
                StepErrorCategory::Configuration,
            ),
        },

        StepKind::Choice {
            condition,
            then_step,
            else_step,
        } => {
            let matched = evaluate_condition(condition, ctx);
            let selected = if matched {
                Some(then_step.clone())
            } else {
                else_step.clone()
            };

            let mut output = Map::new();
            output.insert("condition".to_string(), Value::Bool(matched));
            if let Some(ref name) = selected {
                output.insert("selected".to_string(), Value::String(name.clone()));
            }

            let mut result = StepResult::ok_with(output);
            result.next_step = selected;
            result
        }

        StepKind::Wait {
            duration_seconds,
            until,
        } => {
            if let Some(seconds) = duration_seconds {
                tokio::time::sleep(std::time::Duration::from_secs(*seconds)).await;
            } else if let Some(until) = until {
                let now = utc_now();
                if *until > now {
                    if let Ok(wait) = (*until - now).to_std() {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
            StepResult::ok()
        }

        StepKind::Map {
            items_path,
            operation,
            max_concurrency,
        } => {
            let Some(Value::Array(items)) = ctx.params.get(items_path) else {
                return StepResult::failed(
                    format!("map step items path '{items_path}' is not an array parameter"),
                    StepErrorCategory::Configuration,
                );
            };

            let semaphore = Arc::new(tokio::sync::Semaphore::new(*max_concurrency));
            let mut tasks = JoinSet::new();
            for (index, item) in items.iter().enumerate() {
                let runnable = Arc::clone(runnable);
                let semaphore = Arc::clone(&semaphore);
                let operation = operation.clone();
                let item = item.clone();
                let parent_run_id = ctx.run_id.to_string();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let mut params = Map::new();
                    params.insert("item".to_string(), item);
                    params.insert("index".to_string(), Value::from(index));
                    let result = runnable
                        .run_operation(OperationRun {
                            operation,
                            params,
                            parent_run_id: Some(parent_run_id),
                            correlation_id: None,
                        })
                        .await;
                    (index, result)
                });
            }

            let mut results: Vec<(usize, StepResult)> = Vec::with_capacity(items.len());
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(pair) => results.push(pair),
                    Err(e) => {
                        return StepResult::failed(
                            format!("map iteration panicked: {e}"),
                            StepErrorCategory::Internal,
                        )
                    }
                }
            }
            results.sort_by_key(|(index, _)| *index);

            if let Some((index, failed)) = results.iter().find(|(_, r)| !r.success) {
                return StepResult::failed(
                    format!(
                        "map iteration {index} failed: {}",
                        failed.error.as_deref().unwrap_or("unknown error")
                    ),
                    failed.error_category.unwrap_or(StepErrorCategory::Internal),
                );
            }

            let mut output = Map::new();
            output.insert(
                "results".to_string(),
                Value::Array(
                    results
                        .into_iter()
                        .map(|(_, r)| Value::Object(r.output))
                        .collect(),
                ),
            );
            output.insert("count".to_string(), Value::from(items.len()));
            StepResult::ok_with(output)
        }
    }
}

fn evaluate_condition(condition: &Condition, ctx: &WorkflowContext) -> bool {
    match condition {
        Condition::ParamEquals { key, value } => ctx.params.get(key) == Some(value),
        Condition::ParamTruthy { key } => ctx.params.get(key).is_some_and(is_truthy),
        Condition::OutputEquals { step, key, value } => {
            ctx.get_output(step, Some(key)) == Some(value)
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionPolicy, Step};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Test runnable: operations named `fail.*` fail, everything else
    /// echoes its params.
    struct EchoRunnable {
        calls: AtomicU32,
    }

    impl EchoRunnable {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Runnable for EchoRunnable {
        async fn run_operation(&self, run: OperationRun) -> StepResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if run.operation.starts_with("fail.") {
                StepResult::failed("operation failed", StepErrorCategory::Internal)
            } else {
                let mut output = Map::new();
                output.insert("operation".to_string(), json!(run.operation));
                output.insert("params".to_string(), Value::Object(run.params));
                StepResult::ok_with(output)
            }
        }
    }

    fn map(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_sequential_run_completes() {
        let runner = WorkflowRunner::new(EchoRunnable::new());
        let wf = Workflow::new(
            "linear",
            vec![
                Step::pipeline("a", "op.a"),
                Step::pipeline("b", "op.b").with_depends_on(["a"]),
            ],
        )
        .unwrap();

        let result = runner.execute(&wf, Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(result.step("b").unwrap().status, StepStatus::Completed);
        assert!(result.context.has_output("a"));
        assert!(result.context.has_output("b"));
    }

    #[tokio::test]
    async fn test_stop_policy_skips_rest() {
        let runner = WorkflowRunner::new(EchoRunnable::new());
        let wf = Workflow::new(
            "stops",
            vec![
                Step::pipeline("a", "fail.a"),
                Step::pipeline("b", "op.b"),
                Step::pipeline("c", "op.c"),
            ],
        )
        .unwrap()
        .with_policy(ExecutionPolicy::sequential(FailurePolicy::Stop));

        let result = runner.execute(&wf, Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.step("a").unwrap().status, StepStatus::Failed);
        assert_eq!(result.step("b").unwrap().status, StepStatus::Skipped);
        assert_eq!(result.step("c").unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_continue_policy_partial() {
        let runner = WorkflowRunner::new(EchoRunnable::new());
        let wf = Workflow::new(
            "partial",
            vec![
                Step::pipeline("a", "op.a"),
                Step::pipeline("b", "fail.b"),
                Step::pipeline("c", "op.c"),
            ],
        )
        .unwrap()
        .with_policy(ExecutionPolicy::parallel(3, FailurePolicy::Continue));

        let result = runner.execute(&wf, Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(result.step("a").unwrap().status, StepStatus::Completed);
        assert_eq!(result.step("b").unwrap().status, StepStatus::Failed);
        assert_eq!(result.step("c").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_continue_policy_skips_only_dependents() {
        let runner = WorkflowRunner::new(EchoRunnable::new());
        let wf = Workflow::new(
            "subgraphs",
            vec![
                Step::pipeline("a", "fail.a"),
                Step::pipeline("b", "op.b").with_depends_on(["a"]),
                Step::pipeline("c", "op.c").with_depends_on(["b"]),
                Step::pipeline("x", "op.x"),
            ],
        )
        .unwrap()
        .with_policy(ExecutionPolicy::sequential(FailurePolicy::Continue));

        let result = runner.execute(&wf, Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(result.step("b").unwrap().status, StepStatus::Skipped);
        // Transitively skipped through b
        assert_eq!(result.step("c").unwrap().status, StepStatus::Skipped);
        // Independent subgraph still ran
        assert_eq!(result.step("x").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_all_failed_is_failed() {
        let runner = WorkflowRunner::new(EchoRunnable::new());
        let wf = Workflow::new(
            "allfail",
            vec![
                Step::pipeline("a", "fail.a"),
                Step::pipeline("b", "fail.b"),
            ],
        )
        .unwrap()
        .with_policy(ExecutionPolicy::sequential(FailurePolicy::Continue));

        let result = runner.execute(&wf, Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_lambda_step_and_context_updates() {
        let runner = WorkflowRunner::new(EchoRunnable::new());
        runner.register_lambda("annotate", |_ctx, _config| async move {
            StepResult::ok().with_context_updates(
                [("annotated".to_string(), json!(true))].into_iter().collect(),
            )
        });
        runner.register_lambda("check", |ctx: WorkflowContext, _config| async move {
            if ctx.params.get("annotated") == Some(&json!(true)) {
                StepResult::ok()
            } else {
                StepResult::failed("annotation missing", StepErrorCategory::Internal)
            }
        });

        let wf = Workflow::new(
            "lambdas",
            vec![
                Step::lambda("annotate", "annotate"),
                Step::lambda("check", "check").with_depends_on(["annotate"]),
            ],
        )
        .unwrap();

        let result = runner.execute(&wf, Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_lambda_is_configuration_error() {
        let runner = WorkflowRunner::new(EchoRunnable::new());
        let wf = Workflow::new("wf", vec![Step::lambda("a", "ghost")]).unwrap();

        let result = runner.execute(&wf, Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        let outcome = result.step("a").unwrap();
        assert_eq!(
            outcome.result.as_ref().unwrap().error_category,
            Some(StepErrorCategory::Configuration)
        );
    }

    #[tokio::test]
    async fn test_choice_skips_unselected_branch() {
        let runner = WorkflowRunner::new(EchoRunnable::new());
        let wf = Workflow::new(
            "branching",
            vec![
                Step::choice(
                    "route",
                    Condition::ParamEquals {
                        key: "mode".to_string(),
                        value: json!("fast"),
                    },
                    "fast_path",
                    Some("slow_path".to_string()),
                ),
                Step::pipeline("fast_path", "op.fast").with_depends_on(["route"]),
                Step::pipeline("slow_path", "op.slow").with_depends_on(["route"]),
            ],
        )
        .unwrap();

        let result = runner
            .execute(&wf, map(&[("mode", json!("fast"))]))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.step("fast_path").unwrap().status, StepStatus::Completed);
        assert_eq!(result.step("slow_path").unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_map_step_fans_out() {
        let runnable = EchoRunnable::new();
        let runner = WorkflowRunner::new(Arc::clone(&runnable) as Arc<dyn Runnable>);
        let wf = Workflow::new(
            "fanout",
            vec![Step::map("per_week", "weeks", "op.process", 2)],
        )
        .unwrap();

        let result = runner
            .execute(&wf, map(&[("weeks", json!(["w1", "w2", "w3"]))]))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(runnable.calls.load(Ordering::SeqCst), 3);

        let outcome = result.step("per_week").unwrap();
        let output = &outcome.result.as_ref().unwrap().output;
        assert_eq!(output.get("count"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_retry_policy_retries_then_succeeds() {
        struct FlakyRunnable {
            calls: AtomicU32,
        }

        #[async_trait]
        impl Runnable for FlakyRunnable {
            async fn run_operation(&self, _run: OperationRun) -> StepResult {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    StepResult::failed("transient blip", StepErrorCategory::Transient)
                } else {
                    StepResult::ok()
                }
            }
        }

        let runnable = Arc::new(FlakyRunnable {
            calls: AtomicU32::new(0),
        });
        let runner = WorkflowRunner::new(Arc::clone(&runnable) as Arc<dyn Runnable>);
        let wf = Workflow::new(
            "flaky",
            vec![Step::pipeline("a", "op.flaky").with_retry(
                crate::retry::StepRetryPolicy::new(3)
                    .with_initial_delay(std::time::Duration::from_millis(1))
                    .with_jitter(0.0),
            )],
        )
        .unwrap();

        let result = runner.execute(&wf, Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.step("a").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_category_not_retried() {
        struct BadDataRunnable {
            calls: AtomicU32,
        }

        #[async_trait]
        impl Runnable for BadDataRunnable {
            async fn run_operation(&self, _run: OperationRun) -> StepResult {
                self.calls.fetch_add(1, Ordering::SeqCst);
                StepResult::failed("schema drift", StepErrorCategory::DataQuality)
            }
        }

        let runnable = Arc::new(BadDataRunnable {
            calls: AtomicU32::new(0),
        });
        let runner = WorkflowRunner::new(Arc::clone(&runnable) as Arc<dyn Runnable>);
        let wf = Workflow::new(
            "baddata",
            vec![Step::pipeline("a", "op.ingest")
                .with_retry(crate::retry::StepRetryPolicy::new(5))],
        )
        .unwrap();

        let result = runner.execute(&wf, Map::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(runnable.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_skips_remaining() {
        let runner = WorkflowRunner::new(EchoRunnable::new());
        let wf = Workflow::new(
            "cancelme",
            vec![
                Step::pipeline("a", "op.a"),
                Step::pipeline("b", "op.b").with_depends_on(["a"]),
            ],
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = runner
            .execute_with_cancel(&wf, Map::new(), cancel)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert_eq!(result.step("a").unwrap().status, StepStatus::Skipped);
        assert_eq!(result.step("b").unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_run_store_records() {
        let store = Arc::new(spine_storage::MemoryStore::new());
        let runner = WorkflowRunner::new(EchoRunnable::new())
            .with_run_store(Arc::clone(&store) as Arc<dyn WorkflowRunStore>);
        let wf = Workflow::new("tracked", vec![Step::pipeline("a", "op.a")]).unwrap();

        let result = runner.execute(&wf, Map::new()).await.unwrap();

        let run = store.get_workflow_run(result.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let steps = store.list_workflow_steps(result.run_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Completed);
        let events = store.list_workflow_events(result.run_id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "step_started"));
        assert!(events.iter().any(|e| e.event_type == "step_completed"));
        assert!(events.iter().any(|e| e.event_type == "run_completed"));
    }
}
