//! Workflow run storage contract
//!
//! Run/step/event rows recorded by the workflow runner. A run is `partial`
//! iff the failure policy was *continue*, at least one step failed, and at
//! least one step completed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{Pagination, StoreError};

/// Aggregate status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Continue-policy run with both failures and completions
    Partial,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Partial => "partial",
        };
        write!(f, "{name}")
    }
}

/// Status of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{name}")
    }
}

/// One workflow run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunRecord {
    pub id: Uuid,
    pub workflow_name: String,
    pub domain: String,
    pub status: RunStatus,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One step row within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_name: String,
    pub step_type: String,
    pub sequence_order: u32,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub output: Option<Value>,
}

/// Immutable run- or step-level event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_name: Option<String>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Store for workflow run state.
#[async_trait]
pub trait WorkflowRunStore: Send + Sync + 'static {
    async fn create_workflow_run(&self, run: WorkflowRunRecord) -> Result<(), StoreError>;

    async fn update_workflow_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn get_workflow_run(&self, run_id: Uuid)
        -> Result<Option<WorkflowRunRecord>, StoreError>;

    async fn list_workflow_runs(
        &self,
        workflow_name: Option<&str>,
        page: Pagination,
    ) -> Result<Vec<WorkflowRunRecord>, StoreError>;

    /// Insert or replace the row for (run, step).
    async fn upsert_workflow_step(&self, step: WorkflowStepRecord) -> Result<(), StoreError>;

    /// Steps for a run in sequence order.
    async fn list_workflow_steps(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<WorkflowStepRecord>, StoreError>;

    /// Append an immutable run event.
    async fn record_workflow_event(&self, event: WorkflowRunEvent) -> Result<(), StoreError>;

    /// Events for a run in timestamp order.
    async fn list_workflow_events(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<WorkflowRunEvent>, StoreError>;
}
