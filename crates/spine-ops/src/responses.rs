//! Typed operation responses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spine_core::{Execution, ExecutionEvent};
use spine_storage::{
    DeadLetter, ManifestEntry, Schedule, ScheduleRun, WorkflowRunRecord, WorkflowStepRecord,
};
use uuid::Uuid;

/// Compact execution row for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub workflow: String,
    pub status: String,
    pub lane: String,
    pub trigger_source: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl From<&Execution> for ExecutionSummary {
    fn from(e: &Execution) -> Self {
        Self {
            id: e.id,
            workflow: e.workflow.clone(),
            status: e.status.to_string(),
            lane: e.lane.clone(),
            trigger_source: e.trigger_source.to_string(),
            created_at: e.created_at,
            completed_at: e.completed_at,
            retry_count: e.retry_count,
            error: e.error.clone(),
        }
    }
}

/// Full execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub summary: ExecutionSummary,
    pub params: Value,
    pub logical_key: Option<String>,
    pub idempotency_key: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub runtime: Option<String>,
    pub external_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

impl From<&Execution> for ExecutionDetail {
    fn from(e: &Execution) -> Self {
        Self {
            summary: ExecutionSummary::from(e),
            params: e.params.clone(),
            logical_key: e.logical_key.clone(),
            idempotency_key: e.idempotency_key.clone(),
            parent_execution_id: e.parent_execution_id,
            runtime: e.runtime.clone(),
            external_ref: e.external_ref.clone(),
            started_at: e.started_at,
            result: e.result.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: Uuid,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl From<&ExecutionEvent> for EventSummary {
    fn from(e: &ExecutionEvent) -> Self {
        Self {
            id: e.id,
            event_type: e.event_type.to_string(),
            timestamp: e.timestamp,
            data: e.data.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub domain: String,
    pub step_count: usize,
    pub description: String,
}

/// Outcome of a completed workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunOutcome {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: String,
    pub step_statuses: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunSummary {
    pub id: Uuid,
    pub workflow_name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&WorkflowRunRecord> for WorkflowRunSummary {
    fn from(r: &WorkflowRunRecord) -> Self {
        Self {
            id: r.id,
            workflow_name: r.workflow_name.clone(),
            status: r.status.to_string(),
            started_at: r.started_at,
            completed_at: r.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepSummary {
    pub step_name: String,
    pub step_type: String,
    pub status: String,
    pub attempt_count: u32,
    pub error: Option<String>,
}

impl From<&WorkflowStepRecord> for WorkflowStepSummary {
    fn from(s: &WorkflowStepRecord) -> Self {
        Self {
            step_name: s.step_name.clone(),
            step_type: s.step_type.clone(),
            status: s.status.to_string(),
            attempt_count: s.attempt_count,
            error: s.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSummary {
    pub id: Uuid,
    pub name: String,
    pub target: String,
    pub kind: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl From<&Schedule> for ScheduleSummary {
    fn from(s: &Schedule) -> Self {
        Self {
            id: s.id,
            name: s.name.clone(),
            target: format!("{}:{}", s.target_type, s.target_name),
            kind: s.kind.to_string(),
            enabled: s.enabled,
            last_run_at: s.last_run_at,
            next_run_at: s.next_run_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRunSummary {
    pub id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub status: String,
    pub reason: Option<String>,
    pub triggered_execution_id: Option<Uuid>,
}

impl From<&ScheduleRun> for ScheduleRunSummary {
    fn from(r: &ScheduleRun) -> Self {
        Self {
            id: r.id,
            scheduled_at: r.scheduled_at,
            status: format!("{:?}", r.status).to_lowercase(),
            reason: r.reason.clone(),
            triggered_execution_id: r.triggered_execution_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterSummary {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow: String,
    pub error: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub replayable: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl From<&DeadLetter> for DeadLetterSummary {
    fn from(d: &DeadLetter) -> Self {
        Self {
            id: d.id,
            execution_id: d.execution_id,
            workflow: d.workflow.clone(),
            error: d.error.clone(),
            retry_count: d.retry_count,
            max_retries: d.max_retries,
            replayable: d.is_replayable(),
            resolved_at: d.resolved_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntrySummary {
    pub domain: String,
    pub partition_key: String,
    pub stage: String,
    pub stage_rank: i32,
    pub row_count: Option<u64>,
    pub updated_at: DateTime<Utc>,
    pub superseded: bool,
}

impl From<&ManifestEntry> for ManifestEntrySummary {
    fn from(e: &ManifestEntry) -> Self {
        Self {
            domain: e.domain.clone(),
            partition_key: e.partition_key.clone(),
            stage: e.stage.clone(),
            stage_rank: e.stage_rank,
            row_count: e.row_count,
            updated_at: e.updated_at,
            superseded: e.superseded_at.is_some(),
        }
    }
}
