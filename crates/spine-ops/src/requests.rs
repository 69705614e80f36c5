//! Typed operation requests

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn default_limit() -> u32 {
    100
}

/// Filters for listing executions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListExecutionsRequest {
    pub workflow: Option<String>,
    pub status: Option<String>,
    pub lane: Option<String>,
    pub trigger_source: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetExecutionRequest {
    pub execution_id: Uuid,
}

/// Submit a new execution into the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitExecutionRequest {
    /// `kind:name` operation identifier (bare names default to `task`)
    pub operation: String,
    #[serde(default)]
    pub params: Value,
    pub lane: Option<String>,
    pub logical_key: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelExecutionRequest {
    pub execution_id: Uuid,
}

/// Replay a dead letter as a fresh child execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryExecutionRequest {
    pub dead_letter_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetExecutionEventsRequest {
    pub execution_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetWorkflowRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunWorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListWorkflowRunsRequest {
    pub workflow: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetWorkflowStepsRequest {
    pub run_id: Uuid,
}

/// Create a schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    /// `task` or `workflow`
    pub target_type: String,
    pub target_name: String,
    /// `cron` or `interval`
    pub kind: String,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<u64>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub params_template: Value,
    #[serde(default = "default_grace")]
    pub misfire_grace_seconds: u64,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_grace() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateScheduleRequest {
    pub schedule_id: Uuid,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<u64>,
    pub params_template: Option<Value>,
    pub enabled: Option<bool>,
    pub misfire_grace_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleIdRequest {
    pub schedule_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListSchedulesRequest {
    #[serde(default)]
    pub enabled_only: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListDeadLettersRequest {
    pub workflow: Option<String>,
    #[serde(default)]
    pub include_resolved: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveDeadLetterRequest {
    pub dead_letter_id: Uuid,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListManifestRequest {
    pub domain: String,
    pub partition_key: Option<String>,
}
