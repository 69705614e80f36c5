//! Execution lifecycle model
//!
//! An execution is one submitted unit of work. Its status moves monotonically
//! through `pending → (queued) → running → terminal`; every transition is
//! mirrored by an append-only lifecycle event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ids;

/// Execution status lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, waiting to be claimed
    Pending,

    /// Handed to a backend queue, not yet running
    Queued,

    /// Claimed by a worker and executing
    Running,

    /// Finished successfully
    Completed,

    /// Finished with an error
    Failed,

    /// Cancelled before or during execution
    Cancelled,

    /// Exceeded its timeout
    TimedOut,
}

impl ExecutionStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// The lattice is strictly monotone: `pending < queued < running <
    /// terminal`. Terminal states accept no further transitions.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Queued | Self::Running | Self::Cancelled | Self::Failed
            ),
            Self::Queued => matches!(next, Self::Running | Self::Cancelled | Self::Failed),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// What caused an execution to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[default]
    Api,
    Cli,
    Schedule,
    Retry,
    Workflow,
    Internal,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Api => "api",
            Self::Cli => "cli",
            Self::Schedule => "schedule",
            Self::Retry => "retry",
            Self::Workflow => "workflow",
            Self::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(Self::Api),
            "cli" => Ok(Self::Cli),
            "schedule" => Ok(Self::Schedule),
            "retry" => Ok(Self::Retry),
            "workflow" => Ok(Self::Workflow),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown trigger source: {other}")),
        }
    }
}

/// Lifecycle event types.
///
/// The well-known variants cover the execution state machine; `Custom`
/// carries free-form user events emitted by handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Queued,
    Started,
    Progress,
    Completed,
    Failed,
    Retried,
    Cancelled,
    #[serde(untagged)]
    Custom(String),
}

impl EventType {
    /// Whether this event marks a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retried => "retried",
            Self::Cancelled => "cancelled",
            Self::Custom(name) => name,
        }
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        match s {
            "created" => Self::Created,
            "queued" => Self::Queued,
            "started" => Self::Started,
            "progress" => Self::Progress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "retried" => Self::Retried,
            "cancelled" => Self::Cancelled,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row in the execution ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,

    /// Operation or workflow identifier (`kind:name`)
    pub workflow: String,

    /// Structured parameter payload
    pub params: Value,

    /// Lane classification for routing and filtering
    pub lane: String,

    pub trigger_source: TriggerSource,

    /// Caller-supplied key; an active execution with the same key blocks
    /// duplicate submission
    pub logical_key: Option<String>,

    pub status: ExecutionStatus,

    /// Set on retry chains: the execution this one replays
    pub parent_execution_id: Option<Uuid>,

    /// Runtime adapter name, once dispatched
    pub runtime: Option<String>,

    /// Opaque backend reference returned by the adapter
    pub external_ref: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Terminal result payload (success only)
    pub result: Option<Value>,

    /// Terminal error message (failure only)
    pub error: Option<String>,

    pub retry_count: u32,

    /// Replay-safety key; lookups by key return the original execution
    pub idempotency_key: Option<String>,
}

/// Parameters for creating a new execution row.
#[derive(Debug, Clone, Default)]
pub struct NewExecution {
    pub workflow: String,
    pub params: Value,
    pub lane: Option<String>,
    pub trigger_source: TriggerSource,
    pub logical_key: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
}

impl NewExecution {
    pub fn new(workflow: impl Into<String>, params: Value) -> Self {
        Self {
            workflow: workflow.into(),
            params,
            ..Default::default()
        }
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSource) -> Self {
        self.trigger_source = trigger;
        self
    }

    pub fn with_logical_key(mut self, key: impl Into<String>) -> Self {
        self.logical_key = Some(key.into());
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_execution_id = Some(parent);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Materialize a pending execution row.
    pub fn into_execution(self) -> Execution {
        Execution {
            id: ids::new_execution_id(),
            workflow: self.workflow,
            params: self.params,
            lane: self.lane.unwrap_or_else(|| "default".to_string()),
            trigger_source: self.trigger_source,
            logical_key: self.logical_key,
            status: ExecutionStatus::Pending,
            parent_execution_id: self.parent_execution_id,
            runtime: None,
            external_ref: None,
            created_at: ids::utc_now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            idempotency_key: self.idempotency_key,
        }
    }
}

/// Append-only lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl ExecutionEvent {
    pub fn new(execution_id: Uuid, event_type: EventType, data: Value) -> Self {
        Self {
            id: ids::new_event_id(),
            execution_id,
            event_type,
            timestamp: ids::utc_now(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_monotonicity() {
        use ExecutionStatus::*;

        assert!(Pending.can_transition_to(Queued));
        assert!(Pending.can_transition_to(Running));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(TimedOut));

        // No regressions
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Pending));

        // Terminal states are final
        for terminal in [Completed, Failed, Cancelled, TimedOut] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Running));
            assert!(!terminal.can_transition_to(Pending));
        }
    }

    #[test]
    fn test_cancel_only_before_running() {
        assert!(ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Cancelled));
        assert!(ExecutionStatus::Queued.can_transition_to(ExecutionStatus::Cancelled));
        // Running → cancelled goes through the cooperative path, still legal
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Cancelled));
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            "pending",
            "queued",
            "running",
            "completed",
            "failed",
            "cancelled",
            "timed_out",
        ] {
            let status: ExecutionStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("bogus".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_event_type_custom() {
        let custom = EventType::from("checkpoint");
        assert_eq!(custom, EventType::Custom("checkpoint".to_string()));
        assert!(!custom.is_terminal());
        assert!(EventType::Failed.is_terminal());
    }

    #[test]
    fn test_new_execution_defaults() {
        let exec = NewExecution::new("task:echo", json!({"msg": "hi"}))
            .with_idempotency_key("k1")
            .into_execution();

        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.lane, "default");
        assert_eq!(exec.trigger_source, TriggerSource::Api);
        assert_eq!(exec.retry_count, 0);
        assert_eq!(exec.idempotency_key.as_deref(), Some("k1"));
        assert!(exec.started_at.is_none());
    }
}
