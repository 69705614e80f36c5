//! Execution ledger contract
//!
//! The ledger owns executions and their event histories. Writes are atomic
//! with their lifecycle events: `create_execution` inserts the row together
//! with its `created` event, and `update_status` stamps the derived
//! timestamp and appends the matching event in the same transaction.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use spine_core::{
    EventType, Execution, ExecutionEvent, ExecutionStatus, NewExecution, TriggerSource,
};
use uuid::Uuid;

use crate::store::{Pagination, StoreError};

/// Filters for listing executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub lane: Option<String>,
    pub trigger_source: Option<TriggerSource>,
    pub parent_execution_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ExecutionFilter {
    pub fn matches(&self, exec: &Execution) -> bool {
        if let Some(ref wf) = self.workflow {
            if &exec.workflow != wf {
                return false;
            }
        }
        if let Some(status) = self.status {
            if exec.status != status {
                return false;
            }
        }
        if let Some(ref lane) = self.lane {
            if &exec.lane != lane {
                return false;
            }
        }
        if let Some(trigger) = self.trigger_source {
            if exec.trigger_source != trigger {
                return false;
            }
        }
        if let Some(parent) = self.parent_execution_id {
            if exec.parent_execution_id != Some(parent) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if exec.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if exec.created_at >= before {
                return false;
            }
        }
        true
    }
}

/// Durable, idempotent store of executions and their event histories.
#[async_trait]
pub trait ExecutionLedger: Send + Sync + 'static {
    /// Create a new execution together with its `created` event.
    ///
    /// Idempotent on `idempotency_key`: if a row with the same non-null key
    /// exists, the existing execution is returned unchanged and no event is
    /// written.
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, StoreError>;

    /// Fetch an execution by id.
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// Fetch an execution by idempotency key.
    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Execution>, StoreError>;

    /// Find an active (pending/queued/running) execution for a logical key.
    async fn find_active_by_logical_key(&self, key: &str) -> Result<Option<Uuid>, StoreError>;

    /// Transition an execution's status.
    ///
    /// Stamps `started_at` on entry to `running` and `completed_at` on entry
    /// to any terminal state; appends the corresponding lifecycle event
    /// atomically. Illegal transitions are rejected with
    /// [`StoreError::IllegalTransition`]. `result` is persisted only on
    /// success, `error` only on failure.
    async fn update_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Execution, StoreError>;

    /// Cancel a pending or queued execution (compare-and-set).
    ///
    /// Returns true when the row transitioned to `cancelled`; false when it
    /// was already running or terminal. A `cancelled` event is recorded on
    /// success.
    async fn try_cancel(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Record the runtime adapter and backend reference for an execution.
    async fn set_runtime(
        &self,
        id: Uuid,
        runtime: &str,
        external_ref: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Increment the retry counter, returning the new count.
    async fn increment_retry(&self, id: Uuid) -> Result<u32, StoreError>;

    /// Append a lifecycle or user event.
    async fn record_event(
        &self,
        execution_id: Uuid,
        event_type: EventType,
        data: Value,
    ) -> Result<ExecutionEvent, StoreError>;

    /// All events for an execution, in timestamp then insertion order.
    async fn get_events(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError>;

    /// List executions in descending `created_at`, tie-broken by id.
    ///
    /// Returns the page of rows and the total count matching the filter.
    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        page: Pagination,
    ) -> Result<(Vec<Execution>, u64), StoreError>;

    /// Atomically claim up to `max` pending executions for a worker.
    ///
    /// Claimed rows transition to `running` with `started_at` stamped and the
    /// claiming worker recorded. Concurrent claimers receive disjoint sets.
    async fn claim_pending(&self, worker_id: &str, max: usize)
        -> Result<Vec<Execution>, StoreError>;

    /// Return stale running executions (claimed longer ago than `threshold`
    /// with no terminal state) to `pending`. Returns the reclaimed ids.
    async fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<Uuid>, StoreError>;
}
