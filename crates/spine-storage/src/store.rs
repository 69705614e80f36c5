//! Shared storage types and the combined store contract

use serde::{Deserialize, Serialize};
use spine_core::ExecutionStatus;

use crate::dlq::DeadLetterStore;
use crate::ledger::ExecutionLedger;
use crate::locks::LockStore;
use crate::manifest::ManifestStore;
use crate::retention::RetentionStore;
use crate::schedules::ScheduleStore;
use crate::workflow_runs::WorkflowRunStore;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Row not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Status transition rejected by the state machine
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// Unique constraint or compare-and-set conflict
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error (retryable)
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether a retry of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

impl Pagination {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self { offset, limit }
    }
}

/// The full storage contract.
///
/// Backends implement every per-concern trait; this marker lets consumers
/// hold one `Arc<dyn Store>` instead of seven trait objects.
pub trait Store:
    ExecutionLedger
    + LockStore
    + DeadLetterStore
    + ManifestStore
    + ScheduleStore
    + WorkflowRunStore
    + RetentionStore
{
}

impl<T> Store for T where
    T: ExecutionLedger
        + LockStore
        + DeadLetterStore
        + ManifestStore
        + ScheduleStore
        + WorkflowRunStore
        + RetentionStore
{
}
