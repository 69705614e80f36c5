//! Dead-letter queue contract
//!
//! Captures exhausted failures for intervention or replay. Replay accounting
//! is explicit: each attempt increments `retry_count`, and once the counter
//! reaches `max_retries` the entry is no longer replayable. Resolution is a
//! one-way transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{Pagination, StoreError};

/// A failed execution awaiting intervention or replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow: String,

    /// Parameter snapshot taken at failure time
    pub params: Value,

    pub error: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

impl DeadLetter {
    /// Replayable iff retries remain and the entry is unresolved.
    pub fn is_replayable(&self) -> bool {
        self.retry_count < self.max_retries && self.resolved_at.is_none()
    }
}

/// Aggregate DLQ counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqStats {
    pub total: u64,
    pub unresolved: u64,
    pub exhausted: u64,
    pub replayable: u64,
    pub by_workflow: Vec<(String, u64)>,
}

/// Store for dead letters.
#[async_trait]
pub trait DeadLetterStore: Send + Sync + 'static {
    /// Capture a failed execution.
    async fn add_dead_letter(
        &self,
        execution_id: Uuid,
        workflow: &str,
        params: Value,
        error: &str,
        max_retries: u32,
    ) -> Result<DeadLetter, StoreError>;

    /// Fetch an entry by id.
    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError>;

    /// Unresolved entries, newest first.
    async fn list_unresolved(
        &self,
        workflow: Option<&str>,
        page: Pagination,
    ) -> Result<Vec<DeadLetter>, StoreError>;

    /// All entries, newest first.
    async fn list_all_dead_letters(
        &self,
        workflow: Option<&str>,
        page: Pagination,
    ) -> Result<Vec<DeadLetter>, StoreError>;

    /// Record a replay attempt: increments `retry_count` and stamps
    /// `last_retry_at`.
    async fn mark_retry_attempted(&self, id: Uuid) -> Result<DeadLetter, StoreError>;

    /// Resolve an entry. One-way; returns false when already resolved.
    async fn resolve_dead_letter(
        &self,
        id: Uuid,
        resolved_by: &str,
        note: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Whether the entry can still be replayed.
    ///
    /// False once `retry_count >= max_retries`, regardless of resolution.
    async fn can_retry(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Count of unresolved entries.
    async fn count_unresolved(&self) -> Result<u64, StoreError>;

    /// Aggregate statistics.
    async fn dlq_stats(&self) -> Result<DlqStats, StoreError>;
}
