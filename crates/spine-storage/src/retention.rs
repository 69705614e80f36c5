//! Time-based retention purges
//!
//! `purge_all` walks each owned table, deletes rows past its cutoff, and
//! collects the per-table outcomes. A failing table is recorded and skipped;
//! it never aborts the remaining tables. Running the same purge twice with
//! the same cutoffs deletes nothing on the second pass.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use spine_core::utc_now;
use tracing::{info, warn};

use crate::store::StoreError;

/// Per-table retention windows in days. `None` disables the purge for that
/// table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub executions_days: Option<u32>,
    pub dead_letters_days: Option<u32>,
    pub schedule_runs_days: Option<u32>,
    pub workflow_runs_days: Option<u32>,
    pub manifest_days: Option<u32>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            executions_days: Some(90),
            dead_letters_days: Some(30),
            schedule_runs_days: Some(30),
            workflow_runs_days: Some(90),
            manifest_days: Some(180),
        }
    }
}

/// Compute the cutoff timestamp for a retention window.
pub fn compute_cutoff(retention_days: u32) -> DateTime<Utc> {
    utc_now() - ChronoDuration::days(i64::from(retention_days))
}

/// Result of purging one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeOutcome {
    pub table: String,
    pub deleted: u64,
    pub cutoff: DateTime<Utc>,
}

/// Aggregate report from `purge_all`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetentionReport {
    pub outcomes: Vec<PurgeOutcome>,
    pub errors: Vec<String>,
}

impl RetentionReport {
    pub fn total_deleted(&self) -> u64 {
        self.outcomes.iter().map(|o| o.deleted).sum()
    }

    /// Successful iff no per-table errors were recorded.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Purge operations implemented by each backend.
///
/// Every purge deletes rows whose designated timestamp column is strictly
/// before the cutoff, with the extra predicates noted per method.
#[async_trait]
pub trait RetentionStore: Send + Sync + 'static {
    /// Terminal executions created before the cutoff; event rows cascade.
    async fn purge_executions(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Resolved dead letters resolved before the cutoff.
    async fn purge_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Schedule run audit rows scheduled before the cutoff.
    async fn purge_schedule_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Terminal workflow runs completed before the cutoff; steps and events
    /// cascade.
    async fn purge_workflow_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Superseded manifest rows updated before the cutoff.
    async fn purge_manifest(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Run every configured purge, collecting outcomes and errors.
pub async fn purge_all(store: &dyn RetentionStore, config: &RetentionConfig) -> RetentionReport {
    let mut report = RetentionReport::default();

    let plan: [(&str, Option<u32>); 5] = [
        ("executions", config.executions_days),
        ("dead_letters", config.dead_letters_days),
        ("schedule_runs", config.schedule_runs_days),
        ("workflow_runs", config.workflow_runs_days),
        ("manifest", config.manifest_days),
    ];

    for (table, days) in plan {
        let Some(days) = days else { continue };
        let cutoff = compute_cutoff(days);

        let result = match table {
            "executions" => store.purge_executions(cutoff).await,
            "dead_letters" => store.purge_dead_letters(cutoff).await,
            "schedule_runs" => store.purge_schedule_runs(cutoff).await,
            "workflow_runs" => store.purge_workflow_runs(cutoff).await,
            "manifest" => store.purge_manifest(cutoff).await,
            _ => unreachable!(),
        };

        match result {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(table, deleted, %cutoff, "retention purge");
                }
                report.outcomes.push(PurgeOutcome {
                    table: table.to_string(),
                    deleted,
                    cutoff,
                });
            }
            Err(e) => {
                warn!(table, error = %e, "retention purge failed");
                report.errors.push(format!("{table}: {e}"));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_cutoff_is_in_the_past() {
        let cutoff = compute_cutoff(30);
        assert!(cutoff < utc_now());
    }

    #[test]
    fn test_report_success() {
        let mut report = RetentionReport::default();
        report.outcomes.push(PurgeOutcome {
            table: "executions".to_string(),
            deleted: 3,
            cutoff: utc_now(),
        });
        assert!(report.is_success());
        assert_eq!(report.total_deleted(), 3);

        report.errors.push("dead_letters: boom".to_string());
        assert!(!report.is_success());
    }
}
