//! Work manifest contract
//!
//! Tracks each partition's progress through an ordered stage list, enabling
//! idempotent restarts: callers check `is_at_least(partition, stage)` before
//! doing expensive work and `advance_to` once it completes. Advancement is
//! monotonic; forcing reprocessing goes through `reset_to`, which supersedes
//! later-stage rows instead of deleting them so the audit history survives.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::store::StoreError;

/// One stage-progression row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub domain: String,

    /// Deterministic serialization of the partition payload
    pub partition_key: String,

    pub stage: String,
    pub stage_rank: i32,
    pub row_count: Option<u64>,
    pub metrics: Option<Value>,
    pub updated_at: DateTime<Utc>,

    /// Set when a later `reset_to` invalidated this row
    pub superseded_at: Option<DateTime<Utc>>,
}

/// Parameters for writing a manifest row.
#[derive(Debug, Clone)]
pub struct NewManifestEntry {
    pub domain: String,
    pub partition_key: String,
    pub stage: String,
    pub stage_rank: i32,
    pub row_count: Option<u64>,
    pub metrics: Option<Value>,
}

/// Raw storage operations behind [`WorkManifest`].
#[async_trait]
pub trait ManifestStore: Send + Sync + 'static {
    /// Insert or refresh the row for (domain, partition, stage). Clears any
    /// superseded flag on the row.
    async fn upsert_manifest_entry(
        &self,
        entry: NewManifestEntry,
    ) -> Result<ManifestEntry, StoreError>;

    /// Highest non-superseded rank for a partition, if any.
    async fn current_manifest_rank(
        &self,
        domain: &str,
        partition_key: &str,
    ) -> Result<Option<i32>, StoreError>;

    /// Mark all rows above `rank` superseded. Returns the number affected.
    async fn supersede_manifest_above(
        &self,
        domain: &str,
        partition_key: &str,
        rank: i32,
    ) -> Result<u64, StoreError>;

    /// List entries for a domain (optionally one partition), newest first.
    async fn list_manifest_entries(
        &self,
        domain: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, StoreError>;
}

/// Ordered stage list with rank lookup.
#[derive(Debug, Clone)]
pub struct StageSet {
    stages: Vec<String>,
}

impl StageSet {
    pub fn new<S: Into<String>>(stages: impl IntoIterator<Item = S>) -> Self {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
        }
    }

    /// Rank of a stage in declaration order.
    pub fn rank(&self, stage: &str) -> Result<i32, StoreError> {
        self.stages
            .iter()
            .position(|s| s == stage)
            .map(|i| i as i32)
            .ok_or_else(|| StoreError::NotFound(format!("unknown stage: {stage}")))
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }
}

/// Serialize a partition payload deterministically.
///
/// serde_json maps are BTree-backed, so object keys come out sorted and the
/// same partition always produces the same key string.
pub fn partition_key(partition: &Value) -> String {
    partition.to_string()
}

/// Per-domain manifest facade over a [`ManifestStore`].
#[derive(Clone)]
pub struct WorkManifest {
    store: Arc<dyn ManifestStore>,
    domain: String,
    stages: StageSet,
}

impl WorkManifest {
    pub fn new(store: Arc<dyn ManifestStore>, domain: impl Into<String>, stages: StageSet) -> Self {
        Self {
            store,
            domain: domain.into(),
            stages,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// True iff the partition has reached `stage` (or beyond).
    pub async fn is_at_least(&self, partition: &Value, stage: &str) -> Result<bool, StoreError> {
        let rank = self.stages.rank(stage)?;
        let key = partition_key(partition);
        let current = self.store.current_manifest_rank(&self.domain, &key).await?;
        Ok(current.is_some_and(|c| c >= rank))
    }

    /// Record that the partition reached `stage`.
    ///
    /// Monotonic: writing a stage below the current rank is a no-op (the
    /// partition has already progressed past it).
    pub async fn advance_to(
        &self,
        partition: &Value,
        stage: &str,
        row_count: Option<u64>,
        metrics: Option<Value>,
    ) -> Result<Option<ManifestEntry>, StoreError> {
        let rank = self.stages.rank(stage)?;
        let key = partition_key(partition);

        if let Some(current) = self.store.current_manifest_rank(&self.domain, &key).await? {
            if current > rank {
                tracing::debug!(
                    domain = %self.domain,
                    partition = %key,
                    stage,
                    current_rank = current,
                    "manifest advance ignored, partition already past stage"
                );
                return Ok(None);
            }
        }

        let entry = self
            .store
            .upsert_manifest_entry(NewManifestEntry {
                domain: self.domain.clone(),
                partition_key: key,
                stage: stage.to_string(),
                stage_rank: rank,
                row_count,
                metrics,
            })
            .await?;
        Ok(Some(entry))
    }

    /// Force the partition back to `stage`, superseding later rows.
    pub async fn reset_to(
        &self,
        partition: &Value,
        stage: &str,
    ) -> Result<ManifestEntry, StoreError> {
        let rank = self.stages.rank(stage)?;
        let key = partition_key(partition);

        let superseded = self
            .store
            .supersede_manifest_above(&self.domain, &key, rank)
            .await?;
        tracing::info!(
            domain = %self.domain,
            partition = %key,
            stage,
            superseded,
            "manifest reset"
        );

        self.store
            .upsert_manifest_entry(NewManifestEntry {
                domain: self.domain.clone(),
                partition_key: key,
                stage: stage.to_string(),
                stage_rank: rank,
                row_count: None,
                metrics: None,
            })
            .await
    }

    /// Current stage name for the partition, if any progress was recorded.
    pub async fn current_stage(&self, partition: &Value) -> Result<Option<String>, StoreError> {
        let key = partition_key(partition);
        let rank = self.store.current_manifest_rank(&self.domain, &key).await?;
        Ok(rank.and_then(|r| self.stages.stages().get(r as usize).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_ranks() {
        let stages = StageSet::new(["INGESTED", "NORMALIZED", "AGGREGATED", "PUBLISHED"]);
        assert_eq!(stages.rank("INGESTED").unwrap(), 0);
        assert_eq!(stages.rank("PUBLISHED").unwrap(), 3);
        assert!(stages.rank("UNKNOWN").is_err());
    }

    #[test]
    fn test_partition_key_deterministic() {
        let a = json!({"week_ending": "2026-01-03", "tier": "NMS_TIER_1"});
        let b = json!({"tier": "NMS_TIER_1", "week_ending": "2026-01-03"});
        assert_eq!(partition_key(&a), partition_key(&b));
    }
}
