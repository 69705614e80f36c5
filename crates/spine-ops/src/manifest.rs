//! Work manifest operations

use spine_storage::ManifestStore;

use crate::context::OperationContext;
use crate::requests::ListManifestRequest;
use crate::responses::ManifestEntrySummary;
use crate::result::{start_timer, ErrorCode, PagedResult};

/// List manifest entries for a domain, optionally one partition.
pub async fn list_manifest_entries(
    ctx: &OperationContext,
    request: ListManifestRequest,
) -> PagedResult<ManifestEntrySummary> {
    let timer = start_timer();

    if request.domain.is_empty() {
        return PagedResult::fail(
            ErrorCode::ValidationFailed,
            "domain is required",
            timer.elapsed_ms(),
        );
    }

    match ctx
        .store
        .list_manifest_entries(&request.domain, request.partition_key.as_deref())
        .await
    {
        Ok(entries) => {
            let total = entries.len() as u64;
            PagedResult::ok(
                entries.iter().map(ManifestEntrySummary::from).collect(),
                total,
                total as u32,
                0,
                timer.elapsed_ms(),
            )
        }
        Err(e) => PagedResult::store_error(&e, timer.elapsed_ms()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spine_storage::{ManifestStore, NewManifestEntry};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_list_entries() {
        let store = Arc::new(spine_storage::MemoryStore::new());
        let ctx = OperationContext::new(store, "tester");

        ctx.store
            .upsert_manifest_entry(NewManifestEntry {
                domain: "otc".to_string(),
                partition_key: json!({"week": "2026-01-03"}).to_string(),
                stage: "INGESTED".to_string(),
                stage_rank: 0,
                row_count: Some(1500),
                metrics: None,
            })
            .await
            .unwrap();

        let listed = list_manifest_entries(
            &ctx,
            ListManifestRequest {
                domain: "otc".to_string(),
                partition_key: None,
            },
        )
        .await;
        assert_eq!(listed.total, 1);
        assert_eq!(listed.items[0].stage, "INGESTED");
        assert!(!listed.items[0].superseded);
    }

    #[tokio::test]
    async fn test_empty_domain_rejected() {
        let store = Arc::new(spine_storage::MemoryStore::new());
        let ctx = OperationContext::new(store, "tester");

        let listed = list_manifest_entries(
            &ctx,
            ListManifestRequest {
                domain: String::new(),
                partition_key: None,
            },
        )
        .await;
        assert!(!listed.success);
    }
}
