//! Concurrency guard contract
//!
//! Named leases with owner and expiry. Acquisition is a conditional
//! insert/compare-and-set: when two acquirers race, exactly one wins.
//! Expired leases are treated as absent.

use std::time::Duration;

use async_trait::async_trait;

use crate::store::StoreError;

/// Lease-based mutual exclusion by name.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// Try to acquire a lease.
    ///
    /// Succeeds when no lease exists for `lock_key`, when the prior lease has
    /// expired, or when the caller already holds it (re-acquire extends the
    /// expiry). Returns false while another owner's unexpired lease stands.
    async fn acquire(
        &self,
        lock_key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release a lease. Only succeeds when `owner_id` matches the holder.
    async fn release(&self, lock_key: &str, owner_id: &str) -> Result<bool, StoreError>;

    /// Extend a held lease's expiry. Only the holder may extend.
    async fn extend(
        &self,
        lock_key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Whether an unexpired lease exists for the key.
    async fn is_held(&self, lock_key: &str) -> Result<bool, StoreError>;

    /// Delete expired leases. Idempotent; returns the number removed.
    async fn reap_expired(&self) -> Result<u64, StoreError>;
}
