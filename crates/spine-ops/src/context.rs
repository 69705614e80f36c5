//! Operation context

use std::sync::Arc;

use spine_storage::Store;

/// Shared state handed to every operation.
#[derive(Clone)]
pub struct OperationContext {
    /// Full storage contract (ledger, locks, DLQ, manifest, schedules, runs)
    pub store: Arc<dyn Store>,

    /// Caller identifier recorded on mutations (resolution, retries)
    pub caller: String,

    /// When set, mutating operations validate and report without writing
    pub dry_run: bool,
}

impl OperationContext {
    pub fn new(store: Arc<dyn Store>, caller: impl Into<String>) -> Self {
        Self {
            store,
            caller: caller.into(),
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}
