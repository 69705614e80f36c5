//! # Spine Storage
//!
//! Durable state for the execution runtime. Storage is contract-first: each
//! concern (ledger, locks, dead letters, manifest, schedules, workflow runs)
//! is an async trait, and two backends implement all of them with identical
//! semantics:
//!
//! - [`MemoryStore`] — embedded in-process store for tests and single-node use
//! - [`PostgresStore`] — production persistence with `FOR UPDATE SKIP LOCKED`
//!   claiming
//!
//! The ledger is the source of truth for "what happened": every execution row
//! is paired with an append-only event history, and all multi-row writes
//! (create + first event, status change + lifecycle event) are atomic.

pub mod dlq;
pub mod ledger;
pub mod locks;
pub mod manifest;
pub mod memory;
pub mod postgres;
pub mod retention;
pub mod schedules;
pub mod store;
pub mod workflow_runs;

pub use dlq::{DeadLetter, DeadLetterStore, DlqStats};
pub use ledger::{ExecutionFilter, ExecutionLedger};
pub use locks::LockStore;
pub use manifest::{ManifestEntry, ManifestStore, NewManifestEntry, StageSet, WorkManifest};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use retention::{purge_all, PurgeOutcome, RetentionConfig, RetentionReport, RetentionStore};
pub use schedules::{
    NewSchedule, Schedule, ScheduleKind, ScheduleRun, ScheduleRunStatus, ScheduleStore,
    ScheduleUpdate,
};
pub use store::{Pagination, Store, StoreError};
pub use workflow_runs::{
    RunStatus, StepStatus, WorkflowRunRecord, WorkflowRunEvent, WorkflowRunStore,
    WorkflowStepRecord,
};
