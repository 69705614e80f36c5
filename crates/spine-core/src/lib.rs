//! # Spine Core
//!
//! Shared model types for the spine durable execution runtime:
//!
//! - Time-ordered identifiers (UUID v7) and UTC clock helpers
//! - Deterministic spec hashing for idempotent submission
//! - The cross-cutting error taxonomy with retryable classification
//! - The execution lifecycle model (status lattice, trigger sources,
//!   lifecycle events)
//! - `kind:name` operation references

pub mod error;
pub mod execution;
pub mod ids;
pub mod operation;

pub use error::{ErrorKind, SpineError};
pub use execution::{
    EventType, Execution, ExecutionEvent, ExecutionStatus, NewExecution, TriggerSource,
};
pub use ids::{new_event_id, new_execution_id, new_run_id, spec_hash, utc_now};
pub use operation::{OperationKind, OperationRef};
