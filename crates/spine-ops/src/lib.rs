//! # Spine Ops
//!
//! The typed operations layer consumed by transports. Every operation takes
//! an [`OperationContext`] plus a typed request and returns an
//! [`OperationResult`] / [`PagedResult`] envelope with a structured error
//! code and elapsed time. Operations never panic and never leak raw errors
//! across the boundary; unexpected failures map to `INTERNAL`.

pub mod context;
pub mod dlq;
pub mod executions;
pub mod manifest;
pub mod requests;
pub mod responses;
pub mod result;
pub mod schedules;
pub mod workflows;

pub use context::OperationContext;
pub use result::{start_timer, ErrorCode, OperationError, OperationResult, PagedResult, Timer};
