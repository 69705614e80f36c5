//! # Spine Worker
//!
//! Background services over the execution ledger:
//!
//! - [`HandlerRegistry`] — `kind:name` → async handler lookup with optional
//!   required-parameter pre-flight
//! - [`Dispatcher`] — polls the ledger, claims pending executions
//!   atomically, runs handlers under a bounded pool, records terminal state
//! - [`Scheduler`] — tick loop emitting executions from cron/interval
//!   schedules with misfire handling and per-schedule instance locks

pub mod cron;
pub mod dispatcher;
pub mod registry;
pub mod scheduler;

pub use cron::{compute_next_run, validate_cron_expression, SchedulerError};
pub use dispatcher::{Dispatcher, DispatcherConfig, HandlerContext, WorkerError, WorkerStats};
pub use registry::{HandlerRegistry, TaskHandler};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
