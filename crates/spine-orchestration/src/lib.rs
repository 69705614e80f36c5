//! # Spine Orchestration
//!
//! Multi-step workflow coordination over the execution substrate:
//!
//! - [`Workflow`] / [`Step`] — typed DAG definitions with tagged step
//!   variants (pipeline, lambda, choice, wait, map)
//! - [`Planner`] — cycle detection, topological ordering, parameter merge
//! - [`WorkflowContext`] — immutable snapshot flowing step to step
//! - [`WorkflowRunner`] — sequential or bounded-parallel execution with
//!   failure policies and per-step retry
//! - [`ContainerBridge`] — dispatches pipeline steps through the Job Engine

pub mod bridge;
pub mod context;
pub mod model;
pub mod planner;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod step_result;

pub use bridge::{BridgeConfig, ContainerBridge};
pub use context::{ExecutionContext, WorkflowContext};
pub use model::{
    Condition, ExecutionMode, ExecutionPolicy, FailurePolicy, Step, StepKind, Workflow,
};
pub use planner::{ExecutionPlan, PlanError, PlannedStep, Planner};
pub use registry::WorkflowRegistry;
pub use retry::StepRetryPolicy;
pub use runner::{
    LambdaHandler, OperationRun, Runnable, StepOutcome, WorkflowRunResult, WorkflowRunner,
};
pub use step_result::{QualityMetrics, StepErrorCategory, StepResult};
