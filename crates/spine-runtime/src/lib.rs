//! # Spine Runtime
//!
//! The runtime adapter layer: a uniform contract over heterogeneous
//! execution backends (in-process stub, local subprocess, remote engines)
//! plus the pieces that make it safe to use:
//!
//! - [`AdapterRouter`] selects an adapter by the spec's `runtime` field
//! - [`SpecValidator`] rejects infeasible specs before submission
//! - [`CircuitBreaker`]s guard each runtime at the call site
//! - [`JobEngine`] is the single entry point: validate → route → submit →
//!   record in the execution ledger
//!
//! ```text
//! Caller ──▶ JobEngine ──▶ SpecValidator
//!                │   └────▶ AdapterRouter ──▶ RuntimeAdapter
//!                └────────▶ ExecutionLedger
//! ```

pub mod adapter;
pub mod breaker;
pub mod engine;
pub mod error;
pub mod hot_reload;
pub mod local;
pub mod router;
pub mod spec;
pub mod stub;
pub mod validator;

pub use adapter::{LogStream, RuntimeAdapter, RuntimeCapabilities, RuntimeConstraints, RuntimeHealth};
pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use engine::{JobEngine, SubmitResult};
pub use error::{ErrorCategory, JobError};
pub use hot_reload::{HotReloadAdapter, HotReloadConfig};
pub use local::LocalProcessAdapter;
pub use router::AdapterRouter;
pub use spec::{
    ContainerJobSpec, InitContainerSpec, JobState, JobStatus, ResourceRequirements, SidecarSpec,
    VolumeMount,
};
pub use stub::StubAdapter;
pub use validator::SpecValidator;
