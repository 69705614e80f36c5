//! Runtime adapter contract

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobError;
use crate::spec::{ContainerJobSpec, JobStatus};

/// Feature flags a runtime backend supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RuntimeCapabilities {
    pub supports_gpu: bool,
    pub supports_volumes: bool,
    pub supports_sidecars: bool,
    pub supports_init_containers: bool,
    pub supports_log_streaming: bool,
    pub supports_artifacts: bool,
}

/// Numeric limits a runtime backend enforces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConstraints {
    pub max_timeout_seconds: u64,
    pub max_env_count: usize,
    pub max_label_count: usize,
    pub max_memory_mb: u64,
    pub max_cpu: f64,
    pub max_concurrent_jobs: usize,
}

impl Default for RuntimeConstraints {
    fn default() -> Self {
        Self {
            max_timeout_seconds: 24 * 3600,
            max_env_count: 100,
            max_label_count: 50,
            max_memory_mb: 64 * 1024,
            max_cpu: 32.0,
            max_concurrent_jobs: 100,
        }
    }
}

/// Health report for a runtime backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeHealth {
    pub runtime: String,
    pub healthy: bool,
    pub message: String,
    #[serde(default)]
    pub detail: Value,
}

impl RuntimeHealth {
    pub fn healthy(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            healthy: true,
            message: "ok".to_string(),
            detail: Value::Null,
        }
    }

    pub fn unhealthy(runtime: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            healthy: false,
            message: message.into(),
            detail: Value::Null,
        }
    }
}

/// Newline-delimited log stream.
pub type LogStream = BoxStream<'static, String>;

/// Uniform contract over execution backends.
///
/// Implementations must be thread-safe; all operations may be invoked
/// concurrently for different jobs.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync + 'static {
    /// Unique runtime name used for routing.
    fn name(&self) -> &str;

    fn capabilities(&self) -> RuntimeCapabilities;

    fn constraints(&self) -> RuntimeConstraints;

    /// Enqueue the job, returning an opaque backend reference.
    ///
    /// Must be idempotent with respect to the spec's `idempotency_key` when
    /// one is provided.
    async fn submit(&self, spec: &ContainerJobSpec) -> Result<String, JobError>;

    /// Current status of a submitted job.
    async fn status(&self, external_ref: &str) -> Result<JobStatus, JobError>;

    /// Request cancellation. Returns false when the job is already terminal.
    async fn cancel(&self, external_ref: &str) -> Result<bool, JobError>;

    /// Stream log lines for a job.
    async fn logs(&self, external_ref: &str) -> Result<LogStream, JobError>;

    /// Best-effort resource release. Idempotent.
    async fn cleanup(&self, external_ref: &str) -> Result<(), JobError>;

    /// Backend health probe.
    async fn health(&self) -> RuntimeHealth;
}
