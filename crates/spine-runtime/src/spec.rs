//! Container job specification and status types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource requirements for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    /// CPU cores
    pub cpu: f64,
    /// Memory in MiB
    pub memory_mb: u64,
    /// GPU count
    pub gpu: u32,
}

/// A volume mounted into the job container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub host_path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// A sidecar container running alongside the main container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
}

/// An init container that must complete before the main container starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
}

/// Specification of one containerized job.
///
/// Maps are BTree-backed so serialization order is stable and the spec hash
/// is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerJobSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    #[serde(default)]
    pub sidecars: Vec<SidecarSpec>,
    #[serde(default)]
    pub init_containers: Vec<InitContainerSpec>,
    pub timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cost_usd: Option<f64>,
    /// Named retry policy resolved by the orchestration layer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Explicit runtime selection; the router falls back to its default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
}

impl ContainerJobSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: vec![],
            args: vec![],
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            resources: ResourceRequirements::default(),
            volumes: vec![],
            sidecars: vec![],
            init_containers: vec![],
            timeout_seconds: 600,
            max_cost_usd: None,
            retry_policy: None,
            idempotency_key: None,
            runtime: None,
        }
    }

    pub fn with_command(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout: u64) -> Self {
        self.timeout_seconds = timeout;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    /// Deterministic hash of the spec, used for dedup and change detection.
    pub fn spec_hash(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or_default();
        spine_core::spec_hash(&value)
    }
}

/// Backend-reported job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Status snapshot for a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn pending() -> Self {
        Self {
            state: JobState::Pending,
            exit_code: None,
            message: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn running(started_at: DateTime<Utc>) -> Self {
        Self {
            state: JobState::Running,
            exit_code: None,
            message: None,
            started_at: Some(started_at),
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_stable() {
        let a = ContainerJobSpec::new("j", "alpine")
            .with_env("B", "2")
            .with_env("A", "1");
        let b = ContainerJobSpec::new("j", "alpine")
            .with_env("A", "1")
            .with_env("B", "2");
        assert_eq!(a.spec_hash(), b.spec_hash());
    }

    #[test]
    fn test_spec_hash_sensitive_to_content() {
        let a = ContainerJobSpec::new("j", "alpine");
        let b = ContainerJobSpec::new("j", "alpine:3.20");
        assert_ne!(a.spec_hash(), b.spec_hash());
    }

    #[test]
    fn test_job_state_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_default_timeout() {
        let spec = ContainerJobSpec::new("j", "alpine");
        assert_eq!(spec.timeout_seconds, 600);
        assert!(spec.idempotency_key.is_none());
    }
}
