//! Pre-flight spec validation
//!
//! Checks a spec against an adapter's capabilities and constraints before
//! any submission. Violations are collected all at once, not fail-fast, so
//! callers see every problem in a single round trip.

use crate::adapter::{RuntimeAdapter, RuntimeCapabilities, RuntimeConstraints};
use crate::error::JobError;
use crate::spec::ContainerJobSpec;

/// Validates specs against runtime capabilities and constraints.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecValidator;

impl SpecValidator {
    pub fn new() -> Self {
        Self
    }

    /// Collect every violation of the spec against the given capabilities
    /// and constraints. An empty list means the spec is feasible.
    pub fn validate(
        &self,
        spec: &ContainerJobSpec,
        capabilities: &RuntimeCapabilities,
        constraints: &RuntimeConstraints,
    ) -> Vec<String> {
        let mut violations = Vec::new();

        // Capability mismatches
        if spec.resources.gpu > 0 && !capabilities.supports_gpu {
            violations.push(format!(
                "spec requests {} GPU(s) but runtime does not support GPUs",
                spec.resources.gpu
            ));
        }
        if !spec.volumes.is_empty() && !capabilities.supports_volumes {
            violations.push(format!(
                "spec requests {} volume(s) but runtime does not support volumes",
                spec.volumes.len()
            ));
        }
        if !spec.sidecars.is_empty() && !capabilities.supports_sidecars {
            violations.push(format!(
                "spec requests {} sidecar(s) but runtime does not support sidecars",
                spec.sidecars.len()
            ));
        }
        if !spec.init_containers.is_empty() && !capabilities.supports_init_containers {
            violations.push(format!(
                "spec requests {} init container(s) but runtime does not support init containers",
                spec.init_containers.len()
            ));
        }

        // Constraint violations
        if spec.timeout_seconds > constraints.max_timeout_seconds {
            violations.push(format!(
                "timeout_seconds {} exceeds runtime maximum {}",
                spec.timeout_seconds, constraints.max_timeout_seconds
            ));
        }
        if spec.env.len() > constraints.max_env_count {
            violations.push(format!(
                "env count {} exceeds runtime maximum {}",
                spec.env.len(),
                constraints.max_env_count
            ));
        }
        if spec.labels.len() > constraints.max_label_count {
            violations.push(format!(
                "label count {} exceeds runtime maximum {}",
                spec.labels.len(),
                constraints.max_label_count
            ));
        }

        // Budget gate: zero and unset are accepted
        if let Some(cost) = spec.max_cost_usd {
            if cost < 0.0 {
                violations.push(format!("max_cost_usd must not be negative, got {cost}"));
            }
        }

        violations
    }

    /// Validate against an adapter, raising a non-retryable
    /// `JobError(VALIDATION)` carrying the concatenated violations.
    pub fn validate_or_raise(
        &self,
        spec: &ContainerJobSpec,
        adapter: &dyn RuntimeAdapter,
    ) -> Result<(), JobError> {
        let violations =
            self.validate(spec, &adapter.capabilities(), &adapter.constraints());
        if violations.is_empty() {
            Ok(())
        } else {
            Err(JobError::validation(adapter.name(), violations.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::spec::{ResourceRequirements, VolumeMount};
    use crate::stub::StubAdapter;

    fn caps_none() -> RuntimeCapabilities {
        RuntimeCapabilities::default()
    }

    #[test]
    fn test_valid_spec_passes() {
        let validator = SpecValidator::new();
        let spec = ContainerJobSpec::new("simple", "python:3.12-slim")
            .with_command(["python", "-c", "print('hello')"])
            .with_timeout_seconds(60);

        let violations = validator.validate(&spec, &caps_none(), &RuntimeConstraints::default());
        assert!(violations.is_empty());
    }

    #[test]
    fn test_gpu_mismatch() {
        let validator = SpecValidator::new();
        let spec = ContainerJobSpec::new("ml-training", "nvidia/cuda:12.0").with_resources(
            ResourceRequirements {
                gpu: 1,
                ..Default::default()
            },
        );

        let violations = validator.validate(&spec, &caps_none(), &RuntimeConstraints::default());
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("GPU"));
    }

    #[test]
    fn test_multiple_violations_collected() {
        let validator = SpecValidator::new();
        let mut spec = ContainerJobSpec::new("complex", "nvidia/cuda:12.0").with_resources(
            ResourceRequirements {
                gpu: 2,
                ..Default::default()
            },
        );
        spec.volumes.push(VolumeMount {
            name: "data".to_string(),
            mount_path: "/data".to_string(),
            host_path: Some("/mnt/data".to_string()),
            read_only: false,
        });
        spec.max_cost_usd = Some(-5.0);

        let violations = validator.validate(&spec, &caps_none(), &RuntimeConstraints::default());
        assert_eq!(violations.len(), 3);
    }

    #[test]
    fn test_budget_gate_accepts_zero() {
        let validator = SpecValidator::new();
        let mut spec = ContainerJobSpec::new("budget", "alpine");
        spec.max_cost_usd = Some(0.0);
        let violations = validator.validate(&spec, &caps_none(), &RuntimeConstraints::default());
        assert!(violations.is_empty());
    }

    #[test]
    fn test_constraint_violations() {
        let validator = SpecValidator::new();
        let constraints = RuntimeConstraints {
            max_timeout_seconds: 60,
            max_env_count: 1,
            max_label_count: 1,
            ..Default::default()
        };
        let spec = ContainerJobSpec::new("big", "alpine")
            .with_timeout_seconds(120)
            .with_env("A", "1")
            .with_env("B", "2")
            .with_label("x", "1")
            .with_label("y", "2");

        let violations = validator.validate(&spec, &caps_none(), &constraints);
        assert_eq!(violations.len(), 3);
    }

    #[test]
    fn test_validate_or_raise() {
        let validator = SpecValidator::new();
        let adapter = StubAdapter::auto_succeed();
        let spec = ContainerJobSpec::new("gpu-job", "nvidia/cuda:12.0").with_resources(
            ResourceRequirements {
                gpu: 1,
                ..Default::default()
            },
        );

        let err = validator.validate_or_raise(&spec, &adapter).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(!err.retryable);
        assert_eq!(err.runtime, "stub");
    }
}
