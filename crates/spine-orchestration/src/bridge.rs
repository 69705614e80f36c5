//! Container bridge
//!
//! Implements the runner's [`Runnable`] contract on top of the Job Engine:
//! operation steps become `ContainerJobSpec` submissions whose status is
//! polled until a terminal state or timeout.
//!
//! ```text
//! WorkflowRunner ──▶ Runnable
//!                       │
//!                 ContainerBridge
//!                       │
//!                    JobEngine ──▶ Router ──▶ Adapter(s)
//!                       └────────▶ Ledger
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use spine_runtime::{ContainerJobSpec, JobEngine, JobState};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::runner::{OperationRun, Runnable};
use crate::step_result::{StepErrorCategory, StepResult};

/// Resolves an operation name to a container image.
pub type ImageResolver = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Bridge configuration.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Image used when no resolver match exists
    pub default_image: String,
    /// Command template; `{operation}` is substituted
    pub command_template: Vec<String>,
    pub poll_interval: Duration,
    /// Bound on one step's wall clock, submission to terminal state
    pub timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_image: "spine-operation:latest".to_string(),
            command_template: vec![
                "spine-cli".to_string(),
                "run".to_string(),
                "{operation}".to_string(),
            ],
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(600),
        }
    }
}

impl BridgeConfig {
    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// `Runnable` implementation backed by the Job Engine.
pub struct ContainerBridge {
    engine: Arc<JobEngine>,
    image_resolver: Option<ImageResolver>,
    config: BridgeConfig,
}

impl ContainerBridge {
    pub fn new(engine: Arc<JobEngine>) -> Self {
        Self {
            engine,
            image_resolver: None,
            config: BridgeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_image_resolver(mut self, resolver: ImageResolver) -> Self {
        self.image_resolver = Some(resolver);
        self
    }

    /// Build the job spec for one operation dispatch. Parameters become
    /// `SPINE_PARAM_<KEY>` environment variables; correlation ids flow
    /// through env and labels.
    fn build_spec(&self, run: &OperationRun) -> ContainerJobSpec {
        let image = self
            .image_resolver
            .as_ref()
            .and_then(|resolve| resolve(&run.operation))
            .unwrap_or_else(|| self.config.default_image.clone());

        let command: Vec<String> = self
            .config
            .command_template
            .iter()
            .map(|part| part.replace("{operation}", &run.operation))
            .collect();

        let mut spec = ContainerJobSpec::new(
            format!("operation-{}", run.operation.replace('.', "-").replace(':', "-")),
            image,
        )
        .with_command(command)
        .with_timeout_seconds(self.config.timeout.as_secs())
        .with_label("spine.operation", &run.operation);

        for (key, value) in &run.params {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            spec = spec.with_env(format!("SPINE_PARAM_{}", key.to_uppercase()), rendered);
        }
        if let Some(ref parent) = run.parent_run_id {
            spec = spec
                .with_env("SPINE_PARENT_RUN_ID", parent)
                .with_label("spine.parent_run_id", parent);
        }
        if let Some(ref correlation) = run.correlation_id {
            spec = spec.with_env("SPINE_CORRELATION_ID", correlation);
        }

        spec
    }
}

#[async_trait]
impl Runnable for ContainerBridge {
    async fn run_operation(&self, run: OperationRun) -> StepResult {
        let spec = self.build_spec(&run);

        let submitted = match self.engine.submit(&spec).await {
            Ok(submitted) => submitted,
            Err(err) => {
                warn!(operation = %run.operation, error = %err, "bridge submit failed");
                let category = if err.retryable {
                    StepErrorCategory::Transient
                } else {
                    StepErrorCategory::Configuration
                };
                return StepResult::failed(err.to_string(), category);
            }
        };

        info!(
            operation = %run.operation,
            execution_id = %submitted.execution_id,
            external_ref = ?submitted.external_ref,
            "submitted operation job"
        );

        // Poll to a terminal state or the bridge timeout.
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let status = match self.engine.status(submitted.execution_id).await {
                Ok(status) => status,
                Err(err) => {
                    return StepResult::failed(
                        format!("status poll failed: {err}"),
                        StepErrorCategory::Transient,
                    )
                }
            };

            if status.state.is_terminal() {
                let mut output = Map::new();
                output.insert(
                    "execution_id".to_string(),
                    Value::String(submitted.execution_id.to_string()),
                );
                output.insert(
                    "runtime_state".to_string(),
                    Value::String(status.state.to_string()),
                );
                if let Some(code) = status.exit_code {
                    output.insert("exit_code".to_string(), Value::from(code));
                }

                return match status.state {
                    JobState::Succeeded => StepResult::ok_with(output),
                    JobState::Cancelled => StepResult::failed(
                        status
                            .message
                            .unwrap_or_else(|| "job cancelled".to_string()),
                        StepErrorCategory::Dependency,
                    ),
                    _ => StepResult::failed(
                        status
                            .message
                            .unwrap_or_else(|| "job failed".to_string()),
                        StepErrorCategory::Internal,
                    ),
                };
            }

            if Instant::now() >= deadline {
                warn!(
                    operation = %run.operation,
                    execution_id = %submitted.execution_id,
                    "operation timed out, cancelling"
                );
                let _ = self.engine.cancel(submitted.execution_id).await;
                return StepResult::failed(
                    format!(
                        "operation {} timed out after {}s",
                        run.operation,
                        self.config.timeout.as_secs()
                    ),
                    StepErrorCategory::Timeout,
                );
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
