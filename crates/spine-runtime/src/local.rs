//! Local subprocess runtime adapter
//!
//! Runs jobs as local child processes with captured stdout/stderr. The
//! `image` field of the spec is documentation only; the command line is what
//! actually executes. Cancellation gives the process a grace period to exit
//! before force-killing it, and the spec timeout is enforced the same way.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use spine_core::utc_now;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapter::{
    LogStream, RuntimeAdapter, RuntimeCapabilities, RuntimeConstraints, RuntimeHealth,
};
use crate::error::JobError;
use crate::spec::{ContainerJobSpec, JobState, JobStatus};

struct ProcessEntry {
    state: JobState,
    exit_code: Option<i32>,
    message: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    lines: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
}

type JobMap = Arc<Mutex<HashMap<String, ProcessEntry>>>;

/// Runtime adapter backed by local subprocesses.
pub struct LocalProcessAdapter {
    jobs: JobMap,
    /// Grace period between a cancel request and the forced kill
    grace: Duration,
}

impl LocalProcessAdapter {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            grace: Duration::from_secs(5),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn finalize(
        jobs: &JobMap,
        external_ref: &str,
        state: JobState,
        exit_code: Option<i32>,
        message: Option<String>,
    ) {
        if let Some(entry) = jobs.lock().get_mut(external_ref) {
            entry.state = state;
            entry.exit_code = exit_code;
            entry.message = message;
            entry.completed_at = Some(utc_now());
        }
    }
}

impl Default for LocalProcessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeAdapter for LocalProcessAdapter {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            supports_gpu: false,
            supports_volumes: false,
            supports_sidecars: false,
            supports_init_containers: false,
            supports_log_streaming: true,
            supports_artifacts: false,
        }
    }

    fn constraints(&self) -> RuntimeConstraints {
        RuntimeConstraints {
            max_timeout_seconds: 3600,
            max_concurrent_jobs: 16,
            ..Default::default()
        }
    }

    async fn submit(&self, spec: &ContainerJobSpec) -> Result<String, JobError> {
        let Some(program) = spec.command.first() else {
            return Err(JobError::validation("local", "spec command must not be empty"));
        };

        let mut command = Command::new(program);
        command
            .args(&spec.command[1..])
            .args(&spec.args)
            .envs(&spec.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| JobError::internal("local", format!("failed to spawn {program}: {e}")))?;

        let external_ref = format!("local-{}", Uuid::now_v7());
        let lines = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        self.jobs.lock().insert(
            external_ref.clone(),
            ProcessEntry {
                state: JobState::Running,
                exit_code: None,
                message: None,
                started_at: utc_now(),
                completed_at: None,
                lines: Arc::clone(&lines),
                cancel: cancel.clone(),
            },
        );

        // Stream captured output into the shared line buffer.
        if let Some(stdout) = child.stdout.take() {
            let lines = Arc::clone(&lines);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    lines.lock().push(line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let lines = Arc::clone(&lines);
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    lines.lock().push(line);
                }
            });
        }

        let jobs = Arc::clone(&self.jobs);
        let monitor_ref = external_ref.clone();
        let timeout = Duration::from_secs(spec.timeout_seconds);
        let grace = self.grace;

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => {
                        let code = status.code();
                        let state = if status.success() {
                            JobState::Succeeded
                        } else {
                            JobState::Failed
                        };
                        let message = (!status.success())
                            .then(|| format!("process exited with {status}"));
                        Self::finalize(&jobs, &monitor_ref, state, code, message);
                    }
                    Err(e) => {
                        Self::finalize(
                            &jobs,
                            &monitor_ref,
                            JobState::Failed,
                            None,
                            Some(format!("wait failed: {e}")),
                        );
                    }
                },
                _ = deadline.as_mut() => {
                    warn!(external_ref = %monitor_ref, "local job timed out, killing");
                    let _ = child.kill().await;
                    Self::finalize(
                        &jobs,
                        &monitor_ref,
                        JobState::Failed,
                        None,
                        Some(format!("timed out after {}s", timeout.as_secs())),
                    );
                },
                _ = cancel.cancelled() => {
                    // Give the process the grace window to exit on its own.
                    let exited = tokio::time::timeout(grace, child.wait()).await;
                    if exited.is_err() {
                        let _ = child.kill().await;
                    }
                    Self::finalize(
                        &jobs,
                        &monitor_ref,
                        JobState::Cancelled,
                        None,
                        Some("cancelled".to_string()),
                    );
                },
            }
            debug!(external_ref = %monitor_ref, "local job monitor exited");
        });

        Ok(external_ref)
    }

    async fn status(&self, external_ref: &str) -> Result<JobStatus, JobError> {
        let jobs = self.jobs.lock();
        let entry = jobs
            .get(external_ref)
            .ok_or_else(|| JobError::not_found("local", format!("unknown job: {external_ref}")))?;

        Ok(JobStatus {
            state: entry.state,
            exit_code: entry.exit_code,
            message: entry.message.clone(),
            started_at: Some(entry.started_at),
            completed_at: entry.completed_at,
        })
    }

    async fn cancel(&self, external_ref: &str) -> Result<bool, JobError> {
        let jobs = self.jobs.lock();
        let entry = jobs
            .get(external_ref)
            .ok_or_else(|| JobError::not_found("local", format!("unknown job: {external_ref}")))?;

        if entry.state.is_terminal() {
            return Ok(false);
        }
        entry.cancel.cancel();
        Ok(true)
    }

    async fn logs(&self, external_ref: &str) -> Result<LogStream, JobError> {
        if !self.jobs.lock().contains_key(external_ref) {
            return Err(JobError::not_found(
                "local",
                format!("unknown job: {external_ref}"),
            ));
        }

        let jobs = Arc::clone(&self.jobs);
        let external_ref = external_ref.to_string();

        // Yield buffered lines, then follow until the process is terminal.
        let stream = futures::stream::unfold(0usize, move |idx| {
            let jobs = Arc::clone(&jobs);
            let external_ref = external_ref.clone();
            async move {
                loop {
                    let next = {
                        let map = jobs.lock();
                        let entry = map.get(&external_ref)?;
                        let lines = entry.lines.lock();
                        if idx < lines.len() {
                            Ok(lines[idx].clone())
                        } else {
                            Err(entry.state.is_terminal())
                        }
                    };
                    match next {
                        Ok(line) => return Some((line, idx + 1)),
                        Err(true) => return None,
                        Err(false) => tokio::time::sleep(Duration::from_millis(50)).await,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn cleanup(&self, external_ref: &str) -> Result<(), JobError> {
        if let Some(entry) = self.jobs.lock().remove(external_ref) {
            if !entry.state.is_terminal() {
                entry.cancel.cancel();
            }
        }
        Ok(())
    }

    async fn health(&self) -> RuntimeHealth {
        RuntimeHealth::healthy("local")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ContainerJobSpec {
        ContainerJobSpec::new("shell", "local").with_command(["sh", "-c", script])
    }

    async fn wait_terminal(adapter: &LocalProcessAdapter, external_ref: &str) -> JobStatus {
        for _ in 0..100 {
            let status = adapter.status(external_ref).await.unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_successful_process() {
        let adapter = LocalProcessAdapter::new();
        let external_ref = adapter.submit(&sh("echo hello")).await.unwrap();

        let status = wait_terminal(&adapter, &external_ref).await;
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.exit_code, Some(0));

        let lines: Vec<String> = adapter.logs(&external_ref).await.unwrap().collect().await;
        assert_eq!(lines, vec!["hello"]);
    }

    #[tokio::test]
    async fn test_failing_process() {
        let adapter = LocalProcessAdapter::new();
        let external_ref = adapter.submit(&sh("exit 3")).await.unwrap();

        let status = wait_terminal(&adapter, &external_ref).await;
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let adapter = LocalProcessAdapter::new();
        let spec = sh("sleep 30").with_timeout_seconds(1);
        let external_ref = adapter.submit(&spec).await.unwrap();

        let status = wait_terminal(&adapter, &external_ref).await;
        assert_eq!(status.state, JobState::Failed);
        assert!(status.message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_process() {
        let adapter = LocalProcessAdapter::new().with_grace(Duration::from_millis(100));
        let external_ref = adapter.submit(&sh("sleep 30")).await.unwrap();

        assert!(adapter.cancel(&external_ref).await.unwrap());
        let status = wait_terminal(&adapter, &external_ref).await;
        assert_eq!(status.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let adapter = LocalProcessAdapter::new();
        let spec = ContainerJobSpec::new("empty", "local");
        let err = adapter.submit(&spec).await.unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let adapter = LocalProcessAdapter::new();
        let external_ref = adapter.submit(&sh("echo ok")).await.unwrap();
        wait_terminal(&adapter, &external_ref).await;

        adapter.cleanup(&external_ref).await.unwrap();
        adapter.cleanup(&external_ref).await.unwrap();
        assert!(adapter.status(&external_ref).await.is_err());
    }
}
