//! Stub runtime adapter — controllable test double
//!
//! Implements the full adapter contract without touching real
//! infrastructure. Engine, router, bridge and workflow tests inject failure
//! modes and assert on call counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use spine_core::utc_now;
use uuid::Uuid;

use crate::adapter::{
    LogStream, RuntimeAdapter, RuntimeCapabilities, RuntimeConstraints, RuntimeHealth,
};
use crate::error::JobError;
use crate::spec::{ContainerJobSpec, JobState, JobStatus};

struct StubJob {
    state: JobState,
    message: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

/// Fully controllable in-memory adapter.
///
/// - `auto_succeed` — submitted jobs report `succeeded` immediately
/// - `fail_submit` / `fail_cancel` / `fail_health` — injectable failures
/// - `submit_count` / `cancel_count` / `cleanup_count` — interaction counters
pub struct StubAdapter {
    auto_succeed: bool,
    pub fail_submit: AtomicBool,
    pub fail_cancel: AtomicBool,
    pub fail_health: AtomicBool,
    submit_count: AtomicUsize,
    cancel_count: AtomicUsize,
    cleanup_count: AtomicUsize,
    jobs: Mutex<HashMap<String, StubJob>>,
    by_idempotency_key: Mutex<HashMap<String, String>>,
}

impl StubAdapter {
    pub fn new(auto_succeed: bool) -> Self {
        Self {
            auto_succeed,
            fail_submit: AtomicBool::new(false),
            fail_cancel: AtomicBool::new(false),
            fail_health: AtomicBool::new(false),
            submit_count: AtomicUsize::new(0),
            cancel_count: AtomicUsize::new(0),
            cleanup_count: AtomicUsize::new(0),
            jobs: Mutex::new(HashMap::new()),
            by_idempotency_key: Mutex::new(HashMap::new()),
        }
    }

    /// Stub whose jobs complete immediately.
    pub fn auto_succeed() -> Self {
        Self::new(true)
    }

    pub fn submit_count(&self) -> usize {
        self.submit_count.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancel_count.load(Ordering::SeqCst)
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanup_count.load(Ordering::SeqCst)
    }

    /// Force a pending job to `succeeded` (manual-mode tests).
    pub fn complete(&self, external_ref: &str) {
        if let Some(job) = self.jobs.lock().get_mut(external_ref) {
            job.state = JobState::Succeeded;
            job.completed_at = Some(utc_now());
        }
    }

    /// Force every non-terminal job to `succeeded` (manual-mode tests).
    pub fn complete_all(&self) {
        let now = utc_now();
        for job in self.jobs.lock().values_mut() {
            if !job.state.is_terminal() {
                job.state = JobState::Succeeded;
                job.completed_at = Some(now);
            }
        }
    }

    /// Force a pending job to `failed` with a message.
    pub fn fail(&self, external_ref: &str, message: impl Into<String>) {
        if let Some(job) = self.jobs.lock().get_mut(external_ref) {
            job.state = JobState::Failed;
            job.message = Some(message.into());
            job.completed_at = Some(utc_now());
        }
    }
}

impl Default for StubAdapter {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl RuntimeAdapter for StubAdapter {
    fn name(&self) -> &str {
        "stub"
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            supports_log_streaming: true,
            ..Default::default()
        }
    }

    fn constraints(&self) -> RuntimeConstraints {
        RuntimeConstraints::default()
    }

    async fn submit(&self, spec: &ContainerJobSpec) -> Result<String, JobError> {
        self.submit_count.fetch_add(1, Ordering::SeqCst);

        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(JobError::unavailable("stub", "injected submit failure"));
        }

        if let Some(ref key) = spec.idempotency_key {
            if let Some(existing) = self.by_idempotency_key.lock().get(key) {
                return Ok(existing.clone());
            }
        }

        let external_ref = format!("stub-{}", Uuid::now_v7());
        let state = if self.auto_succeed {
            JobState::Succeeded
        } else {
            JobState::Running
        };
        let now = utc_now();

        self.jobs.lock().insert(
            external_ref.clone(),
            StubJob {
                state,
                message: None,
                started_at: now,
                completed_at: self.auto_succeed.then_some(now),
            },
        );
        if let Some(ref key) = spec.idempotency_key {
            self.by_idempotency_key
                .lock()
                .insert(key.clone(), external_ref.clone());
        }

        Ok(external_ref)
    }

    async fn status(&self, external_ref: &str) -> Result<JobStatus, JobError> {
        let jobs = self.jobs.lock();
        let job = jobs
            .get(external_ref)
            .ok_or_else(|| JobError::not_found("stub", format!("unknown job: {external_ref}")))?;

        Ok(JobStatus {
            state: job.state,
            exit_code: job.state.is_terminal().then_some(match job.state {
                JobState::Succeeded => 0,
                _ => 1,
            }),
            message: job.message.clone(),
            started_at: Some(job.started_at),
            completed_at: job.completed_at,
        })
    }

    async fn cancel(&self, external_ref: &str) -> Result<bool, JobError> {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);

        if self.fail_cancel.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(external_ref)
            .ok_or_else(|| JobError::not_found("stub", format!("unknown job: {external_ref}")))?;

        if job.state.is_terminal() {
            return Ok(false);
        }
        job.state = JobState::Cancelled;
        job.completed_at = Some(utc_now());
        Ok(true)
    }

    async fn logs(&self, external_ref: &str) -> Result<LogStream, JobError> {
        if !self.jobs.lock().contains_key(external_ref) {
            return Err(JobError::not_found(
                "stub",
                format!("unknown job: {external_ref}"),
            ));
        }
        let lines = vec![
            format!("[stub] job {external_ref} accepted"),
            format!("[stub] job {external_ref} finished"),
        ];
        Ok(futures::stream::iter(lines).boxed())
    }

    async fn cleanup(&self, external_ref: &str) -> Result<(), JobError> {
        self.cleanup_count.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().remove(external_ref);
        Ok(())
    }

    async fn health(&self) -> RuntimeHealth {
        if self.fail_health.load(Ordering::SeqCst) {
            RuntimeHealth::unhealthy("stub", "injected health failure")
        } else {
            RuntimeHealth::healthy("stub")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerJobSpec {
        ContainerJobSpec::new(name, "python:3.12").with_command(["echo", "hello"])
    }

    #[tokio::test]
    async fn test_auto_succeed() {
        let stub = StubAdapter::auto_succeed();
        let external_ref = stub.submit(&spec("job")).await.unwrap();
        let status = stub.status(&external_ref).await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_fail_submit_injection() {
        let stub = StubAdapter::auto_succeed();
        stub.fail_submit.store(true, Ordering::SeqCst);

        let err = stub.submit(&spec("job")).await.unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::RuntimeUnavailable);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let stub = StubAdapter::new(false);
        let external_ref = stub.submit(&spec("job")).await.unwrap();

        assert!(stub.cancel(&external_ref).await.unwrap());
        let status = stub.status(&external_ref).await.unwrap();
        assert_eq!(status.state, JobState::Cancelled);

        // Already terminal
        assert!(!stub.cancel(&external_ref).await.unwrap());
    }

    #[tokio::test]
    async fn test_counters() {
        let stub = StubAdapter::auto_succeed();
        let mut refs = Vec::new();
        for i in 0..3 {
            refs.push(stub.submit(&spec(&format!("job-{i}"))).await.unwrap());
        }
        stub.cancel(&refs[0]).await.unwrap();
        stub.cleanup(&refs[1]).await.unwrap();
        stub.cleanup(&refs[2]).await.unwrap();

        assert_eq!(stub.submit_count(), 3);
        assert_eq!(stub.cancel_count(), 1);
        assert_eq!(stub.cleanup_count(), 2);
    }

    #[tokio::test]
    async fn test_idempotent_submit() {
        let stub = StubAdapter::auto_succeed();
        let spec = spec("job").with_idempotency_key("k1");

        let first = stub.submit(&spec).await.unwrap();
        let second = stub.submit(&spec).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_health_injection() {
        let stub = StubAdapter::auto_succeed();
        assert!(stub.health().await.healthy);

        stub.fail_health.store(true, Ordering::SeqCst);
        let health = stub.health().await;
        assert!(!health.healthy);
    }

    #[tokio::test]
    async fn test_log_stream() {
        let stub = StubAdapter::auto_succeed();
        let external_ref = stub.submit(&spec("job")).await.unwrap();

        let lines: Vec<String> = stub.logs(&external_ref).await.unwrap().collect().await;
        assert_eq!(lines.len(), 2);
    }
}
