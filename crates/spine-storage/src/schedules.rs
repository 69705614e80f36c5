//! Schedule storage contract
//!
//! Declarative triggers (cron, interval, one-off) with at-most-one-active-
//! instance enforcement through per-schedule locks. Every tick outcome is
//! recorded as a `ScheduleRun` audit row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spine_core::OperationKind;
use uuid::Uuid;

use crate::store::{Pagination, StoreError};

/// How a schedule computes its run times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// 5-field cron expression with named timezone
    Cron,
    /// Fixed interval in seconds
    Interval,
    /// Fires once at `next_run_at`, then disables itself
    OneShot,
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cron => write!(f, "cron"),
            Self::Interval => write!(f, "interval"),
            Self::OneShot => write!(f, "one_shot"),
        }
    }
}

/// A declarative trigger definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub target_type: OperationKind,
    pub target_name: String,
    pub kind: ScheduleKind,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<u64>,
    pub timezone: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub params_template: Value,
    pub max_instances: u32,
    pub misfire_grace_seconds: u64,
    pub version: u32,
}

/// Parameters for creating a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub target_type: OperationKind,
    pub target_name: String,
    pub kind: ScheduleKind,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<u64>,
    pub timezone: String,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub params_template: Value,
    pub max_instances: u32,
    pub misfire_grace_seconds: u64,
}

impl NewSchedule {
    /// Cron schedule with UTC timezone and sensible defaults.
    pub fn cron(
        name: impl Into<String>,
        target_type: OperationKind,
        target_name: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target_type,
            target_name: target_name.into(),
            kind: ScheduleKind::Cron,
            cron_expression: Some(expression.into()),
            interval_seconds: None,
            timezone: "UTC".to_string(),
            enabled: true,
            next_run_at: None,
            params_template: Value::Object(Default::default()),
            max_instances: 1,
            misfire_grace_seconds: 60,
        }
    }

    /// Interval schedule.
    pub fn interval(
        name: impl Into<String>,
        target_type: OperationKind,
        target_name: impl Into<String>,
        every: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            target_type,
            target_name: target_name.into(),
            kind: ScheduleKind::Interval,
            cron_expression: None,
            interval_seconds: Some(every.as_secs().max(1)),
            timezone: "UTC".to_string(),
            enabled: true,
            next_run_at: None,
            params_template: Value::Object(Default::default()),
            max_instances: 1,
            misfire_grace_seconds: 60,
        }
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    pub fn with_params(mut self, template: Value) -> Self {
        self.params_template = template;
        self
    }

    pub fn with_misfire_grace(mut self, grace: Duration) -> Self {
        self.misfire_grace_seconds = grace.as_secs();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }
}

/// Partial update for a schedule.
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<u64>,
    pub params_template: Option<Value>,
    pub enabled: Option<bool>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub misfire_grace_seconds: Option<u64>,
}

/// Outcome of one scheduler tick for a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRunStatus {
    /// An execution was emitted
    Triggered,
    /// The slot was skipped (misfire past the grace window)
    Skipped,
    /// Submission failed
    Failed,
}

/// Audit row for one tick outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub schedule_name: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: ScheduleRunStatus,
    pub reason: Option<String>,
    pub triggered_execution_id: Option<Uuid>,
}

/// Store for schedules, schedule locks, and run audit rows.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    /// Create a schedule. Names are unique.
    async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule, StoreError>;

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError>;

    async fn get_schedule_by_name(&self, name: &str) -> Result<Option<Schedule>, StoreError>;

    /// List schedules ordered by name; optionally only enabled ones.
    async fn list_schedules(
        &self,
        enabled_only: bool,
        page: Pagination,
    ) -> Result<Vec<Schedule>, StoreError>;

    /// Apply a partial update, bumping `version`. Returns false when the
    /// schedule does not exist.
    async fn update_schedule(&self, id: Uuid, update: ScheduleUpdate)
        -> Result<bool, StoreError>;

    async fn delete_schedule(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Enabled schedules whose `next_run_at <= now`, soonest first.
    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError>;

    /// Record a completed tick: stamps `last_run_at` and the recomputed
    /// `next_run_at`.
    async fn mark_schedule_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Acquire the per-schedule instance lock (same semantics as the
    /// concurrency guard: conditional insert, expired leases lose).
    async fn try_lock_schedule(
        &self,
        schedule_id: Uuid,
        runner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release the per-schedule lock. Only the holder may release.
    async fn unlock_schedule(&self, schedule_id: Uuid, runner_id: &str)
        -> Result<bool, StoreError>;

    /// Append a tick audit row.
    async fn record_schedule_run(&self, run: ScheduleRun) -> Result<(), StoreError>;

    /// Audit rows for a schedule, newest first.
    async fn list_schedule_runs(
        &self,
        schedule_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ScheduleRun>, StoreError>;
}
