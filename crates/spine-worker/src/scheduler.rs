//! Scheduler
//!
//! Tick loop over the schedule table. Each tick claims due schedules
//! through per-schedule locks (at-most-one active instance, cluster-wide),
//! applies misfire handling, emits executions into the ledger, and
//! recomputes `next_run_at`.
//!
//! Misfire rule: slots whose lateness exceeds the grace window are skipped
//! with an audit row; the most recent slot still inside the window emits
//! exactly one run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spine_core::{ids, utc_now, NewExecution, OperationKind, TriggerSource};
use spine_storage::{
    ExecutionLedger, Schedule, ScheduleKind, ScheduleRun, ScheduleRunStatus, ScheduleStore,
    ScheduleUpdate,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cron::compute_next_run;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Unique runner ID used for schedule locks
    pub runner_id: String,

    /// Tick cadence
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// TTL on per-schedule locks
    #[serde(with = "duration_millis")]
    pub lock_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            runner_id: format!("scheduler-{}", Uuid::now_v7()),
            tick_interval: Duration::from_secs(5),
            lock_ttl: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner_id(mut self, id: impl Into<String>) -> Self {
        self.runner_id = id.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

/// Tick counters.
#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    triggered: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Serializable scheduler statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub tick_count: u64,
    pub schedules_triggered: u64,
    pub schedules_skipped: u64,
    pub schedules_failed: u64,
}

/// Background scheduler emitting executions from due schedules.
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    ledger: Arc<dyn ExecutionLedger>,
    config: SchedulerConfig,
    counters: Counters,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tick_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        ledger: Arc<dyn ExecutionLedger>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            ledger,
            config,
            counters: Counters::default(),
            shutdown_tx,
            shutdown_rx,
            tick_handle: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.tick_handle.lock().is_some()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tick_count: self.counters.ticks.load(Ordering::SeqCst),
            schedules_triggered: self.counters.triggered.load(Ordering::SeqCst),
            schedules_skipped: self.counters.skipped.load(Ordering::SeqCst),
            schedules_failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.ticks.store(0, Ordering::SeqCst);
        self.counters.triggered.store(0, Ordering::SeqCst);
        self.counters.skipped.store(0, Ordering::SeqCst);
        self.counters.failed.store(0, Ordering::SeqCst);
    }

    /// Start the tick loop. Double start is ignored.
    #[instrument(skip(self), fields(runner_id = %self.config.runner_id))]
    pub fn start(self: &Arc<Self>) {
        let mut handle_slot = self.tick_handle.lock();
        if handle_slot.is_some() {
            return;
        }

        info!(
            runner_id = %self.config.runner_id,
            tick_interval_ms = self.config.tick_interval.as_millis(),
            "scheduler starting"
        );

        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.tick_once(utc_now()).await {
                            error!(error = %e, "scheduler tick failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("scheduler tick loop exited");
        });
        *handle_slot = Some(handle);
    }

    /// Stop the tick loop. Safe to call when not running.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.tick_handle.lock().take() {
            handle.abort();
            info!(runner_id = %self.config.runner_id, "scheduler stopped");
        }
    }

    /// One tick at the given instant. Public so tests can drive time
    /// deterministically.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<(), spine_storage::StoreError> {
        self.counters.ticks.fetch_add(1, Ordering::SeqCst);

        let due = self.store.list_due_schedules(now).await?;
        for schedule in due {
            if !self
                .store
                .try_lock_schedule(schedule.id, &self.config.runner_id, self.config.lock_ttl)
                .await?
            {
                debug!(schedule = %schedule.name, "schedule locked by another runner");
                continue;
            }

            if let Err(e) = self.process_due(&schedule, now).await {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(schedule = %schedule.name, error = %e, "schedule processing failed");
                let _ = self
                    .store
                    .record_schedule_run(ScheduleRun {
                        id: ids::new_event_id(),
                        schedule_id: schedule.id,
                        schedule_name: schedule.name.clone(),
                        scheduled_at: schedule.next_run_at.unwrap_or(now),
                        status: ScheduleRunStatus::Failed,
                        reason: Some(e.to_string()),
                        triggered_execution_id: None,
                    })
                    .await;
            }

            let _ = self
                .store
                .unlock_schedule(schedule.id, &self.config.runner_id)
                .await;
        }

        Ok(())
    }

    /// Walk the due slots of one claimed schedule: skip slots past the
    /// grace window, emit the most recent slot inside it, and advance
    /// `next_run_at` to the first future slot.
    async fn process_due(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<(), spine_storage::StoreError> {
        let grace = chrono::Duration::seconds(schedule.misfire_grace_seconds as i64);
        let mut slot = schedule.next_run_at.unwrap_or(now);
        let mut missed_slots = 0u64;
        let mut last_missed = None;
        let mut emit_slot = None;

        while slot <= now {
            if now - slot > grace {
                missed_slots += 1;
                last_missed = Some(slot);
            } else {
                // Later in-grace slots supersede earlier ones; at most one
                // run is emitted per tick.
                emit_slot = Some(slot);
            }

            match compute_next_run(schedule, slot) {
                Ok(Some(next)) if next > slot => slot = next,
                Ok(_) => break,
                Err(e) => {
                    return Err(spine_storage::StoreError::Serialization(e.to_string()));
                }
            }
        }

        if missed_slots > 0 {
            self.counters
                .skipped
                .fetch_add(missed_slots, Ordering::SeqCst);
            warn!(
                schedule = %schedule.name,
                missed_slots,
                "misfire: slots past grace window skipped"
            );
            self.store
                .record_schedule_run(ScheduleRun {
                    id: ids::new_event_id(),
                    schedule_id: schedule.id,
                    schedule_name: schedule.name.clone(),
                    scheduled_at: last_missed.unwrap_or(now),
                    status: ScheduleRunStatus::Skipped,
                    reason: Some(format!("misfire: {missed_slots} slot(s) past grace window")),
                    triggered_execution_id: None,
                })
                .await?;
        }

        let next_run_at = if slot > now { Some(slot) } else { None };

        if let Some(scheduled_at) = emit_slot {
            let execution_id = self.emit(schedule, scheduled_at).await?;
            self.counters.triggered.fetch_add(1, Ordering::SeqCst);
            self.store
                .record_schedule_run(ScheduleRun {
                    id: ids::new_event_id(),
                    schedule_id: schedule.id,
                    schedule_name: schedule.name.clone(),
                    scheduled_at,
                    status: ScheduleRunStatus::Triggered,
                    reason: None,
                    triggered_execution_id: Some(execution_id),
                })
                .await?;
            self.store
                .mark_schedule_run(schedule.id, now, next_run_at)
                .await?;
        } else {
            // Misfire-only tick: advance the clock without recording a run
            self.store
                .update_schedule(
                    schedule.id,
                    ScheduleUpdate {
                        next_run_at,
                        ..Default::default()
                    },
                )
                .await?;
        }

        // One-shot schedules disable themselves after their slot passes
        if schedule.kind == ScheduleKind::OneShot {
            self.store
                .update_schedule(
                    schedule.id,
                    ScheduleUpdate {
                        enabled: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// Create the ledger row for a triggered schedule.
    async fn emit(
        &self,
        schedule: &Schedule,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Uuid, spine_storage::StoreError> {
        let workflow = match schedule.target_type {
            OperationKind::Task => format!("task:{}", schedule.target_name),
            OperationKind::Workflow => format!("workflow:{}", schedule.target_name),
        };

        let execution = self
            .ledger
            .create_execution(
                NewExecution::new(workflow, schedule.params_template.clone())
                    .with_lane("scheduled")
                    .with_trigger(TriggerSource::Schedule)
                    .with_idempotency_key(format!(
                        "schedule:{}:{}",
                        schedule.id,
                        scheduled_at.timestamp()
                    )),
            )
            .await?;

        info!(
            schedule = %schedule.name,
            execution_id = %execution.id,
            %scheduled_at,
            "schedule triggered"
        );
        Ok(execution.id)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use spine_core::ExecutionStatus;
    use spine_storage::{ExecutionFilter, MemoryStore, NewSchedule, Pagination};

    fn setup() -> (Scheduler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(
            Arc::clone(&store) as Arc<dyn ScheduleStore>,
            Arc::clone(&store) as Arc<dyn ExecutionLedger>,
            SchedulerConfig::new().with_runner_id("test-runner"),
        );
        (scheduler, store)
    }

    #[tokio::test]
    async fn test_due_schedule_emits_execution() {
        let (scheduler, store) = setup();
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 10).unwrap();

        store
            .create_schedule(
                NewSchedule::cron("five-minutely", OperationKind::Task, "ingest", "*/5 * * * *")
                    .with_params(json!({"tier": "T1"}))
                    .with_next_run_at(Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 0).unwrap()),
            )
            .await
            .unwrap();

        scheduler.tick_once(now).await.unwrap();

        let (executions, total) = store
            .list_executions(ExecutionFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(executions[0].workflow, "task:ingest");
        assert_eq!(executions[0].trigger_source, spine_core::TriggerSource::Schedule);
        assert_eq!(executions[0].params, json!({"tier": "T1"}));
        assert_eq!(executions[0].status, ExecutionStatus::Pending);

        let schedule = store
            .get_schedule_by_name("five-minutely")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(schedule.last_run_at, Some(now));
        assert_eq!(
            schedule.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 2, 12, 5, 0).unwrap())
        );
        assert_eq!(scheduler.stats().schedules_triggered, 1);
    }

    #[tokio::test]
    async fn test_misfire_skips_old_slot_emits_recent() {
        let (scheduler, store) = setup();
        // Cron */5, grace 60s; next_run_at points 10 minutes back.
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 12, 10, 30).unwrap();
        let stale = Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 0).unwrap();

        let schedule = store
            .create_schedule(
                NewSchedule::cron("laggy", OperationKind::Task, "ingest", "*/5 * * * *")
                    .with_misfire_grace(Duration::from_secs(60))
                    .with_next_run_at(stale),
            )
            .await
            .unwrap();

        scheduler.tick_once(now).await.unwrap();

        // 12:00 and 12:05 are past grace; 12:10 is 30s late and emits.
        let (_, total) = store
            .list_executions(ExecutionFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(total, 1);

        let runs = store
            .list_schedule_runs(schedule.id, Pagination::default())
            .await
            .unwrap();
        let skipped: Vec<_> = runs
            .iter()
            .filter(|r| r.status == ScheduleRunStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].reason.as_ref().unwrap().contains("misfire"));

        let triggered: Vec<_> = runs
            .iter()
            .filter(|r| r.status == ScheduleRunStatus::Triggered)
            .collect();
        assert_eq!(triggered.len(), 1);
        assert_eq!(
            triggered[0].scheduled_at,
            Utc.with_ymd_and_hms(2026, 1, 2, 12, 10, 0).unwrap()
        );

        let updated = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(
            updated.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 2, 12, 15, 0).unwrap())
        );
        assert_eq!(scheduler.stats().schedules_skipped, 2);
    }

    #[tokio::test]
    async fn test_all_slots_past_grace_only_skips() {
        let (scheduler, store) = setup();
        // Daily schedule whose slot passed 3 hours ago with 60s grace
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap();
        let slot = Utc.with_ymd_and_hms(2026, 1, 2, 6, 0, 0).unwrap();

        let schedule = store
            .create_schedule(
                NewSchedule::cron("daily", OperationKind::Task, "refresh", "0 6 * * *")
                    .with_misfire_grace(Duration::from_secs(60))
                    .with_next_run_at(slot),
            )
            .await
            .unwrap();

        scheduler.tick_once(now).await.unwrap();

        let (_, total) = store
            .list_executions(ExecutionFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(total, 0);

        let updated = store.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(
            updated.next_run_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 3, 6, 0, 0).unwrap())
        );
        // last_run_at untouched on a misfire-only tick
        assert!(updated.last_run_at.is_none());
    }

    #[tokio::test]
    async fn test_disabled_schedules_ignored() {
        let (scheduler, store) = setup();
        let now = utc_now();
        store
            .create_schedule(
                NewSchedule::cron("off", OperationKind::Task, "ingest", "*/5 * * * *")
                    .with_enabled(false)
                    .with_next_run_at(now - chrono::Duration::seconds(10)),
            )
            .await
            .unwrap();

        scheduler.tick_once(now).await.unwrap();
        let (_, total) = store
            .list_executions(ExecutionFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_schedule_lock_prevents_double_fire() {
        let (scheduler, store) = setup();
        let now = utc_now();

        let schedule = store
            .create_schedule(
                NewSchedule::interval(
                    "tick",
                    OperationKind::Task,
                    "ingest",
                    Duration::from_secs(300),
                )
                .with_next_run_at(now - chrono::Duration::seconds(5)),
            )
            .await
            .unwrap();

        // Another runner holds the lock
        assert!(store
            .try_lock_schedule(schedule.id, "other-runner", Duration::from_secs(60))
            .await
            .unwrap());

        scheduler.tick_once(now).await.unwrap();
        let (_, total) = store
            .list_executions(ExecutionFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_workflow_target_identifier() {
        let (scheduler, store) = setup();
        let now = utc_now();

        store
            .create_schedule(
                NewSchedule::interval(
                    "wf",
                    OperationKind::Workflow,
                    "daily_refresh",
                    Duration::from_secs(3600),
                )
                .with_next_run_at(now - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();

        scheduler.tick_once(now).await.unwrap();
        let (executions, _) = store
            .list_executions(ExecutionFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(executions[0].workflow, "workflow:daily_refresh");
    }

    #[tokio::test]
    async fn test_emit_is_idempotent_per_slot() {
        let (scheduler, store) = setup();
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 10).unwrap();
        let slot = Utc.with_ymd_and_hms(2026, 1, 2, 12, 0, 0).unwrap();

        let schedule = store
            .create_schedule(
                NewSchedule::cron("dup", OperationKind::Task, "ingest", "*/5 * * * *")
                    .with_next_run_at(slot),
            )
            .await
            .unwrap();

        scheduler.tick_once(now).await.unwrap();
        // Simulate a crashed runner that never advanced next_run_at
        store
            .update_schedule(
                schedule.id,
                ScheduleUpdate {
                    next_run_at: Some(slot),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        scheduler.tick_once(now).await.unwrap();

        // The slot-scoped idempotency key deduplicates the second emit
        let (_, total) = store
            .list_executions(ExecutionFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
    }
}
