//! In-memory implementation of the storage contract
//!
//! Embedded backend for tests and single-node use. Provides the same
//! semantics as the PostgreSQL implementation, including claim exclusivity
//! and lock compare-and-set, using process-local locking.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use spine_core::{
    ids, utc_now, EventType, Execution, ExecutionEvent, ExecutionStatus, NewExecution,
};
use tracing::debug;
use uuid::Uuid;

use crate::dlq::{DeadLetter, DeadLetterStore, DlqStats};
use crate::ledger::{ExecutionFilter, ExecutionLedger};
use crate::locks::LockStore;
use crate::manifest::{ManifestEntry, ManifestStore, NewManifestEntry};
use crate::retention::RetentionStore;
use crate::schedules::{
    NewSchedule, Schedule, ScheduleRun, ScheduleStore, ScheduleUpdate,
};
use crate::store::{Pagination, StoreError};
use crate::workflow_runs::{
    RunStatus, WorkflowRunEvent, WorkflowRunRecord, WorkflowRunStore, WorkflowStepRecord,
};

/// A lease row shared by concurrency locks and schedule locks.
#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    #[allow(dead_code)] // Stored for parity with the durable schema
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// In-memory storage backend.
///
/// # Example
///
/// ```
/// use spine_storage::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    executions: RwLock<HashMap<Uuid, Execution>>,
    events: RwLock<Vec<ExecutionEvent>>,
    claims: RwLock<HashMap<Uuid, String>>,
    locks: RwLock<HashMap<String, Lease>>,
    dead_letters: RwLock<HashMap<Uuid, DeadLetter>>,
    manifest: RwLock<Vec<ManifestEntry>>,
    schedules: RwLock<HashMap<Uuid, Schedule>>,
    schedule_locks: RwLock<HashMap<Uuid, Lease>>,
    schedule_runs: RwLock<Vec<ScheduleRun>>,
    workflow_runs: RwLock<HashMap<Uuid, WorkflowRunRecord>>,
    workflow_steps: RwLock<Vec<WorkflowStepRecord>>,
    workflow_events: RwLock<Vec<WorkflowRunEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            claims: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(HashMap::new()),
            manifest: RwLock::new(Vec::new()),
            schedules: RwLock::new(HashMap::new()),
            schedule_locks: RwLock::new(HashMap::new()),
            schedule_runs: RwLock::new(Vec::new()),
            workflow_runs: RwLock::new(HashMap::new()),
            workflow_steps: RwLock::new(Vec::new()),
            workflow_events: RwLock::new(Vec::new()),
        }
    }

    /// Number of executions currently pending (for tests).
    pub fn pending_count(&self) -> usize {
        self.executions
            .read()
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .count()
    }

    /// Clear all data (for tests).
    pub fn clear(&self) {
        self.executions.write().clear();
        self.events.write().clear();
        self.claims.write().clear();
        self.locks.write().clear();
        self.dead_letters.write().clear();
        self.manifest.write().clear();
        self.schedules.write().clear();
        self.schedule_locks.write().clear();
        self.schedule_runs.write().clear();
        self.workflow_runs.write().clear();
        self.workflow_steps.write().clear();
        self.workflow_events.write().clear();
    }

    /// Append an event with a timestamp no earlier than the previous event
    /// for the same execution, keeping per-execution chronology monotonic.
    fn push_event(
        events: &mut Vec<ExecutionEvent>,
        execution_id: Uuid,
        event_type: EventType,
        data: Value,
    ) -> ExecutionEvent {
        let mut event = ExecutionEvent::new(execution_id, event_type, data);
        if let Some(last) = events
            .iter()
            .rev()
            .find(|e| e.execution_id == execution_id)
        {
            if event.timestamp < last.timestamp {
                event.timestamp = last.timestamp;
            }
        }
        events.push(event.clone());
        event
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionLedger for MemoryStore {
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let mut executions = self.executions.write();

        if let Some(ref key) = new.idempotency_key {
            if let Some(existing) = executions
                .values()
                .find(|e| e.idempotency_key.as_deref() == Some(key.as_str()))
            {
                debug!(idempotency_key = %key, "create_execution deduplicated");
                return Ok(existing.clone());
            }
        }

        let execution = new.into_execution();
        executions.insert(execution.id, execution.clone());

        let mut events = self.events.write();
        Self::push_event(
            &mut events,
            execution.id,
            EventType::Created,
            serde_json::json!({"workflow": execution.workflow}),
        );

        Ok(execution)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.read().get(&id).cloned())
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self
            .executions
            .read()
            .values()
            .find(|e| e.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn find_active_by_logical_key(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .executions
            .read()
            .values()
            .find(|e| {
                e.logical_key.as_deref() == Some(key)
                    && matches!(
                        e.status,
                        ExecutionStatus::Pending | ExecutionStatus::Queued | ExecutionStatus::Running
                    )
            })
            .map(|e| e.id))
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Execution, StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;

        if !execution.status.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: execution.status,
                to: status,
            });
        }

        let now = utc_now();
        execution.status = status;
        match status {
            ExecutionStatus::Running => {
                execution.started_at.get_or_insert(now);
            }
            s if s.is_terminal() => {
                execution.completed_at = Some(now);
                if s == ExecutionStatus::Completed {
                    execution.result = result.clone();
                } else {
                    execution.error = error.clone();
                }
            }
            _ => {}
        }

        let event_type = match status {
            ExecutionStatus::Queued => EventType::Queued,
            ExecutionStatus::Running => EventType::Started,
            ExecutionStatus::Completed => EventType::Completed,
            ExecutionStatus::Failed => EventType::Failed,
            ExecutionStatus::Cancelled => EventType::Cancelled,
            ExecutionStatus::TimedOut => EventType::Failed,
            ExecutionStatus::Pending => EventType::Created,
        };
        let data = match status {
            ExecutionStatus::Completed => result.unwrap_or(Value::Null),
            ExecutionStatus::TimedOut => serde_json::json!({
                "error": error,
                "timed_out": true,
            }),
            _ => error
                .map(|e| serde_json::json!({"error": e}))
                .unwrap_or_else(|| Value::Object(Default::default())),
        };

        let snapshot = execution.clone();
        drop(executions);

        let mut events = self.events.write();
        Self::push_event(&mut events, id, event_type, data);

        Ok(snapshot)
    }

    async fn try_cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;

        if !matches!(
            execution.status,
            ExecutionStatus::Pending | ExecutionStatus::Queued
        ) {
            return Ok(false);
        }

        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(utc_now());
        drop(executions);

        let mut events = self.events.write();
        Self::push_event(
            &mut events,
            id,
            EventType::Cancelled,
            Value::Object(Default::default()),
        );
        Ok(true)
    }

    async fn set_runtime(
        &self,
        id: Uuid,
        runtime: &str,
        external_ref: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;
        execution.runtime = Some(runtime.to_string());
        execution.external_ref = external_ref.map(|s| s.to_string());
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;
        execution.retry_count += 1;
        Ok(execution.retry_count)
    }

    async fn record_event(
        &self,
        execution_id: Uuid,
        event_type: EventType,
        data: Value,
    ) -> Result<ExecutionEvent, StoreError> {
        if !self.executions.read().contains_key(&execution_id) {
            return Err(StoreError::NotFound(format!("execution {execution_id}")));
        }
        let mut events = self.events.write();
        Ok(Self::push_event(&mut events, execution_id, event_type, data))
    }

    async fn get_events(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError> {
        let mut events: Vec<ExecutionEvent> = self
            .events
            .read()
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        page: Pagination,
    ) -> Result<(Vec<Execution>, u64), StoreError> {
        let executions = self.executions.read();
        let mut matching: Vec<Execution> = executions
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.id.cmp(&a.id))
        });

        let total = matching.len() as u64;
        let rows = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();
        Ok((rows, total))
    }

    async fn claim_pending(
        &self,
        worker_id: &str,
        max: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let mut executions = self.executions.write();
        let mut claims = self.claims.write();

        let mut pending: Vec<Uuid> = executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .map(|e| e.id)
            .collect();
        pending.sort_by_key(|id| {
            let e = &executions[id];
            (e.created_at, e.id)
        });

        let now = utc_now();
        let mut claimed = Vec::new();
        for id in pending.into_iter().take(max) {
            if let Some(execution) = executions.get_mut(&id) {
                execution.status = ExecutionStatus::Running;
                execution.started_at = Some(now);
                claims.insert(id, worker_id.to_string());
                claimed.push(execution.clone());
            }
        }

        Ok(claimed)
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = utc_now()
            - chrono::Duration::from_std(threshold)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut executions = self.executions.write();
        let mut claims = self.claims.write();
        let mut reclaimed = Vec::new();

        for execution in executions.values_mut() {
            if execution.status == ExecutionStatus::Running
                && execution.started_at.is_some_and(|t| t < cutoff)
            {
                execution.status = ExecutionStatus::Pending;
                execution.started_at = None;
                claims.remove(&execution.id);
                reclaimed.push(execution.id);
            }
        }
        drop(executions);

        let mut events = self.events.write();
        for id in &reclaimed {
            Self::push_event(
                &mut events,
                *id,
                EventType::Retried,
                serde_json::json!({"reason": "stale_claim"}),
            );
        }

        Ok(reclaimed)
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn acquire(
        &self,
        lock_key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = utc_now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut locks = self.locks.write();
        match locks.get(lock_key) {
            Some(lease) if !lease.is_expired(now) && lease.owner != owner_id => Ok(false),
            _ => {
                locks.insert(
                    lock_key.to_string(),
                    Lease {
                        owner: owner_id.to_string(),
                        acquired_at: now,
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, lock_key: &str, owner_id: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks.write();
        match locks.get(lock_key) {
            Some(lease) if lease.owner == owner_id => {
                locks.remove(lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend(
        &self,
        lock_key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = utc_now();
        let mut locks = self.locks.write();
        match locks.get_mut(lock_key) {
            Some(lease) if lease.owner == owner_id && !lease.is_expired(now) => {
                lease.expires_at = now
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_held(&self, lock_key: &str) -> Result<bool, StoreError> {
        let now = utc_now();
        Ok(self
            .locks
            .read()
            .get(lock_key)
            .is_some_and(|l| !l.is_expired(now)))
    }

    async fn reap_expired(&self) -> Result<u64, StoreError> {
        let now = utc_now();
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|_, lease| !lease.is_expired(now));
        Ok((before - locks.len()) as u64)
    }
}

#[async_trait]
impl DeadLetterStore for MemoryStore {
    async fn add_dead_letter(
        &self,
        execution_id: Uuid,
        workflow: &str,
        params: Value,
        error: &str,
        max_retries: u32,
    ) -> Result<DeadLetter, StoreError> {
        let entry = DeadLetter {
            id: ids::new_execution_id(),
            execution_id,
            workflow: workflow.to_string(),
            params,
            error: error.to_string(),
            retry_count: 0,
            max_retries,
            created_at: utc_now(),
            last_retry_at: None,
            resolved_at: None,
            resolved_by: None,
        };
        self.dead_letters.write().insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError> {
        Ok(self.dead_letters.read().get(&id).cloned())
    }

    async fn list_unresolved(
        &self,
        workflow: Option<&str>,
        page: Pagination,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let mut entries: Vec<DeadLetter> = self
            .dead_letters
            .read()
            .values()
            .filter(|d| d.resolved_at.is_none())
            .filter(|d| workflow.is_none_or(|w| d.workflow == w))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn list_all_dead_letters(
        &self,
        workflow: Option<&str>,
        page: Pagination,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let mut entries: Vec<DeadLetter> = self
            .dead_letters
            .read()
            .values()
            .filter(|d| workflow.is_none_or(|w| d.workflow == w))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn mark_retry_attempted(&self, id: Uuid) -> Result<DeadLetter, StoreError> {
        let mut entries = self.dead_letters.write();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))?;
        entry.retry_count += 1;
        entry.last_retry_at = Some(utc_now());
        Ok(entry.clone())
    }

    async fn resolve_dead_letter(
        &self,
        id: Uuid,
        resolved_by: &str,
        _note: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.dead_letters.write();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))?;
        if entry.resolved_at.is_some() {
            return Ok(false);
        }
        entry.resolved_at = Some(utc_now());
        entry.resolved_by = Some(resolved_by.to_string());
        Ok(true)
    }

    async fn can_retry(&self, id: Uuid) -> Result<bool, StoreError> {
        let entries = self.dead_letters.read();
        let entry = entries
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))?;
        Ok(entry.retry_count < entry.max_retries)
    }

    async fn count_unresolved(&self) -> Result<u64, StoreError> {
        Ok(self
            .dead_letters
            .read()
            .values()
            .filter(|d| d.resolved_at.is_none())
            .count() as u64)
    }

    async fn dlq_stats(&self) -> Result<DlqStats, StoreError> {
        let entries = self.dead_letters.read();
        let total = entries.len() as u64;
        let unresolved = entries.values().filter(|d| d.resolved_at.is_none()).count() as u64;
        let exhausted = entries
            .values()
            .filter(|d| d.retry_count >= d.max_retries)
            .count() as u64;
        let replayable = entries.values().filter(|d| d.is_replayable()).count() as u64;

        let mut by_workflow: HashMap<String, u64> = HashMap::new();
        for entry in entries.values() {
            *by_workflow.entry(entry.workflow.clone()).or_default() += 1;
        }
        let mut by_workflow: Vec<(String, u64)> = by_workflow.into_iter().collect();
        by_workflow.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        Ok(DlqStats {
            total,
            unresolved,
            exhausted,
            replayable,
            by_workflow,
        })
    }
}

#[async_trait]
impl ManifestStore for MemoryStore {
    async fn upsert_manifest_entry(
        &self,
        new: NewManifestEntry,
    ) -> Result<ManifestEntry, StoreError> {
        let mut manifest = self.manifest.write();
        let entry = ManifestEntry {
            domain: new.domain,
            partition_key: new.partition_key,
            stage: new.stage,
            stage_rank: new.stage_rank,
            row_count: new.row_count,
            metrics: new.metrics,
            updated_at: utc_now(),
            superseded_at: None,
        };

        if let Some(existing) = manifest.iter_mut().find(|e| {
            e.domain == entry.domain
                && e.partition_key == entry.partition_key
                && e.stage == entry.stage
        }) {
            *existing = entry.clone();
        } else {
            manifest.push(entry.clone());
        }
        Ok(entry)
    }

    async fn current_manifest_rank(
        &self,
        domain: &str,
        partition_key: &str,
    ) -> Result<Option<i32>, StoreError> {
        Ok(self
            .manifest
            .read()
            .iter()
            .filter(|e| {
                e.domain == domain
                    && e.partition_key == partition_key
                    && e.superseded_at.is_none()
            })
            .map(|e| e.stage_rank)
            .max())
    }

    async fn supersede_manifest_above(
        &self,
        domain: &str,
        partition_key: &str,
        rank: i32,
    ) -> Result<u64, StoreError> {
        let now = utc_now();
        let mut count = 0;
        for entry in self.manifest.write().iter_mut() {
            if entry.domain == domain
                && entry.partition_key == partition_key
                && entry.stage_rank > rank
                && entry.superseded_at.is_none()
            {
                entry.superseded_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_manifest_entries(
        &self,
        domain: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let mut entries: Vec<ManifestEntry> = self
            .manifest
            .read()
            .iter()
            .filter(|e| e.domain == domain)
            .filter(|e| partition_key.is_none_or(|p| e.partition_key == p))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(entries)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule, StoreError> {
        let mut schedules = self.schedules.write();
        if schedules.values().any(|s| s.name == new.name) {
            return Err(StoreError::Conflict(format!(
                "schedule name already exists: {}",
                new.name
            )));
        }

        let schedule = Schedule {
            id: ids::new_execution_id(),
            name: new.name,
            target_type: new.target_type,
            target_name: new.target_name,
            kind: new.kind,
            cron_expression: new.cron_expression,
            interval_seconds: new.interval_seconds,
            timezone: new.timezone,
            enabled: new.enabled,
            last_run_at: None,
            next_run_at: new.next_run_at,
            params_template: new.params_template,
            max_instances: new.max_instances,
            misfire_grace_seconds: new.misfire_grace_seconds,
            version: 1,
        };
        schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError> {
        Ok(self.schedules.read().get(&id).cloned())
    }

    async fn get_schedule_by_name(&self, name: &str) -> Result<Option<Schedule>, StoreError> {
        Ok(self
            .schedules
            .read()
            .values()
            .find(|s| s.name == name)
            .cloned())
    }

    async fn list_schedules(
        &self,
        enabled_only: bool,
        page: Pagination,
    ) -> Result<Vec<Schedule>, StoreError> {
        let mut schedules: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| !enabled_only || s.enabled)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schedules
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn update_schedule(
        &self,
        id: Uuid,
        update: ScheduleUpdate,
    ) -> Result<bool, StoreError> {
        let mut schedules = self.schedules.write();
        let Some(schedule) = schedules.get_mut(&id) else {
            return Ok(false);
        };

        if let Some(expr) = update.cron_expression {
            schedule.cron_expression = Some(expr);
        }
        if let Some(secs) = update.interval_seconds {
            schedule.interval_seconds = Some(secs);
        }
        if let Some(params) = update.params_template {
            schedule.params_template = params;
        }
        if let Some(enabled) = update.enabled {
            schedule.enabled = enabled;
        }
        if let Some(next) = update.next_run_at {
            schedule.next_run_at = Some(next);
        }
        if let Some(grace) = update.misfire_grace_seconds {
            schedule.misfire_grace_seconds = grace;
        }
        schedule.version += 1;
        Ok(true)
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool, StoreError> {
        self.schedule_locks.write().remove(&id);
        Ok(self.schedules.write().remove(&id).is_some())
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let mut due: Vec<Schedule> = self
            .schedules
            .read()
            .values()
            .filter(|s| s.enabled && s.next_run_at.is_some_and(|t| t <= now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn mark_schedule_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut schedules = self.schedules.write();
        let schedule = schedules
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("schedule {id}")))?;
        schedule.last_run_at = Some(last_run_at);
        schedule.next_run_at = next_run_at;
        Ok(())
    }

    async fn try_lock_schedule(
        &self,
        schedule_id: Uuid,
        runner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = utc_now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut locks = self.schedule_locks.write();
        match locks.get(&schedule_id) {
            Some(lease) if !lease.is_expired(now) && lease.owner != runner_id => Ok(false),
            _ => {
                locks.insert(
                    schedule_id,
                    Lease {
                        owner: runner_id.to_string(),
                        acquired_at: now,
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn unlock_schedule(
        &self,
        schedule_id: Uuid,
        runner_id: &str,
    ) -> Result<bool, StoreError> {
        let mut locks = self.schedule_locks.write();
        match locks.get(&schedule_id) {
            Some(lease) if lease.owner == runner_id => {
                locks.remove(&schedule_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_schedule_run(&self, run: ScheduleRun) -> Result<(), StoreError> {
        self.schedule_runs.write().push(run);
        Ok(())
    }

    async fn list_schedule_runs(
        &self,
        schedule_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ScheduleRun>, StoreError> {
        let mut runs: Vec<ScheduleRun> = self
            .schedule_runs
            .read()
            .iter()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        Ok(runs
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }
}

#[async_trait]
impl WorkflowRunStore for MemoryStore {
    async fn create_workflow_run(&self, run: WorkflowRunRecord) -> Result<(), StoreError> {
        self.workflow_runs.write().insert(run.id, run);
        Ok(())
    }

    async fn update_workflow_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut runs = self.workflow_runs.write();
        let run = runs
            .get_mut(&run_id)
            .ok_or_else(|| StoreError::NotFound(format!("workflow run {run_id}")))?;
        run.status = status;
        if completed_at.is_some() {
            run.completed_at = completed_at;
        }
        Ok(())
    }

    async fn get_workflow_run(
        &self,
        run_id: Uuid,
    ) -> Result<Option<WorkflowRunRecord>, StoreError> {
        Ok(self.workflow_runs.read().get(&run_id).cloned())
    }

    async fn list_workflow_runs(
        &self,
        workflow_name: Option<&str>,
        page: Pagination,
    ) -> Result<Vec<WorkflowRunRecord>, StoreError> {
        let mut runs: Vec<WorkflowRunRecord> = self
            .workflow_runs
            .read()
            .values()
            .filter(|r| workflow_name.is_none_or(|w| r.workflow_name == w))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn upsert_workflow_step(&self, step: WorkflowStepRecord) -> Result<(), StoreError> {
        let mut steps = self.workflow_steps.write();
        if let Some(existing) = steps
            .iter_mut()
            .find(|s| s.run_id == step.run_id && s.step_name == step.step_name)
        {
            *existing = step;
        } else {
            steps.push(step);
        }
        Ok(())
    }

    async fn list_workflow_steps(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<WorkflowStepRecord>, StoreError> {
        let mut steps: Vec<WorkflowStepRecord> = self
            .workflow_steps
            .read()
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.sequence_order);
        Ok(steps)
    }

    async fn record_workflow_event(&self, event: WorkflowRunEvent) -> Result<(), StoreError> {
        self.workflow_events.write().push(event);
        Ok(())
    }

    async fn list_workflow_events(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<WorkflowRunEvent>, StoreError> {
        let mut events: Vec<WorkflowRunEvent> = self
            .workflow_events
            .read()
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(events)
    }
}

#[async_trait]
impl RetentionStore for MemoryStore {
    async fn purge_executions(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut executions = self.executions.write();
        let doomed: Vec<Uuid> = executions
            .values()
            .filter(|e| e.status.is_terminal() && e.created_at < cutoff)
            .map(|e| e.id)
            .collect();
        for id in &doomed {
            executions.remove(id);
        }
        drop(executions);

        let doomed_set: std::collections::HashSet<Uuid> = doomed.iter().copied().collect();
        self.events
            .write()
            .retain(|e| !doomed_set.contains(&e.execution_id));

        Ok(doomed.len() as u64)
    }

    async fn purge_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.dead_letters.write();
        let before = entries.len();
        entries.retain(|_, d| !d.resolved_at.is_some_and(|t| t < cutoff));
        Ok((before - entries.len()) as u64)
    }

    async fn purge_schedule_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut runs = self.schedule_runs.write();
        let before = runs.len();
        runs.retain(|r| r.scheduled_at >= cutoff);
        Ok((before - runs.len()) as u64)
    }

    async fn purge_workflow_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut runs = self.workflow_runs.write();
        let doomed: Vec<Uuid> = runs
            .values()
            .filter(|r| {
                r.status.is_terminal() && r.completed_at.is_some_and(|t| t < cutoff)
            })
            .map(|r| r.id)
            .collect();
        for id in &doomed {
            runs.remove(id);
        }
        drop(runs);

        let doomed_set: std::collections::HashSet<Uuid> = doomed.iter().copied().collect();
        self.workflow_steps
            .write()
            .retain(|s| !doomed_set.contains(&s.run_id));
        self.workflow_events
            .write()
            .retain(|e| !doomed_set.contains(&e.run_id));

        Ok(doomed.len() as u64)
    }

    async fn purge_manifest(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut manifest = self.manifest.write();
        let before = manifest.len();
        manifest.retain(|e| !(e.superseded_at.is_some() && e.updated_at < cutoff));
        Ok((before - manifest.len()) as u64)
    }
}
