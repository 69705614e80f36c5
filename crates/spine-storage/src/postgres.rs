//! PostgreSQL implementation of the storage contract
//!
//! Production persistence with:
//! - atomic claim via `FOR UPDATE SKIP LOCKED`
//! - lock compare-and-set via conditional upsert
//! - create/status writes transactional with their lifecycle events

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use spine_core::{
    ids, utc_now, EventType, Execution, ExecutionEvent, ExecutionStatus, NewExecution,
    OperationKind,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::dlq::{DeadLetter, DeadLetterStore, DlqStats};
use crate::ledger::{ExecutionFilter, ExecutionLedger};
use crate::locks::LockStore;
use crate::manifest::{ManifestEntry, ManifestStore, NewManifestEntry};
use crate::retention::RetentionStore;
use crate::schedules::{
    NewSchedule, Schedule, ScheduleKind, ScheduleRun, ScheduleRunStatus, ScheduleStore,
    ScheduleUpdate,
};
use crate::store::{Pagination, StoreError};
use crate::workflow_runs::{
    RunStatus, StepStatus, WorkflowRunEvent, WorkflowRunRecord, WorkflowRunStore,
    WorkflowStepRecord,
};

/// PostgreSQL storage backend.
///
/// # Example
///
/// ```ignore
/// use spine_storage::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/spine").await?;
/// let store = PostgresStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn parse_status(s: &str) -> Result<ExecutionStatus, StoreError> {
    s.parse().map_err(StoreError::Serialization)
}

fn parse_kind(s: &str) -> Result<OperationKind, StoreError> {
    match s {
        "task" => Ok(OperationKind::Task),
        "workflow" => Ok(OperationKind::Workflow),
        other => Err(StoreError::Serialization(format!(
            "unknown target type: {other}"
        ))),
    }
}

fn parse_schedule_kind(s: &str) -> Result<ScheduleKind, StoreError> {
    match s {
        "cron" => Ok(ScheduleKind::Cron),
        "interval" => Ok(ScheduleKind::Interval),
        "one_shot" => Ok(ScheduleKind::OneShot),
        other => Err(StoreError::Serialization(format!(
            "unknown schedule kind: {other}"
        ))),
    }
}

fn parse_run_status(s: &str) -> Result<RunStatus, StoreError> {
    match s {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        "partial" => Ok(RunStatus::Partial),
        other => Err(StoreError::Serialization(format!(
            "unknown run status: {other}"
        ))),
    }
}

fn parse_step_status(s: &str) -> Result<StepStatus, StoreError> {
    match s {
        "pending" => Ok(StepStatus::Pending),
        "running" => Ok(StepStatus::Running),
        "completed" => Ok(StepStatus::Completed),
        "failed" => Ok(StepStatus::Failed),
        "skipped" => Ok(StepStatus::Skipped),
        other => Err(StoreError::Serialization(format!(
            "unknown step status: {other}"
        ))),
    }
}

fn schedule_run_status_str(s: ScheduleRunStatus) -> &'static str {
    match s {
        ScheduleRunStatus::Triggered => "triggered",
        ScheduleRunStatus::Skipped => "skipped",
        ScheduleRunStatus::Failed => "failed",
    }
}

fn parse_schedule_run_status(s: &str) -> Result<ScheduleRunStatus, StoreError> {
    match s {
        "triggered" => Ok(ScheduleRunStatus::Triggered),
        "skipped" => Ok(ScheduleRunStatus::Skipped),
        "failed" => Ok(ScheduleRunStatus::Failed),
        other => Err(StoreError::Serialization(format!(
            "unknown schedule run status: {other}"
        ))),
    }
}

fn execution_from_row(row: &PgRow) -> Result<Execution, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let trigger: String = row.try_get("trigger_source").map_err(db_err)?;

    Ok(Execution {
        id: row.try_get("id").map_err(db_err)?,
        workflow: row.try_get("workflow").map_err(db_err)?,
        params: row.try_get("params").map_err(db_err)?,
        lane: row.try_get("lane").map_err(db_err)?,
        trigger_source: trigger.parse().map_err(StoreError::Serialization)?,
        logical_key: row.try_get("logical_key").map_err(db_err)?,
        status: parse_status(&status)?,
        parent_execution_id: row.try_get("parent_execution_id").map_err(db_err)?,
        runtime: row.try_get("runtime").map_err(db_err)?,
        external_ref: row.try_get("external_ref").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        result: row.try_get("result").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(db_err)? as u32,
        idempotency_key: row.try_get("idempotency_key").map_err(db_err)?,
    })
}

fn event_from_row(row: &PgRow) -> Result<ExecutionEvent, StoreError> {
    let event_type: String = row.try_get("event_type").map_err(db_err)?;
    Ok(ExecutionEvent {
        id: row.try_get("id").map_err(db_err)?,
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        event_type: EventType::from(event_type.as_str()),
        timestamp: row.try_get("timestamp").map_err(db_err)?,
        data: row.try_get("data").map_err(db_err)?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetter, StoreError> {
    Ok(DeadLetter {
        id: row.try_get("id").map_err(db_err)?,
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        workflow: row.try_get("workflow").map_err(db_err)?,
        params: row.try_get("params").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(db_err)? as u32,
        max_retries: row.try_get::<i32, _>("max_retries").map_err(db_err)? as u32,
        created_at: row.try_get("created_at").map_err(db_err)?,
        last_retry_at: row.try_get("last_retry_at").map_err(db_err)?,
        resolved_at: row.try_get("resolved_at").map_err(db_err)?,
        resolved_by: row.try_get("resolved_by").map_err(db_err)?,
    })
}

fn manifest_from_row(row: &PgRow) -> Result<ManifestEntry, StoreError> {
    Ok(ManifestEntry {
        domain: row.try_get("domain").map_err(db_err)?,
        partition_key: row.try_get("partition_key").map_err(db_err)?,
        stage: row.try_get("stage").map_err(db_err)?,
        stage_rank: row.try_get("stage_rank").map_err(db_err)?,
        row_count: row
            .try_get::<Option<i64>, _>("row_count")
            .map_err(db_err)?
            .map(|v| v as u64),
        metrics: row.try_get("metrics").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        superseded_at: row.try_get("superseded_at").map_err(db_err)?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule, StoreError> {
    let target_type: String = row.try_get("target_type").map_err(db_err)?;
    let kind: String = row.try_get("kind").map_err(db_err)?;

    Ok(Schedule {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        target_type: parse_kind(&target_type)?,
        target_name: row.try_get("target_name").map_err(db_err)?,
        kind: parse_schedule_kind(&kind)?,
        cron_expression: row.try_get("cron_expression").map_err(db_err)?,
        interval_seconds: row
            .try_get::<Option<i64>, _>("interval_seconds")
            .map_err(db_err)?
            .map(|v| v as u64),
        timezone: row.try_get("timezone").map_err(db_err)?,
        enabled: row.try_get("enabled").map_err(db_err)?,
        last_run_at: row.try_get("last_run_at").map_err(db_err)?,
        next_run_at: row.try_get("next_run_at").map_err(db_err)?,
        params_template: row.try_get("params_template").map_err(db_err)?,
        max_instances: row.try_get::<i32, _>("max_instances").map_err(db_err)? as u32,
        misfire_grace_seconds: row
            .try_get::<i64, _>("misfire_grace_seconds")
            .map_err(db_err)? as u64,
        version: row.try_get::<i32, _>("version").map_err(db_err)? as u32,
    })
}

fn expiry(ttl: Duration) -> Result<DateTime<Utc>, StoreError> {
    chrono::Duration::from_std(ttl)
        .map(|d| utc_now() + d)
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

#[async_trait]
impl ExecutionLedger for PostgresStore {
    #[instrument(skip(self, new), fields(workflow = %new.workflow))]
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        if let Some(ref key) = new.idempotency_key {
            if let Some(existing) = self.get_by_idempotency_key(key).await? {
                debug!(idempotency_key = %key, "create_execution deduplicated");
                return Ok(existing);
            }
        }

        let execution = new.into_execution();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO spine_executions
                (id, workflow, params, lane, trigger_source, logical_key, status,
                 parent_execution_id, created_at, retry_count, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, 0, $9)
            "#,
        )
        .bind(execution.id)
        .bind(&execution.workflow)
        .bind(&execution.params)
        .bind(&execution.lane)
        .bind(execution.trigger_source.to_string())
        .bind(&execution.logical_key)
        .bind(execution.parent_execution_id)
        .bind(execution.created_at)
        .bind(&execution.idempotency_key)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            // Lost an idempotency race: return the winner's row.
            if is_unique_violation(&e) {
                if let Some(ref key) = execution.idempotency_key {
                    drop(tx);
                    if let Some(existing) = self.get_by_idempotency_key(key).await? {
                        return Ok(existing);
                    }
                }
            }
            error!("failed to create execution: {e}");
            return Err(db_err(e));
        }

        sqlx::query(
            r#"
            INSERT INTO spine_execution_events (id, execution_id, event_type, timestamp, data)
            VALUES ($1, $2, 'created', $3, $4)
            "#,
        )
        .bind(ids::new_event_id())
        .bind(execution.id)
        .bind(execution.created_at)
        .bind(serde_json::json!({"workflow": execution.workflow}))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(execution_id = %execution.id, "created execution");
        Ok(execution)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query("SELECT * FROM spine_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn get_by_idempotency_key(&self, key: &str) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query("SELECT * FROM spine_executions WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn find_active_by_logical_key(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM spine_executions
            WHERE logical_key = $1
              AND status IN ('pending', 'queued', 'running')
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| r.get("id")))
    }

    #[instrument(skip(self, result, error))]
    async fn update_status(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<Execution, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT status FROM spine_executions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;

        let current = parse_status(&row.get::<String, _>("status"))?;
        if !current.can_transition_to(status) {
            return Err(StoreError::IllegalTransition {
                from: current,
                to: status,
            });
        }

        let updated = if status == ExecutionStatus::Running {
            sqlx::query(
                r#"
                UPDATE spine_executions
                SET status = $2, started_at = COALESCE(started_at, now())
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(status.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
        } else if status.is_terminal() {
            sqlx::query(
                r#"
                UPDATE spine_executions
                SET status = $2, completed_at = now(), result = $3, error = $4
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(status.to_string())
            .bind(if status == ExecutionStatus::Completed {
                result.clone()
            } else {
                None
            })
            .bind(if status == ExecutionStatus::Completed {
                None
            } else {
                error.clone()
            })
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
        } else {
            sqlx::query(
                "UPDATE spine_executions SET status = $2 WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .bind(status.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
        };

        let event_type = match status {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "started",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Failed | ExecutionStatus::TimedOut => "failed",
            ExecutionStatus::Pending => "created",
        };
        let data = match status {
            ExecutionStatus::Completed => result.unwrap_or(Value::Null),
            ExecutionStatus::TimedOut => serde_json::json!({"error": error, "timed_out": true}),
            _ => error
                .map(|e| serde_json::json!({"error": e}))
                .unwrap_or_else(|| Value::Object(Default::default())),
        };

        sqlx::query(
            r#"
            INSERT INTO spine_execution_events (id, execution_id, event_type, timestamp, data)
            VALUES ($1, $2, $3, now(), $4)
            "#,
        )
        .bind(ids::new_event_id())
        .bind(id)
        .bind(event_type)
        .bind(data)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(execution_id = %id, status = %status, "updated execution status");
        execution_from_row(&updated)
    }

    async fn try_cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            UPDATE spine_executions
            SET status = 'cancelled', completed_at = now()
            WHERE id = $1 AND status IN ('pending', 'queued')
            RETURNING id
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if row.is_none() {
            // Distinguish missing from already-running
            let exists = sqlx::query("SELECT 1 FROM spine_executions WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("execution {id}")));
            }
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO spine_execution_events (id, execution_id, event_type, timestamp, data)
            VALUES ($1, $2, 'cancelled', now(), '{}')
            "#,
        )
        .bind(ids::new_event_id())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn set_runtime(
        &self,
        id: Uuid,
        runtime: &str,
        external_ref: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE spine_executions SET runtime = $2, external_ref = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(runtime)
        .bind(external_ref)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("execution {id}")));
        }
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE spine_executions
            SET retry_count = retry_count + 1
            WHERE id = $1
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;

        Ok(row.get::<i32, _>("retry_count") as u32)
    }

    async fn record_event(
        &self,
        execution_id: Uuid,
        event_type: EventType,
        data: Value,
    ) -> Result<ExecutionEvent, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO spine_execution_events (id, execution_id, event_type, timestamp, data)
            VALUES ($1, $2, $3, now(), $4)
            RETURNING *
            "#,
        )
        .bind(ids::new_event_id())
        .bind(execution_id)
        .bind(event_type.as_str())
        .bind(data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23503")) {
                StoreError::NotFound(format!("execution {execution_id}"))
            } else {
                db_err(e)
            }
        })?;

        event_from_row(&row)
    }

    async fn get_events(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM spine_execution_events
            WHERE execution_id = $1
            ORDER BY timestamp, id
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
        page: Pagination,
    ) -> Result<(Vec<Execution>, u64), StoreError> {
        fn apply_filter<'a>(
            qb: &mut QueryBuilder<'a, sqlx::Postgres>,
            filter: &'a ExecutionFilter,
        ) {
            if let Some(ref workflow) = filter.workflow {
                qb.push(" AND workflow = ").push_bind(workflow);
            }
            if let Some(status) = filter.status {
                qb.push(" AND status = ").push_bind(status.to_string());
            }
            if let Some(ref lane) = filter.lane {
                qb.push(" AND lane = ").push_bind(lane);
            }
            if let Some(trigger) = filter.trigger_source {
                qb.push(" AND trigger_source = ").push_bind(trigger.to_string());
            }
            if let Some(parent) = filter.parent_execution_id {
                qb.push(" AND parent_execution_id = ").push_bind(parent);
            }
            if let Some(after) = filter.created_after {
                qb.push(" AND created_at >= ").push_bind(after);
            }
            if let Some(before) = filter.created_before {
                qb.push(" AND created_at < ").push_bind(before);
            }
        }

        let mut count_qb = QueryBuilder::new("SELECT COUNT(*) FROM spine_executions WHERE 1=1");
        apply_filter(&mut count_qb, &filter);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .get(0);

        let mut qb = QueryBuilder::new("SELECT * FROM spine_executions WHERE 1=1");
        apply_filter(&mut qb, &filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let executions = rows
            .iter()
            .map(execution_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((executions, total as u64))
    }

    #[instrument(skip(self))]
    async fn claim_pending(
        &self,
        worker_id: &str,
        max: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        // SKIP LOCKED keeps concurrent claimers' result sets disjoint without
        // serializing them on row locks.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM spine_executions
                WHERE status = 'pending'
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE spine_executions e
            SET status = 'running', started_at = now(), claimed_by = $2
            FROM claimable c
            WHERE e.id = c.id
            RETURNING e.*
            "#,
        )
        .bind(max as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let claimed = rows
            .iter()
            .map(execution_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if !claimed.is_empty() {
            debug!(count = claimed.len(), worker_id, "claimed executions");
        }
        Ok(claimed)
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = utc_now()
            - chrono::Duration::from_std(threshold)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query(
            r#"
            UPDATE spine_executions
            SET status = 'pending', started_at = NULL, claimed_by = NULL
            WHERE status = 'running' AND started_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let reclaimed: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        for id in &reclaimed {
            sqlx::query(
                r#"
                INSERT INTO spine_execution_events (id, execution_id, event_type, timestamp, data)
                VALUES ($1, $2, 'retried', now(), '{"reason": "stale_claim"}')
                "#,
            )
            .bind(ids::new_event_id())
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(reclaimed)
    }
}

#[async_trait]
impl LockStore for PostgresStore {
    async fn acquire(
        &self,
        lock_key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = expiry(ttl)?;

        // Conditional upsert: the insert wins an empty slot, the DO UPDATE
        // only fires when the prior lease expired or we already hold it.
        let row = sqlx::query(
            r#"
            INSERT INTO spine_concurrency_locks (lock_key, owner_id, acquired_at, expires_at)
            VALUES ($1, $2, now(), $3)
            ON CONFLICT (lock_key) DO UPDATE
            SET owner_id = EXCLUDED.owner_id,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE spine_concurrency_locks.expires_at <= now()
               OR spine_concurrency_locks.owner_id = EXCLUDED.owner_id
            RETURNING lock_key
            "#,
        )
        .bind(lock_key)
        .bind(owner_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    async fn release(&self, lock_key: &str, owner_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM spine_concurrency_locks WHERE lock_key = $1 AND owner_id = $2",
        )
        .bind(lock_key)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn extend(
        &self,
        lock_key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = expiry(ttl)?;
        let result = sqlx::query(
            r#"
            UPDATE spine_concurrency_locks
            SET expires_at = $3
            WHERE lock_key = $1 AND owner_id = $2 AND expires_at > now()
            "#,
        )
        .bind(lock_key)
        .bind(owner_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_held(&self, lock_key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM spine_concurrency_locks WHERE lock_key = $1 AND expires_at > now()",
        )
        .bind(lock_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn reap_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM spine_concurrency_locks WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DeadLetterStore for PostgresStore {
    async fn add_dead_letter(
        &self,
        execution_id: Uuid,
        workflow: &str,
        params: Value,
        error: &str,
        max_retries: u32,
    ) -> Result<DeadLetter, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO spine_dead_letters
                (id, execution_id, workflow, params, error, retry_count, max_retries, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, now())
            RETURNING *
            "#,
        )
        .bind(ids::new_execution_id())
        .bind(execution_id)
        .bind(workflow)
        .bind(params)
        .bind(error)
        .bind(max_retries as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        dead_letter_from_row(&row)
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetter>, StoreError> {
        let row = sqlx::query("SELECT * FROM spine_dead_letters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn list_unresolved(
        &self,
        workflow: Option<&str>,
        page: Pagination,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let mut qb =
            QueryBuilder::new("SELECT * FROM spine_dead_letters WHERE resolved_at IS NULL");
        if let Some(workflow) = workflow {
            qb.push(" AND workflow = ").push_bind(workflow);
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn list_all_dead_letters(
        &self,
        workflow: Option<&str>,
        page: Pagination,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT * FROM spine_dead_letters WHERE 1=1");
        if let Some(workflow) = workflow {
            qb.push(" AND workflow = ").push_bind(workflow);
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn mark_retry_attempted(&self, id: Uuid) -> Result<DeadLetter, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE spine_dead_letters
            SET retry_count = retry_count + 1, last_retry_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))?;

        dead_letter_from_row(&row)
    }

    async fn resolve_dead_letter(
        &self,
        id: Uuid,
        resolved_by: &str,
        _note: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE spine_dead_letters
            SET resolved_at = now(), resolved_by = $2
            WHERE id = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(id)
        .bind(resolved_by)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn can_retry(&self, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT retry_count < max_retries AS can_retry FROM spine_dead_letters WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))?;
        Ok(row.get("can_retry"))
    }

    async fn count_unresolved(&self) -> Result<u64, StoreError> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM spine_dead_letters WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn dlq_stats(&self) -> Result<DlqStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE resolved_at IS NULL) AS unresolved,
                COUNT(*) FILTER (WHERE retry_count >= max_retries) AS exhausted,
                COUNT(*) FILTER (WHERE retry_count < max_retries AND resolved_at IS NULL)
                    AS replayable
            FROM spine_dead_letters
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let by_workflow_rows = sqlx::query(
            r#"
            SELECT workflow, COUNT(*) AS n
            FROM spine_dead_letters
            GROUP BY workflow
            ORDER BY n DESC, workflow
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(DlqStats {
            total: row.get::<i64, _>("total") as u64,
            unresolved: row.get::<i64, _>("unresolved") as u64,
            exhausted: row.get::<i64, _>("exhausted") as u64,
            replayable: row.get::<i64, _>("replayable") as u64,
            by_workflow: by_workflow_rows
                .iter()
                .map(|r| (r.get("workflow"), r.get::<i64, _>("n") as u64))
                .collect(),
        })
    }
}

#[async_trait]
impl ManifestStore for PostgresStore {
    async fn upsert_manifest_entry(
        &self,
        entry: NewManifestEntry,
    ) -> Result<ManifestEntry, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO spine_manifest
                (domain, partition_key, stage, stage_rank, row_count, metrics, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (domain, partition_key, stage) DO UPDATE
            SET stage_rank = EXCLUDED.stage_rank,
                row_count = EXCLUDED.row_count,
                metrics = EXCLUDED.metrics,
                updated_at = now(),
                superseded_at = NULL
            RETURNING *
            "#,
        )
        .bind(&entry.domain)
        .bind(&entry.partition_key)
        .bind(&entry.stage)
        .bind(entry.stage_rank)
        .bind(entry.row_count.map(|v| v as i64))
        .bind(&entry.metrics)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        manifest_from_row(&row)
    }

    async fn current_manifest_rank(
        &self,
        domain: &str,
        partition_key: &str,
    ) -> Result<Option<i32>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(stage_rank) AS rank
            FROM spine_manifest
            WHERE domain = $1 AND partition_key = $2 AND superseded_at IS NULL
            "#,
        )
        .bind(domain)
        .bind(partition_key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get("rank"))
    }

    async fn supersede_manifest_above(
        &self,
        domain: &str,
        partition_key: &str,
        rank: i32,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE spine_manifest
            SET superseded_at = now()
            WHERE domain = $1 AND partition_key = $2 AND stage_rank > $3
              AND superseded_at IS NULL
            "#,
        )
        .bind(domain)
        .bind(partition_key)
        .bind(rank)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn list_manifest_entries(
        &self,
        domain: &str,
        partition_key: Option<&str>,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT * FROM spine_manifest WHERE domain = ");
        qb.push_bind(domain);
        if let Some(partition) = partition_key {
            qb.push(" AND partition_key = ").push_bind(partition);
        }
        qb.push(" ORDER BY updated_at DESC");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(manifest_from_row).collect()
    }
}

#[async_trait]
impl ScheduleStore for PostgresStore {
    async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO spine_schedules
                (id, name, target_type, target_name, kind, cron_expression, interval_seconds,
                 timezone, enabled, next_run_at, params_template, max_instances,
                 misfire_grace_seconds, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 1)
            RETURNING *
            "#,
        )
        .bind(ids::new_execution_id())
        .bind(&new.name)
        .bind(new.target_type.to_string())
        .bind(&new.target_name)
        .bind(new.kind.to_string())
        .bind(&new.cron_expression)
        .bind(new.interval_seconds.map(|v| v as i64))
        .bind(&new.timezone)
        .bind(new.enabled)
        .bind(new.next_run_at)
        .bind(&new.params_template)
        .bind(new.max_instances as i32)
        .bind(new.misfire_grace_seconds as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!("schedule name already exists: {}", new.name))
            } else {
                db_err(e)
            }
        })?;

        schedule_from_row(&row)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query("SELECT * FROM spine_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn get_schedule_by_name(&self, name: &str) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query("SELECT * FROM spine_schedules WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(schedule_from_row).transpose()
    }

    async fn list_schedules(
        &self,
        enabled_only: bool,
        page: Pagination,
    ) -> Result<Vec<Schedule>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT * FROM spine_schedules WHERE 1=1");
        if enabled_only {
            qb.push(" AND enabled");
        }
        qb.push(" ORDER BY name LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn update_schedule(
        &self,
        id: Uuid,
        update: ScheduleUpdate,
    ) -> Result<bool, StoreError> {
        let mut qb = QueryBuilder::new("UPDATE spine_schedules SET version = version + 1");
        if let Some(ref expr) = update.cron_expression {
            qb.push(", cron_expression = ").push_bind(expr);
        }
        if let Some(secs) = update.interval_seconds {
            qb.push(", interval_seconds = ").push_bind(secs as i64);
        }
        if let Some(ref params) = update.params_template {
            qb.push(", params_template = ").push_bind(params);
        }
        if let Some(enabled) = update.enabled {
            qb.push(", enabled = ").push_bind(enabled);
        }
        if let Some(next) = update.next_run_at {
            qb.push(", next_run_at = ").push_bind(next);
        }
        if let Some(grace) = update.misfire_grace_seconds {
            qb.push(", misfire_grace_seconds = ").push_bind(grace as i64);
        }
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&self.pool).await.map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool, StoreError> {
        sqlx::query("DELETE FROM spine_schedule_locks WHERE schedule_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        let result = sqlx::query("DELETE FROM spine_schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM spine_schedules
            WHERE enabled AND next_run_at IS NOT NULL AND next_run_at <= $1
            ORDER BY next_run_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn mark_schedule_run(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE spine_schedules SET last_run_at = $2, next_run_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    async fn try_lock_schedule(
        &self,
        schedule_id: Uuid,
        runner_id: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires_at = expiry(ttl)?;
        let row = sqlx::query(
            r#"
            INSERT INTO spine_schedule_locks (schedule_id, locked_by, locked_at, expires_at)
            VALUES ($1, $2, now(), $3)
            ON CONFLICT (schedule_id) DO UPDATE
            SET locked_by = EXCLUDED.locked_by,
                locked_at = EXCLUDED.locked_at,
                expires_at = EXCLUDED.expires_at
            WHERE spine_schedule_locks.expires_at <= now()
               OR spine_schedule_locks.locked_by = EXCLUDED.locked_by
            RETURNING schedule_id
            "#,
        )
        .bind(schedule_id)
        .bind(runner_id)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn unlock_schedule(
        &self,
        schedule_id: Uuid,
        runner_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM spine_schedule_locks WHERE schedule_id = $1 AND locked_by = $2",
        )
        .bind(schedule_id)
        .bind(runner_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_schedule_run(&self, run: ScheduleRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO spine_schedule_runs
                (id, schedule_id, schedule_name, scheduled_at, status, reason,
                 triggered_execution_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.id)
        .bind(run.schedule_id)
        .bind(&run.schedule_name)
        .bind(run.scheduled_at)
        .bind(schedule_run_status_str(run.status))
        .bind(&run.reason)
        .bind(run.triggered_execution_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_schedule_runs(
        &self,
        schedule_id: Uuid,
        page: Pagination,
    ) -> Result<Vec<ScheduleRun>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM spine_schedule_runs
            WHERE schedule_id = $1
            ORDER BY scheduled_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(schedule_id)
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(db_err)?;
                Ok(ScheduleRun {
                    id: row.try_get("id").map_err(db_err)?,
                    schedule_id: row.try_get("schedule_id").map_err(db_err)?,
                    schedule_name: row.try_get("schedule_name").map_err(db_err)?,
                    scheduled_at: row.try_get("scheduled_at").map_err(db_err)?,
                    status: parse_schedule_run_status(&status)?,
                    reason: row.try_get("reason").map_err(db_err)?,
                    triggered_execution_id: row
                        .try_get("triggered_execution_id")
                        .map_err(db_err)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl WorkflowRunStore for PostgresStore {
    async fn create_workflow_run(&self, run: WorkflowRunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO spine_workflow_runs
                (id, workflow_name, domain, status, trigger, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.id)
        .bind(&run.workflow_name)
        .bind(&run.domain)
        .bind(run.status.to_string())
        .bind(&run.trigger)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_workflow_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE spine_workflow_runs
            SET status = $2, completed_at = COALESCE($3, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.to_string())
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("workflow run {run_id}")));
        }
        Ok(())
    }

    async fn get_workflow_run(
        &self,
        run_id: Uuid,
    ) -> Result<Option<WorkflowRunRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM spine_workflow_runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|row| {
            let status: String = row.try_get("status").map_err(db_err)?;
            Ok(WorkflowRunRecord {
                id: row.try_get("id").map_err(db_err)?,
                workflow_name: row.try_get("workflow_name").map_err(db_err)?,
                domain: row.try_get("domain").map_err(db_err)?,
                status: parse_run_status(&status)?,
                trigger: row.try_get("trigger").map_err(db_err)?,
                started_at: row.try_get("started_at").map_err(db_err)?,
                completed_at: row.try_get("completed_at").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn list_workflow_runs(
        &self,
        workflow_name: Option<&str>,
        page: Pagination,
    ) -> Result<Vec<WorkflowRunRecord>, StoreError> {
        let mut qb = QueryBuilder::new("SELECT * FROM spine_workflow_runs WHERE 1=1");
        if let Some(name) = workflow_name {
            qb.push(" AND workflow_name = ").push_bind(name);
        }
        qb.push(" ORDER BY started_at DESC LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(db_err)?;
                Ok(WorkflowRunRecord {
                    id: row.try_get("id").map_err(db_err)?,
                    workflow_name: row.try_get("workflow_name").map_err(db_err)?,
                    domain: row.try_get("domain").map_err(db_err)?,
                    status: parse_run_status(&status)?,
                    trigger: row.try_get("trigger").map_err(db_err)?,
                    started_at: row.try_get("started_at").map_err(db_err)?,
                    completed_at: row.try_get("completed_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn upsert_workflow_step(&self, step: WorkflowStepRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO spine_workflow_steps
                (id, run_id, step_name, step_type, sequence_order, status, attempt_count,
                 started_at, completed_at, error, output)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (run_id, step_name) DO UPDATE
            SET status = EXCLUDED.status,
                attempt_count = EXCLUDED.attempt_count,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                error = EXCLUDED.error,
                output = EXCLUDED.output
            "#,
        )
        .bind(step.id)
        .bind(step.run_id)
        .bind(&step.step_name)
        .bind(&step.step_type)
        .bind(step.sequence_order as i32)
        .bind(step.status.to_string())
        .bind(step.attempt_count as i32)
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(&step.error)
        .bind(&step.output)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_workflow_steps(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<WorkflowStepRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM spine_workflow_steps WHERE run_id = $1 ORDER BY sequence_order",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status").map_err(db_err)?;
                Ok(WorkflowStepRecord {
                    id: row.try_get("id").map_err(db_err)?,
                    run_id: row.try_get("run_id").map_err(db_err)?,
                    step_name: row.try_get("step_name").map_err(db_err)?,
                    step_type: row.try_get("step_type").map_err(db_err)?,
                    sequence_order: row.try_get::<i32, _>("sequence_order").map_err(db_err)?
                        as u32,
                    status: parse_step_status(&status)?,
                    attempt_count: row.try_get::<i32, _>("attempt_count").map_err(db_err)?
                        as u32,
                    started_at: row.try_get("started_at").map_err(db_err)?,
                    completed_at: row.try_get("completed_at").map_err(db_err)?,
                    error: row.try_get("error").map_err(db_err)?,
                    output: row.try_get("output").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn record_workflow_event(&self, event: WorkflowRunEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO spine_workflow_events
                (id, run_id, step_name, event_type, timestamp, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.run_id)
        .bind(&event.step_name)
        .bind(&event.event_type)
        .bind(event.timestamp)
        .bind(&event.data)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_workflow_events(
        &self,
        run_id: Uuid,
    ) -> Result<Vec<WorkflowRunEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM spine_workflow_events WHERE run_id = $1 ORDER BY timestamp, id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(WorkflowRunEvent {
                    id: row.try_get("id").map_err(db_err)?,
                    run_id: row.try_get("run_id").map_err(db_err)?,
                    step_name: row.try_get("step_name").map_err(db_err)?,
                    event_type: row.try_get("event_type").map_err(db_err)?,
                    timestamp: row.try_get("timestamp").map_err(db_err)?,
                    data: row.try_get("data").map_err(db_err)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RetentionStore for PostgresStore {
    async fn purge_executions(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM spine_executions
            WHERE created_at < $1
              AND status IN ('completed', 'failed', 'cancelled', 'timed_out')
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn purge_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM spine_dead_letters WHERE resolved_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn purge_schedule_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM spine_schedule_runs WHERE scheduled_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn purge_workflow_runs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM spine_workflow_runs
            WHERE completed_at < $1
              AND status IN ('completed', 'failed', 'cancelled', 'partial')
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn purge_manifest(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM spine_manifest WHERE superseded_at IS NOT NULL AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
