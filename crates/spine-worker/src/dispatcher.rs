//! Dispatcher and worker loop
//!
//! A background poller claims pending executions atomically (batch bounded
//! by free pool slots) and runs their handlers under a semaphore-bounded
//! pool. The poll interval backs off geometrically while idle and resets
//! when work is found.
//!
//! The dispatcher is the only writer that transitions pending → running.
//! It never retries: failures are terminal here, captured to the dead-letter
//! queue for replay by a higher layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use spine_core::{utc_now, EventType, Execution, ExecutionStatus, SpineError};
use spine_storage::{DeadLetterStore, ExecutionLedger, StoreError};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::registry::{validate_required_params, HandlerRegistry};

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Poll interval when work is available
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Upper bound for the idle backoff
    #[serde(with = "duration_millis")]
    pub max_poll_interval: Duration,

    /// Backoff multiplier applied while idle
    pub backoff_multiplier: f64,

    /// Maximum executions claimed per poll
    pub batch_size: usize,

    /// Maximum concurrent handler invocations
    pub max_concurrency: usize,

    /// How often stale claims are reclaimed
    #[serde(with = "duration_millis")]
    pub stale_reclaim_interval: Duration,

    /// Age at which a running claim is considered stale
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// Graceful shutdown bound
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Max retries recorded on captured dead letters
    pub dlq_max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
            max_concurrency: 10,
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            dlq_max_retries: 3,
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }
}

/// Dispatcher errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("dispatcher is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Per-worker counters.
#[derive(Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    active: AtomicU64,
    last_heartbeat: parking_lot::RwLock<Option<DateTime<Utc>>>,
}

/// Serializable stats snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub completed: u64,
    pub failed: u64,
    pub active: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub max_concurrency: usize,
}

impl WorkerStats {
    fn heartbeat(&self) {
        *self.last_heartbeat.write() = Some(utc_now());
    }
}

/// Parameters and cancellation signal handed to a handler.
#[derive(Clone)]
pub struct HandlerContext {
    pub execution_id: Uuid,
    pub params: Value,
    /// Cooperative cancellation; long handlers should observe it
    pub cancel: CancellationToken,
}

impl HandlerContext {
    /// Context for direct handler tests.
    pub fn for_test(params: Value) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            params,
            cancel: CancellationToken::new(),
        }
    }
}

/// Background worker loop over the execution ledger.
pub struct Dispatcher {
    ledger: Arc<dyn ExecutionLedger>,
    registry: Arc<HandlerRegistry>,
    dlq: Option<Arc<dyn DeadLetterStore>>,
    config: DispatcherConfig,
    stats: Arc<WorkerStats>,
    semaphore: Arc<Semaphore>,
    cancel_tokens: Arc<DashMap<Uuid, CancellationToken>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    poll_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    reclaim_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<dyn ExecutionLedger>,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            ledger,
            registry,
            dlq: None,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            stats: Arc::new(WorkerStats::default()),
            cancel_tokens: Arc::new(DashMap::new()),
            shutdown_tx,
            shutdown_rx,
            poll_handle: parking_lot::Mutex::new(None),
            reclaim_handle: parking_lot::Mutex::new(None),
        }
    }

    /// Capture terminal failures into the dead-letter queue.
    pub fn with_dead_letters(mut self, dlq: Arc<dyn DeadLetterStore>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.stats.processed.load(Ordering::SeqCst),
            completed: self.stats.completed.load(Ordering::SeqCst),
            failed: self.stats.failed.load(Ordering::SeqCst),
            active: self.stats.active.load(Ordering::SeqCst),
            last_heartbeat: *self.stats.last_heartbeat.read(),
            max_concurrency: self.config.max_concurrency,
        }
    }

    /// Start the poll and reclaim loops.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        if self.poll_handle.lock().is_some() {
            return Err(WorkerError::AlreadyRunning);
        }

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            "dispatcher starting"
        );

        let poll_worker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut interval = poll_worker.config.poll_interval;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let claimed = match poll_worker.poll_once().await {
                    Ok(count) => count,
                    Err(e) => {
                        error!(error = %e, "poll failed");
                        0
                    }
                };

                // Adaptive backoff: reset on work, grow while idle.
                if claimed > 0 {
                    interval = poll_worker.config.poll_interval;
                } else {
                    interval = Duration::from_secs_f64(
                        (interval.as_secs_f64() * poll_worker.config.backoff_multiplier)
                            .min(poll_worker.config.max_poll_interval.as_secs_f64()),
                    );
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("dispatcher poll loop exited");
        });
        *self.poll_handle.lock() = Some(handle);

        let reclaim_worker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reclaim_worker.config.stale_reclaim_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match reclaim_worker
                            .ledger
                            .reclaim_stale(reclaim_worker.config.stale_threshold)
                            .await
                        {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                info!(count = reclaimed.len(), "reclaimed stale executions");
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "stale reclamation failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("dispatcher reclaim loop exited");
        });
        *self.reclaim_handle.lock() = Some(handle);

        Ok(())
    }

    /// Stop the loops, letting in-flight handlers finish.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.semaphore.available_permits() == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("dispatcher shutdown timed out with handlers in flight");
                return Err(WorkerError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Some(handle) = self.poll_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.reclaim_handle.lock().take() {
            handle.abort();
        }

        info!(worker_id = %self.config.worker_id, "dispatcher stopped");
        Ok(())
    }

    /// One poll cycle: claim up to `batch_size` pending executions, bounded
    /// by free pool slots, and spawn their handlers. Returns the number
    /// claimed. Public so tests and embedded callers can drive the loop
    /// deterministically.
    pub async fn poll_once(self: &Arc<Self>) -> Result<usize, WorkerError> {
        self.stats.heartbeat();

        let free = self.semaphore.available_permits();
        if free == 0 {
            return Ok(0);
        }

        let batch = self.config.batch_size.min(free);
        let claimed = self
            .ledger
            .claim_pending(&self.config.worker_id, batch)
            .await?;
        let count = claimed.len();

        for execution in claimed {
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // Pool filled while claiming: return the row to pending
                    // via stale reclamation rather than blocking the poll.
                    warn!(execution_id = %execution.id, "no pool slot for claimed execution");
                    break;
                }
            };

            let worker = Arc::clone(self);
            self.stats.active.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                worker.execute_claimed(execution).await;
                worker.stats.active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        Ok(count)
    }

    /// Run one claimed execution to a terminal state.
    async fn execute_claimed(&self, execution: Execution) {
        let execution_id = execution.id;
        self.stats.processed.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = self
            .ledger
            .record_event(
                execution_id,
                EventType::Started,
                serde_json::json!({"worker_id": self.config.worker_id}),
            )
            .await
        {
            error!(execution_id = %execution_id, error = %e, "failed to record started event");
        }

        let cancel = CancellationToken::new();
        self.cancel_tokens.insert(execution_id, cancel.clone());

        let outcome = self.invoke_handler(&execution, cancel).await;
        self.cancel_tokens.remove(&execution_id);

        match outcome {
            Ok(result) => {
                self.stats.completed.fetch_add(1, Ordering::SeqCst);
                match self
                    .ledger
                    .update_status(execution_id, ExecutionStatus::Completed, Some(result), None)
                    .await
                {
                    Ok(_) => {
                        debug!(execution_id = %execution_id, "execution completed");
                    }
                    Err(StoreError::IllegalTransition { from, .. })
                        if from == ExecutionStatus::Cancelled =>
                    {
                        // Cancelled while running: the result is discarded.
                        debug!(execution_id = %execution_id, "result discarded, execution cancelled");
                    }
                    Err(e) => {
                        error!(execution_id = %execution_id, error = %e, "failed to record completion");
                    }
                }
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!(execution_id = %execution_id, error = %err, "execution failed");

                if let Err(e) = self
                    .ledger
                    .update_status(
                        execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(err.to_string()),
                    )
                    .await
                {
                    if !matches!(e, StoreError::IllegalTransition { from, .. } if from == ExecutionStatus::Cancelled)
                    {
                        error!(execution_id = %execution_id, error = %e, "failed to record failure");
                    }
                    return;
                }

                if let Some(ref dlq) = self.dlq {
                    if let Err(e) = dlq
                        .add_dead_letter(
                            execution_id,
                            &execution.workflow,
                            execution.params.clone(),
                            &err.to_string(),
                            self.config.dlq_max_retries,
                        )
                        .await
                    {
                        error!(execution_id = %execution_id, error = %e, "failed to capture dead letter");
                    }
                }
            }
        }
    }

    async fn invoke_handler(
        &self,
        execution: &Execution,
        cancel: CancellationToken,
    ) -> Result<Value, SpineError> {
        let (handler, required) = self.registry.resolve(&execution.workflow)?;
        validate_required_params(&required, &execution.params)?;

        handler(HandlerContext {
            execution_id: execution.id,
            params: execution.params.clone(),
            cancel,
        })
        .await
    }

    /// Cancel an execution.
    ///
    /// Pending/queued rows flip to `cancelled` atomically; running handlers
    /// receive the cooperative signal through their context token.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool, WorkerError> {
        if self.ledger.try_cancel(execution_id).await? {
            return Ok(true);
        }
        if let Some(token) = self.cancel_tokens.get(&execution_id) {
            token.cancel();
            return Ok(true);
        }
        Ok(false)
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
    use serde_json::json;
    use spine_core::{NewExecution, OperationKind};
    use spine_storage::MemoryStore;

    fn setup() -> (Arc<Dispatcher>, Arc<MemoryStore>, Arc<HandlerRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(HandlerRegistry::new());

        registry.register(OperationKind::Task, "echo", |ctx: HandlerContext| async move {
            Ok(json!({"echoed": ctx.params}))
        });
        registry.register(OperationKind::Task, "fail", |_ctx| async {
            Err(SpineError::internal("intentional failure"))
        });
        registry.register(OperationKind::Task, "slow", |ctx: HandlerContext| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(json!({"done": true})),
                _ = ctx.cancel.cancelled() => {
                    Err(SpineError::internal("cancelled cooperatively").with_retryable(false))
                }
            }
        });

        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&store) as Arc<dyn ExecutionLedger>,
                Arc::clone(&registry),
                DispatcherConfig::new()
                    .with_worker_id("test-worker")
                    .with_max_concurrency(2)
                    .with_batch_size(5),
            )
            .with_dead_letters(Arc::clone(&store) as Arc<dyn DeadLetterStore>),
        );
        (dispatcher, store, registry)
    }

    async fn wait_status(
        store: &MemoryStore,
        id: Uuid,
        expected: ExecutionStatus,
    ) -> Execution {
        for _ in 0..200 {
            let execution = store.get_execution(id).await.unwrap().unwrap();
            if execution.status == expected {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution never reached {expected}");
    }

    #[tokio::test]
    async fn test_claim_and_complete() {
        let (dispatcher, store, _registry) = setup();
        let execution = store
            .create_execution(NewExecution::new("task:echo", json!({"msg": "hi"})))
            .await
            .unwrap();

        let claimed = dispatcher.poll_once().await.unwrap();
        assert_eq!(claimed, 1);

        let done = wait_status(&store, execution.id, ExecutionStatus::Completed).await;
        assert_eq!(done.result, Some(json!({"echoed": {"msg": "hi"}})));

        let events = store.get_events(execution.id).await.unwrap();
        let types: Vec<String> = events.iter().map(|e| e.event_type.to_string()).collect();
        assert_eq!(types, vec!["created", "started", "completed"]);
    }

    #[tokio::test]
    async fn test_failed_handler_marks_failed_and_dead_letters() {
        let (dispatcher, store, _registry) = setup();
        let execution = store
            .create_execution(NewExecution::new("task:fail", json!({})))
            .await
            .unwrap();

        dispatcher.poll_once().await.unwrap();
        let done = wait_status(&store, execution.id, ExecutionStatus::Failed).await;
        assert!(done.error.unwrap().contains("intentional failure"));

        // Captured for replay
        for _ in 0..100 {
            if store.count_unresolved().await.unwrap() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dead letter never captured");
    }

    #[tokio::test]
    async fn test_missing_handler_fails_gracefully() {
        let (dispatcher, store, _registry) = setup();
        let execution = store
            .create_execution(NewExecution::new("task:nonexistent", json!({})))
            .await
            .unwrap();

        dispatcher.poll_once().await.unwrap();
        let done = wait_status(&store, execution.id, ExecutionStatus::Failed).await;
        assert!(done.error.unwrap().contains("no handler registered"));
    }

    #[tokio::test]
    async fn test_unknown_kind_fails() {
        let (dispatcher, store, _registry) = setup();
        // Bypass parsing at submit time to exercise the dispatcher path
        let execution = store
            .create_execution(NewExecution::new("job:echo", json!({})))
            .await
            .unwrap();

        dispatcher.poll_once().await.unwrap();
        let done = wait_status(&store, execution.id, ExecutionStatus::Failed).await;
        assert!(done.error.unwrap().contains("unknown operation kind"));
    }

    #[tokio::test]
    async fn test_batch_bounded_by_concurrency() {
        let (dispatcher, store, _registry) = setup();
        for _ in 0..5 {
            store
                .create_execution(NewExecution::new("task:slow", json!({})))
                .await
                .unwrap();
        }

        // max_concurrency = 2, so a single poll claims at most 2
        let claimed = dispatcher.poll_once().await.unwrap();
        assert_eq!(claimed, 2);
        assert_eq!(store.pending_count(), 3);

        // Pool is saturated: next poll claims nothing
        tokio::time::sleep(Duration::from_millis(50)).await;
        let claimed = dispatcher.poll_once().await.unwrap();
        assert_eq!(claimed, 0);
    }

    #[tokio::test]
    async fn test_cooperative_cancellation() {
        let (dispatcher, store, _registry) = setup();
        let execution = store
            .create_execution(NewExecution::new("task:slow", json!({})))
            .await
            .unwrap();

        dispatcher.poll_once().await.unwrap();
        wait_status(&store, execution.id, ExecutionStatus::Running).await;

        assert!(dispatcher.cancel(execution.id).await.unwrap());
        let done = wait_status(&store, execution.id, ExecutionStatus::Failed).await;
        assert!(done.error.unwrap().contains("cancelled cooperatively"));
    }

    #[tokio::test]
    async fn test_cancel_pending_is_atomic() {
        let (dispatcher, store, _registry) = setup();
        let execution = store
            .create_execution(NewExecution::new("task:echo", json!({})))
            .await
            .unwrap();

        assert!(dispatcher.cancel(execution.id).await.unwrap());
        // Nothing left to claim
        assert_eq!(dispatcher.poll_once().await.unwrap(), 0);
        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stats_track_outcomes() {
        let (dispatcher, store, _registry) = setup();
        let ok = store
            .create_execution(NewExecution::new("task:echo", json!({})))
            .await
            .unwrap();
        let bad = store
            .create_execution(NewExecution::new("task:fail", json!({})))
            .await
            .unwrap();

        dispatcher.poll_once().await.unwrap();
        wait_status(&store, ok.id, ExecutionStatus::Completed).await;
        wait_status(&store, bad.id, ExecutionStatus::Failed).await;

        let stats = dispatcher.stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert!(stats.last_heartbeat.is_some());
        assert_eq!(stats.max_concurrency, 2);
    }

    #[tokio::test]
    async fn test_start_and_stop_loop() {
        let (dispatcher, store, _registry) = setup();
        dispatcher.start().unwrap();
        assert!(matches!(
            dispatcher.start(),
            Err(WorkerError::AlreadyRunning)
        ));

        let execution = store
            .create_execution(NewExecution::new("task:echo", json!({"n": 1})))
            .await
            .unwrap();

        wait_status(&store, execution.id, ExecutionStatus::Completed).await;
        dispatcher.stop().await.unwrap();
    }
}
