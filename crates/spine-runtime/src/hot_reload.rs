//! Hot-reload adapter wrapper
//!
//! Wraps another adapter plus a configuration source. Before each delegated
//! operation, if the poll interval has elapsed, the wrapper fetches the
//! latest configuration and rebuilds its inner adapter through a factory
//! when the config hash changed. The swap is atomic with respect to the next
//! call: in-flight operations keep the adapter snapshot they started with.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use spine_core::spec_hash;
use tracing::info;

use crate::adapter::{
    LogStream, RuntimeAdapter, RuntimeCapabilities, RuntimeConstraints, RuntimeHealth,
};
use crate::error::JobError;
use crate::spec::{ContainerJobSpec, JobStatus};

/// Builds an adapter from a configuration payload.
pub type AdapterFactory = Arc<dyn Fn(&Value) -> Arc<dyn RuntimeAdapter> + Send + Sync>;

/// Returns the latest configuration payload.
pub type ConfigSource = Arc<dyn Fn() -> Value + Send + Sync>;

/// Wrapper configuration.
#[derive(Debug, Clone)]
pub struct HotReloadConfig {
    /// Minimum time between configuration checks
    pub check_interval: Duration,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
        }
    }
}

struct ConfigState {
    config: Value,
    hash: String,
}

/// Adapter wrapper that rebuilds its inner adapter on config change.
pub struct HotReloadAdapter {
    name: String,
    inner: RwLock<Arc<dyn RuntimeAdapter>>,
    factory: AdapterFactory,
    source: Option<ConfigSource>,
    state: Mutex<ConfigState>,
    last_check: Mutex<Option<Instant>>,
    config: HotReloadConfig,
    reload_count: AtomicU64,
}

impl HotReloadAdapter {
    pub fn new(
        initial_config: Value,
        factory: AdapterFactory,
        source: Option<ConfigSource>,
        config: HotReloadConfig,
    ) -> Self {
        let inner = factory(&initial_config);
        let hash = spec_hash(&initial_config);
        Self {
            name: inner.name().to_string(),
            inner: RwLock::new(inner),
            factory,
            source,
            state: Mutex::new(ConfigState {
                config: initial_config,
                hash,
            }),
            last_check: Mutex::new(None),
            config,
            reload_count: AtomicU64::new(0),
        }
    }

    /// Number of reloads performed so far.
    pub fn reload_count(&self) -> u64 {
        self.reload_count.load(Ordering::SeqCst)
    }

    /// Current configuration snapshot.
    pub fn current_config(&self) -> Value {
        self.state.lock().config.clone()
    }

    /// Apply a new configuration explicitly, rebuilding on change.
    pub fn update_config(&self, new_config: Value) {
        self.apply(new_config);
    }

    fn apply(&self, new_config: Value) {
        let new_hash = spec_hash(&new_config);
        let mut state = self.state.lock();
        if state.hash == new_hash {
            return;
        }

        let new_inner = (self.factory)(&new_config);
        state.config = new_config;
        state.hash = new_hash;
        // Swap under the state lock so readers never observe a half-applied
        // config/adapter pair.
        *self.inner.write() = new_inner;
        self.reload_count.fetch_add(1, Ordering::SeqCst);
        info!(runtime = %self.name, "hot-reloaded runtime adapter");
    }

    /// Poll the config source if the interval elapsed, then snapshot the
    /// current inner adapter for one delegated call.
    fn snapshot(&self) -> Arc<dyn RuntimeAdapter> {
        if let Some(ref source) = self.source {
            let due = {
                let mut last = self.last_check.lock();
                match *last {
                    Some(at) if at.elapsed() < self.config.check_interval => false,
                    _ => {
                        *last = Some(Instant::now());
                        true
                    }
                }
            };
            if due {
                self.apply(source());
            }
        }
        Arc::clone(&self.inner.read())
    }
}

#[async_trait]
impl RuntimeAdapter for HotReloadAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        self.inner.read().capabilities()
    }

    fn constraints(&self) -> RuntimeConstraints {
        self.inner.read().constraints()
    }

    async fn submit(&self, spec: &ContainerJobSpec) -> Result<String, JobError> {
        self.snapshot().submit(spec).await
    }

    async fn status(&self, external_ref: &str) -> Result<JobStatus, JobError> {
        self.snapshot().status(external_ref).await
    }

    async fn cancel(&self, external_ref: &str) -> Result<bool, JobError> {
        self.snapshot().cancel(external_ref).await
    }

    async fn logs(&self, external_ref: &str) -> Result<LogStream, JobError> {
        self.snapshot().logs(external_ref).await
    }

    async fn cleanup(&self, external_ref: &str) -> Result<(), JobError> {
        self.snapshot().cleanup(external_ref).await
    }

    async fn health(&self) -> RuntimeHealth {
        self.snapshot().health().await
    }
}
