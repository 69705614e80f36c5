//! Circuit breakers around runtime adapter calls
//!
//! One breaker per runtime name, placed at the adapter call site so a bad
//! runtime cannot deny traffic to healthy ones.
//!
//! ```text
//! ┌─────────┐  failure threshold  ┌─────────┐  recovery timeout  ┌──────────┐
//! │ Closed  │ ──────────────────► │  Open   │ ─────────────────► │ HalfOpen │
//! └─────────┘                     └─────────┘                    └──────────┘
//!      ▲                               ▲          any failure         │
//!      │        success threshold      └──────────────────────────────┤
//!      └──────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, all calls allowed
    Closed,
    /// Failure threshold exceeded, calls denied
    Open,
    /// Probing recovery, limited calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Consecutive successes in half-open required to close
    pub success_threshold: u32,

    /// Time to wait before allowing a half-open probe
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

/// Three-state failure gate.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call may proceed. The first allowed call after the recovery
    /// timeout transitions the breaker to half-open.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    info!(breaker = %self.name, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    info!(breaker = %self.name, "circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }
}

/// Name-indexed breaker registry.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Fetch or create the breaker for a name.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(&b))
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
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

    fn breaker(failures: u32, successes: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::new()
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_recovery_timeout(recovery),
        )
    }

    #[test]
    fn test_opens_at_threshold() {
        let b = breaker(3, 1, Duration::from_secs(60));

        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.try_acquire());

        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.try_acquire());
    }

    #[test]
    fn test_success_resets_closed_counter() {
        let b = breaker(3, 1, Duration::from_secs(60));

        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        // Still below threshold after the reset
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_cycle() {
        let b = breaker(1, 2, Duration::ZERO);

        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);

        // Recovery timeout elapsed: first acquire transitions to half-open
        assert!(b.try_acquire());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        // One success is below the threshold of two
        b.record_success();
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let b = breaker(1, 2, Duration::ZERO);

        b.record_failure();
        assert!(b.try_acquire());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_indexes_by_name() {
        let registry = BreakerRegistry::default();
        let a = registry.get_or_create("k8s");
        let b = registry.get_or_create("k8s");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("local").is_none());
    }
}
