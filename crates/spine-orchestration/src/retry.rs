//! Per-step retry policy
//!
//! Exponential backoff with jitter to avoid thundering-herd retries. All
//! automated retry in the system lives here and in DLQ replay; the
//! dispatcher never retries on its own.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy attached to a workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Multiplier applied per retry (2.0 = exponential doubling)
    pub backoff_multiplier: f64,

    /// Cap on any single delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Jitter factor in [0, 1]; 0.1 means ±10%
    pub jitter: f64,
}

impl Default for StepRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl StepRetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Whether another attempt is allowed after `attempt` attempts.
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the given attempt (1-based; attempt 1 has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            (capped + rng.gen_range(-range..range)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
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
