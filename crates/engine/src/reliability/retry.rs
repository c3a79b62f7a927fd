//! Retry policy for conflicting units of work

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

pub const RETRIES_ENV: &str = "FLOWNODE_RETRIES";
pub const RETRY_DELAY_ENV: &str = "FLOWNODE_RETRY_DELAY_MS";
pub const RETRY_DELAY_FACTOR_ENV: &str = "FLOWNODE_RETRY_DELAY_FACTOR";

/// Configuration for re-running a unit of work after an optimistic conflict
///
/// A unit runs at most `retries + 1` times. The sleep before retry `n` is
/// `delay * delay_factor^(n-1)`, capped at `max_delay`.
///
/// # Example
///
/// ```
/// use flownode_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_retries(3)
///     .with_delay(Duration::from_millis(10))
///     .with_delay_factor(2.0);
///
/// assert_eq!(policy.delay_for_retry(1), Duration::from_millis(10));
/// assert_eq!(policy.delay_for_retry(3), Duration::from_millis(40));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,

    /// Sleep before the first retry
    #[serde(with = "duration_millis")]
    pub delay: Duration,

    /// Multiplier applied to the delay after every retry
    pub delay_factor: f64,

    /// Upper bound for a single sleep
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            delay: Duration::from_millis(10),
            delay_factor: 2.0,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration, delay_factor: f64) -> Self {
        Self {
            retries,
            delay,
            delay_factor,
            ..Default::default()
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
            delay_factor: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Read `FLOWNODE_RETRIES`, `FLOWNODE_RETRY_DELAY_MS` and
    /// `FLOWNODE_RETRY_DELAY_FACTOR`, keeping defaults for unset or invalid values
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retries: std::env::var(RETRIES_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retries),
            delay: std::env::var(RETRY_DELAY_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.delay),
            delay_factor: std::env::var(RETRY_DELAY_FACTOR_ENV)
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|f| f.is_finite() && *f >= 1.0)
                .unwrap_or(defaults.delay_factor),
            max_delay: defaults.max_delay,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Factors below 1.0 are raised to 1.0
    pub fn with_delay_factor(mut self, factor: f64) -> Self {
        self.delay_factor = factor.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay following `current`
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.delay_factor;
        Duration::from_secs_f64(next.min(self.max_delay.as_secs_f64()))
    }

    /// Sleep before retry `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let mut delay = self.delay.min(self.max_delay);
        for _ in 1..retry {
            delay = self.next_delay(delay);
        }
        delay
    }

    /// Total attempts a unit may make
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}
