//! Bus tunables. Backoff constants, queue bounds, and breaker thresholds are
//! configuration, not hard-coded assumptions.

use crate::{DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_CEILING};
use std::env;
use std::time::Duration;

/// Configuration for the message bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Global concurrency ceiling for in-flight deliveries.
    pub worker_ceiling: usize,

    /// Capacity of each priority queue before `QueueFull`.
    pub queue_capacity: usize,

    /// Default caller-visible wait for a request-response call.
    pub request_timeout: Duration,

    /// Per-attempt handler execution timeout.
    pub handler_timeout: Duration,

    /// Base delay for exponential retry backoff.
    pub retry_base: Duration,

    /// Upper bound on retry backoff.
    pub retry_cap: Duration,

    /// Consecutive failures that open a module's breaker.
    pub breaker_failure_threshold: u32,

    /// Cooldown before an open breaker admits its half-open probe.
    pub breaker_cooldown: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            worker_ceiling: DEFAULT_WORKER_CEILING,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            request_timeout: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(5),
            retry_base: Duration::from_millis(50),
            retry_cap: Duration::from_secs(5),
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// # Environment Variables
    ///
    /// - `LATTICE_BUS_WORKER_CEILING`: max in-flight deliveries (default: 256)
    /// - `LATTICE_BUS_QUEUE_CAPACITY`: per-priority queue bound (default: 4096)
    /// - `LATTICE_BUS_REQUEST_TIMEOUT_MS`: request wait (default: 5000)
    /// - `LATTICE_BUS_HANDLER_TIMEOUT_MS`: per-attempt timeout (default: 5000)
    /// - `LATTICE_BUS_RETRY_BASE_MS`: backoff base (default: 50)
    /// - `LATTICE_BUS_RETRY_CAP_MS`: backoff cap (default: 5000)
    /// - `LATTICE_BUS_BREAKER_THRESHOLD`: failures to open (default: 5)
    /// - `LATTICE_BUS_BREAKER_COOLDOWN_MS`: open cooldown (default: 30000)
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_ceiling: env_usize("LATTICE_BUS_WORKER_CEILING", defaults.worker_ceiling),
            queue_capacity: env_usize("LATTICE_BUS_QUEUE_CAPACITY", defaults.queue_capacity),
            request_timeout: env_millis("LATTICE_BUS_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            handler_timeout: env_millis("LATTICE_BUS_HANDLER_TIMEOUT_MS", defaults.handler_timeout),
            retry_base: env_millis("LATTICE_BUS_RETRY_BASE_MS", defaults.retry_base),
            retry_cap: env_millis("LATTICE_BUS_RETRY_CAP_MS", defaults.retry_cap),
            breaker_failure_threshold: env_u32(
                "LATTICE_BUS_BREAKER_THRESHOLD",
                defaults.breaker_failure_threshold,
            ),
            breaker_cooldown: env_millis(
                "LATTICE_BUS_BREAKER_COOLDOWN_MS",
                defaults.breaker_cooldown,
            ),
        }
    }

    /// Exponential backoff for the next retry: `base * 2^attempt`, capped.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(20));
        let delay = self
            .retry_base
            .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX));
        delay.min(self.retry_cap)
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.worker_ceiling, 256);
        assert_eq!(config.queue_capacity, 4096);
        assert_eq!(config.breaker_failure_threshold, 5);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = BusConfig {
            retry_base: Duration::from_millis(50),
            retry_cap: Duration::from_millis(400),
            ..BusConfig::default()
        };

        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(50));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
        // Capped from here on
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for_attempt(30), Duration::from_millis(400));
    }
}
