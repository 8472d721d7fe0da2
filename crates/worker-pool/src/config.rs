//! Worker pool configuration.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::PoolError;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers kept alive even when idle.
    pub min_size: usize,

    /// Hard ceiling on live workers (outside an invalidation window).
    pub max_size: usize,

    /// How often the health check runs.
    pub health_check_interval: Duration,

    /// Idle time after which a worker above `min_size` is evicted.
    pub idle_timeout: Duration,

    /// How long a worker poll may park before answering `NoWork`.
    pub pull_timeout: Duration,

    /// How long a request may wait in the admission queue.
    pub queue_timeout: Duration,

    /// How long a bound request may wait for its result. `None` waits forever.
    pub response_timeout: Option<Duration>,

    /// Launch attempts before giving up when the code version keeps moving.
    pub launch_attempts: u32,

    /// Extra environment handed to every launched worker.
    pub worker_env: HashMap<String, String>,
}

impl PoolConfig {
    /// Build a configuration from the plain millisecond values used by the
    /// emulator's environment. A `response_timeout_ms` of zero disables the
    /// response deadline.
    pub fn from_millis(
        min_size: usize,
        max_size: usize,
        health_check_interval_ms: u64,
        idle_timeout_ms: u64,
        pull_timeout_ms: u64,
        queue_timeout_ms: u64,
        response_timeout_ms: u64,
    ) -> Self {
        Self {
            min_size,
            max_size,
            health_check_interval: Duration::from_millis(health_check_interval_ms),
            idle_timeout: Duration::from_millis(idle_timeout_ms),
            pull_timeout: Duration::from_millis(pull_timeout_ms),
            queue_timeout: Duration::from_millis(queue_timeout_ms),
            response_timeout: (response_timeout_ms > 0)
                .then(|| Duration::from_millis(response_timeout_ms)),
            ..Self::default()
        }
    }

    /// Reject configurations the pool cannot honour.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig(
                "max_size must be at least 1".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "health_check_interval must be non-zero".to_string(),
            ));
        }
        if self.pull_timeout.is_zero() || self.queue_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "pull_timeout and queue_timeout must be non-zero".to_string(),
            ));
        }
        if self.launch_attempts == 0 {
            return Err(PoolError::InvalidConfig(
                "launch_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            health_check_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(60),
            pull_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(30),
            response_timeout: None,
            launch_attempts: 3,
            worker_env: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.min_size, 1);
        assert_eq!(config.pull_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_millis_disables_zero_response_timeout() {
        let config = PoolConfig::from_millis(2, 2, 100, 1000, 30_000, 30_000, 0);
        assert_eq!(config.idle_timeout, Duration::from_millis(1000));
        assert!(config.response_timeout.is_none());

        let config = PoolConfig::from_millis(2, 2, 100, 1000, 30_000, 30_000, 250);
        assert_eq!(config.response_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let config = PoolConfig {
            min_size: 3,
            max_size: 2,
            ..PoolConfig::default()
        };
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));

        let config = PoolConfig {
            min_size: 0,
            max_size: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
