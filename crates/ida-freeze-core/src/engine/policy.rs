use std::time::Duration;

use ida_freeze_config::{EngineConfig, DEFAULT_MAX_FILE_COUNT};
use rand::Rng;

/// Bounded retry of transient per-file errors with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(10);
        let base = self.base_backoff.saturating_mul(1u32 << exp);
        let jitter_ms = self.base_backoff.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Runtime knobs of the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_file_count: usize,
    pub max_concurrent_files: usize,
    pub file_timeout: Duration,
    pub retry: RetryPolicy,
    pub lease_ttl: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_file_count: if config.max_file_count == 0 {
                DEFAULT_MAX_FILE_COUNT
            } else {
                config.max_file_count
            },
            max_concurrent_files: config.max_concurrent_files.max(1),
            file_timeout: Duration::from_secs(config.file_timeout_secs),
            retry: RetryPolicy::new(
                config.max_file_attempts,
                Duration::from_millis(config.retry_backoff_ms),
            ),
            lease_ttl: chrono::Duration::seconds(config.lease_ttl_secs as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let first = policy.backoff(1);
        let second = policy.backoff(2);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(250));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_settings_from_config() {
        let settings = EngineSettings::default();
        assert_eq!(settings.max_file_count, 5000);
        assert_eq!(settings.retry.max_attempts, 3);
        assert!(settings.lease_ttl > chrono::Duration::from_std(settings.file_timeout).unwrap());
    }
}
