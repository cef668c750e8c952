//! Coordinator configuration

use std::time::Duration;

/// Retry policy for timeout redelivery
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, the first one included
    pub max_attempts: u32,
    /// Initial delay before first retry (milliseconds)
    pub initial_delay_millis: u64,
    /// Maximum delay cap (milliseconds)
    pub max_delay_millis: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_millis: 1000,
            max_delay_millis: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a given retry (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.initial_delay_millis as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = delay.min(self.max_delay_millis as f64);
        Duration::from_millis(capped as u64)
    }

    /// Check if another attempt is allowed after `attempts` deliveries
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Configuration for the [`TimeoutCoordinator`](crate::TimeoutCoordinator)
#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    /// Longest the firing loop sleeps before re-checking for due timeouts.
    ///
    /// Default: 1 second.
    pub max_idle: Duration,

    /// Backoff applied when delivering a fired timeout fails.
    pub redelivery: RetryPolicy,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(1),
            redelivery: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(0));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        // Would be 512000 but capped at max
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(30000));
    }

    #[test]
    fn test_allows_retry() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
    }
}
