use std::time::Duration;

use crate::error::SyncError;

/// Capped exponential backoff for caller-driven stream restarts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1_u32 << attempt.min(20);
        let calculated = self.base.saturating_mul(factor);
        calculated
            .max(retry_after.unwrap_or_default())
            .min(self.max)
    }

    /// Delay before the next restart, honoring any hint carried by `err`.
    pub fn delay_after_error(&self, attempt: u32, err: &SyncError) -> Duration {
        self.delay_for_attempt(attempt, err.retry_after_ms.map(Duration::from_millis))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncErrorCategory;

    #[test]
    fn starts_with_base_delay() {
        let policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(8));
        assert_eq!(
            policy.delay_for_attempt(0, None),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn doubles_per_attempt_up_to_cap() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(
            policy.delay_for_attempt(3, None),
            Duration::from_millis(800)
        );
        assert_eq!(policy.delay_for_attempt(4, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(u32::MAX, None), Duration::from_secs(1));
    }

    #[test]
    fn honors_retry_after_hint_from_error() {
        let policy = RetryPolicy::default();
        let err = SyncError::new(SyncErrorCategory::RateLimited, "rate_limited", "slow down")
            .with_retry_after(Duration::from_secs(7));
        assert_eq!(policy.delay_after_error(0, &err), Duration::from_secs(7));
    }

    #[test]
    fn max_never_below_base() {
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(policy.max(), Duration::from_secs(2));
    }
}
