//! Bounded exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

use crate::policy::RetryPolicy;

/// Cap on the exponent so the jitter factor cannot overflow.
const MAX_SHIFT: usize = 16;

/// Retries a bounded number of attempts, sleeping an exponentially growing,
/// randomized duration between them.
///
/// The sleep before retry `n` is `base_sleep * random(1..=2^n)`, capped at
/// `max_sleep`. The jitter spreads reconnect storms from many clients that
/// lost the same server at the same time.
///
/// This is the expected default policy for a Canopy client.
///
/// # Example
/// ```
/// use canopy_retry::{ExponentialBackoffRetry, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = ExponentialBackoffRetry::new(Duration::from_secs(1), 3, Duration::from_secs(15));
/// assert!(policy.allow_retry(1, Duration::ZERO).is_some());
/// assert!(policy.allow_retry(3, Duration::ZERO).is_none());
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    base_sleep: Duration,
    max_attempts: usize,
    max_sleep: Duration,
}

impl ExponentialBackoffRetry {
    /// Create a policy allowing `max_attempts` total attempts, sleeping at
    /// most `max_sleep` between any two of them.
    pub fn new(base_sleep: Duration, max_attempts: usize, max_sleep: Duration) -> Self {
        Self {
            base_sleep,
            max_attempts,
            max_sleep,
        }
    }

    /// The configured base sleep.
    pub fn base_sleep(&self) -> Duration {
        self.base_sleep
    }

    /// The configured attempt budget.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

impl RetryPolicy for ExponentialBackoffRetry {
    fn allow_retry(&self, attempt: usize, _elapsed: Duration) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let shift = attempt.min(MAX_SHIFT);
        let factor = rand::rng().random_range(1..=(1u64 << shift));
        let sleep = self
            .base_sleep
            .checked_mul(factor as u32)
            .unwrap_or(self.max_sleep);

        Some(sleep.min(self.max_sleep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gives_up_at_attempt_budget() {
        let policy = ExponentialBackoffRetry::new(Duration::from_millis(10), 3, Duration::from_secs(1));

        assert!(policy.allow_retry(1, Duration::ZERO).is_some());
        assert!(policy.allow_retry(2, Duration::ZERO).is_some());
        assert!(policy.allow_retry(3, Duration::ZERO).is_none());
        assert!(policy.allow_retry(10, Duration::ZERO).is_none());
    }

    #[test]
    fn test_sleep_within_bounds() {
        let base = Duration::from_millis(10);
        let max = Duration::from_millis(200);
        let policy = ExponentialBackoffRetry::new(base, 100, max);

        for attempt in 1..50 {
            let sleep = policy.allow_retry(attempt, Duration::ZERO).unwrap();
            assert!(sleep >= base, "attempt {attempt}: {sleep:?} below base");
            assert!(sleep <= max, "attempt {attempt}: {sleep:?} above cap");
        }
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = ExponentialBackoffRetry::new(Duration::from_secs(1), usize::MAX, Duration::from_secs(15));

        let sleep = policy.allow_retry(10_000, Duration::ZERO).unwrap();
        assert!(sleep <= Duration::from_secs(15));
    }
}
