//! The retry-decision contract

use std::time::Duration;

/// Decides whether a failed operation should be retried.
///
/// The caller classifies the failure first; a policy is only consulted for
/// errors that are safe to retry. Policies are stateless across calls: every
/// decision is a function of the two counters passed in, so one policy value
/// can be shared by any number of concurrent operations.
pub trait RetryPolicy: Send + Sync {
    /// Decide whether to retry after a failed attempt.
    ///
    /// `attempt` is the number of attempts that have failed so far (1 after
    /// the first failure). `elapsed` is the time since the first attempt
    /// began. Returns `Some(sleep)` to retry after sleeping, or `None` to
    /// give up.
    fn allow_retry(&self, attempt: usize, elapsed: Duration) -> Option<Duration>;
}
