//! Canopy Retry: Pure-logic retry policies
//!
//! # Overview
//!
//! This crate provides the retry-decision building blocks used by the Canopy
//! client framework when an operation against the coordination service fails
//! with a transient error. A [`RetryPolicy`] answers one question: given how
//! many attempts have failed and how long we have been trying, should we try
//! again, and how long should we sleep first?
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - The wire protocol or connection handling
//! - Which errors are transient (the caller classifies before consulting)
//! - Async runtimes (policies decide, callers sleep)
//!
//! # Usage Example
//!
//! ```
//! use canopy_retry::{ExponentialBackoffRetry, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = ExponentialBackoffRetry::new(Duration::from_millis(100), 3, Duration::from_secs(30));
//!
//! // First failed attempt: retry with some backoff
//! let sleep = policy.allow_retry(1, Duration::from_millis(150));
//! assert!(sleep.is_some());
//!
//! // Attempt budget exhausted: give up
//! assert!(policy.allow_retry(3, Duration::from_secs(1)).is_none());
//! ```

pub mod backoff;
pub mod fixed;
pub mod policy;

// Re-export main types for convenience
pub use backoff::ExponentialBackoffRetry;
pub use fixed::{RetryForever, RetryNTimes, RetryOneTime, RetryUntilElapsed};
pub use policy::RetryPolicy;
