//! Bounded retry for transient failures such as an unreachable broker.
//!
//! The producer connection manager retries with a **fixed** delay
//! (5 attempts, 5 seconds apart); [`RetryPolicy::default`] is that schedule.
//!
//! # Example
//!
//! ```rust
//! use stocksync_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
//!
//! let result = retry_with_backoff(&policy, || async {
//!     Ok::<_, String>(42)
//! }).await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::time::Duration;
use tokio::time::sleep;

/// Attempts made when connecting a producer.
pub const DEFAULT_CONNECT_ATTEMPTS: usize = 5;

/// Pause between producer connection attempts.
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_secs(5);

/// Fixed-delay retry schedule.
///
/// # Default Values
///
/// - `max_attempts`: 5 (first try included)
/// - `delay`: 5 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: usize,
    /// Pause after every failed attempt but the last
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_DELAY)
    }
}

impl RetryPolicy {
    /// A policy that waits the same `delay` between `attempts` tries.
    ///
    /// Zero attempts is raised to one.
    #[must_use]
    pub const fn fixed(attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: if attempts == 0 { 1 } else { attempts },
            delay,
        }
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent.
///
/// Every failed attempt is logged at `warn`; exhausting the budget is logged
/// at `error` and returns the last error.
///
/// # Errors
///
/// Returns the error of the final attempt if every attempt fails.
///
/// # Example
///
/// ```rust
/// use stocksync_runtime::retry::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_backoff(&policy, || async {
///     Ok::<_, String>(42)
/// }).await?;
///
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        RetryMetrics::record_attempt();
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    RetryMetrics::record_success();
                    tracing::info!(attempt, max_attempts, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if attempt >= max_attempts {
                    tracing::warn!(attempt, max_attempts, error = %err, "Attempt failed");
                    tracing::error!(
                        attempts = max_attempts,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    RetryMetrics::record_exhausted();
                    return Err(err);
                }

                let delay = policy.delay;
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Attempt failed, retrying..."
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn default_policy_is_five_fixed_attempts() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_secs(5));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::fixed(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let policy = RetryPolicy::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(&policy, || {
            let c = Arc::clone(&counter_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(&policy, || {
            let c = Arc::clone(&counter_clone);
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(format!("Attempt {attempt} failed"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget_with_fixed_spacing() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls_clone = Arc::clone(&calls);

        let result = retry_with_backoff(&policy, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.lock().unwrap().push(started.elapsed());
                Err::<(), _>("broker refused connection")
            }
        })
        .await;

        assert_eq!(result, Err("broker refused connection"));
        let calls = calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15),
                Duration::from_secs(20),
            ]
        );
    }
}
