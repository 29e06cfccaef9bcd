//! Bounded retry with a fixed delay between attempts.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Never less than 1.
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }
}

/// The last error plus how many attempts were made before giving up.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: usize,
    pub error: E,
}

/// Run `operation` until it succeeds, fails with an error `retryable`
/// rejects, or the policy's attempts are used up.
pub async fn with_retry<F, Fut, T, E>(
    policy: RetryPolicy,
    mut operation: F,
    retryable: impl Fn(&E) -> bool,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if attempt < max && retryable(&error) => {
                tracing::warn!(attempt, max, %error, "transient failure; retrying");
                if !policy.delay.is_zero() {
                    sleep(policy.delay).await;
                }
                attempt += 1;
            }
            Err(error) => {
                return Err(RetryError {
                    attempts: attempt,
                    error,
                });
            }
        }
    }
}
