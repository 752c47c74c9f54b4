//! Bounded retries for transient failures.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    /// `attempt × base`
    Linear,
    /// `base × 2^(attempt - 1)`
    Exponential,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub delay: RetryDelay,
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            delay: RetryDelay::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            delay: RetryDelay::Exponential,
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.delay {
            RetryDelay::Linear => self.base_delay.saturating_mul(attempt),
            RetryDelay::Exponential => {
                let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the policy's
/// attempts are used up. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt = attempt, "🔁 RETRY: Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt < policy.max_attempts && is_retryable(&e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "🔁 RETRY: Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_shapes() {
        let linear = RetryPolicy::linear(3, Duration::from_millis(100));
        assert_eq!(linear.delay_after(1), Duration::from_millis(100));
        assert_eq!(linear.delay_after(2), Duration::from_millis(200));

        let exponential = RetryPolicy::exponential(4, Duration::from_millis(100));
        assert_eq!(exponential.delay_after(1), Duration::from_millis(100));
        assert_eq!(exponential.delay_after(3), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::linear(3, Duration::from_millis(10));
        let result: Result<u32, String> = retry_with_backoff(&policy, "flaky", |_| true, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {n} failed"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::linear(3, Duration::from_millis(10));
        let result: Result<(), String> = retry_with_backoff(&policy, "down", |_| true, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_immediate() {
        let calls = &AtomicU32::new(0);
        let policy = RetryPolicy::linear(5, Duration::from_secs(60));
        let result: Result<(), String> =
            retry_with_backoff(&policy, "fatal", |e: &String| e != "fatal", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
