//! Retry with exponential backoff for transient backend failures.
//!
//! Only errors that report [`Error::is_transient`] are retried. Everything
//! else, checksum mismatches included, goes straight back to the caller.

use std::future::Future;
use tokio::time::sleep;
use tracing::{debug, warn};

use stowage_common::{Error, Result, RetryConfig};

/// Executor that retries operations with backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an async operation, retrying transient failures.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_attempts(|_| operation(), Error::is_transient)
            .await
    }

    /// Execute an operation that wants to know which attempt it is on,
    /// e.g. to rotate through backend endpoints.
    ///
    /// `should_retry` decides which errors are worth another attempt.
    pub async fn execute_attempts<F, Fut, T, C>(&self, mut operation: F, should_retry: C) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut attempt = 0;

        loop {
            match operation(attempt).await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !should_retry(&err) {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!(
                            "Operation failed after {} attempts: {}",
                            attempt, err
                        );
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast(max_retries: u32) -> RetryExecutor {
        RetryExecutor::new(RetryConfig {
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..RetryConfig::new(max_retries)
        })
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let result: Result<i32> = fast(3).execute(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_on_transient_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let result: Result<i32> = fast(3)
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(Error::provider(503, "unavailable"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let result: Result<i32> = fast(3)
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::UploadChecksumMismatch {
                        algorithm: "md5".to_string(),
                        expected: "a".to_string(),
                        actual: "b".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(Error::UploadChecksumMismatch { .. })));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_retries_exceeded() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let result: Result<i32> = fast(2)
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Timeout("always slow".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        // Initial + 2 retries = 3 attempts
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_numbers_are_passed() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let result: Result<()> = fast(2)
            .execute_attempts(
                move |attempt| {
                    seen_clone.lock().unwrap().push(attempt);
                    async move { Err(Error::Network("down".to_string())) }
                },
                Error::is_transient,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }
}
