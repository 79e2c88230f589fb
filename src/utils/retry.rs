//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Provides the standard
//! backoff configurations for store writes and stream subscribers.

use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{error, warn};

/// Backoff for store writes (serialization/deadlock classes).
///
/// - Min delay: 100ms
/// - Max delay: 1.6s
/// - Max attempts: 20
/// - Jitter enabled
pub fn store_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_millis(1600))
        .with_max_times(20)
        .with_jitter()
}

/// Backoff for stream subscriber handler retries.
///
/// - Min delay: 100ms
/// - Max delay: 6.4s
/// - Max attempts: 24
/// - Jitter enabled
pub fn subscriber_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_millis(6400))
        .with_max_times(24)
        .with_jitter()
}

/// Backoff for command processing (version conflicts).
///
/// Same budget as store writes: 100ms base, 1.6s cap, 20 attempts.
pub fn process_backoff() -> ExponentialBuilder {
    store_backoff()
}

/// The outcome of a single attempt of a retryable operation.
pub enum RetryOutcome<S, F> {
    /// The operation succeeded.
    Success(S),
    /// The operation failed with a retryable error.
    Retryable(F),
    /// The operation failed with a fatal error.
    Fatal(F),
}

/// An operation that can be retried with backoff.
#[async_trait]
pub trait RetryableOperation: Send + Sync {
    /// The output of a successful operation.
    type Success;
    /// The error type for a failed operation.
    type Failure: std::fmt::Display + Send + Sync;

    /// The name of the operation, for logging.
    fn name(&self) -> &str;

    /// Attempt to perform the operation.
    async fn try_execute(&mut self) -> RetryOutcome<Self::Success, Self::Failure>;

    /// Prepare for the next attempt after a retryable failure.
    ///
    /// This method can be used to refresh state before the next try.
    /// If it returns an error, the retry loop is aborted.
    async fn prepare_for_retry(&mut self, failure: &Self::Failure) -> Result<(), Self::Failure> {
        // Default implementation does nothing.
        let _ = failure;
        Ok(())
    }
}

/// Run a `RetryableOperation` with exponential backoff.
///
/// The operation is retried until it succeeds, fails with a fatal error,
/// or the backoff policy gives up.
pub async fn run_with_retry<Op>(
    mut operation: Op,
    backoff: ExponentialBuilder,
) -> Result<Op::Success, Op::Failure>
where
    Op: RetryableOperation,
{
    let mut attempt = 0;
    let mut delays = backoff.build();
    loop {
        attempt += 1;
        match operation.try_execute().await {
            RetryOutcome::Success(success) => return Ok(success),
            RetryOutcome::Retryable(failure) => {
                if let Some(delay) = delays.next() {
                    warn!(
                        operation = %operation.name(),
                        attempt = attempt,
                        error = %failure,
                        delay = ?delay,
                        "Operation failed, retrying after backoff"
                    );
                    if let Err(fatal_failure) = operation.prepare_for_retry(&failure).await {
                        error!(
                            operation = %operation.name(),
                            "Failed to prepare for retry: {}",
                            fatal_failure
                        );
                        return Err(fatal_failure);
                    }
                    tokio::time::sleep(delay).await;
                } else {
                    error!(
                        operation = %operation.name(),
                        attempts = attempt,
                        "Operation failed and retry limit exhausted"
                    );
                    return Err(failure);
                }
            }
            RetryOutcome::Fatal(failure) => {
                error!(
                    operation = %operation.name(),
                    attempt = attempt,
                    error = %failure,
                    "Operation failed with fatal error"
                );
                return Err(failure);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyOperation {
        attempts: Arc<AtomicU32>,
        succeed_after: u32,
        fatal: bool,
    }

    #[async_trait]
    impl RetryableOperation for FlakyOperation {
        type Success = u32;
        type Failure = String;

        fn name(&self) -> &str {
            "flaky"
        }

        async fn try_execute(&mut self) -> RetryOutcome<u32, String> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.succeed_after {
                RetryOutcome::Success(n)
            } else if self.fatal {
                RetryOutcome::Fatal("broken".to_string())
            } else {
                RetryOutcome::Retryable("try again".to_string())
            }
        }
    }

    fn fast_backoff(max_times: usize) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
            .with_max_times(max_times)
    }

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let op = FlakyOperation {
            attempts: attempts.clone(),
            succeed_after: 3,
            fatal: false,
        };

        let result = run_with_retry(op, fast_backoff(5)).await;
        assert_eq!(result.unwrap(), 4);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let op = FlakyOperation {
            attempts: attempts.clone(),
            succeed_after: 3,
            fatal: true,
        };

        let result = run_with_retry(op, fast_backoff(5)).await;
        assert_eq!(result.unwrap_err(), "broken");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let op = FlakyOperation {
            attempts: attempts.clone(),
            succeed_after: 100,
            fatal: false,
        };

        let result = run_with_retry(op, fast_backoff(2)).await;
        assert_eq!(result.unwrap_err(), "try again");
        // Initial attempt plus two backed-off retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
