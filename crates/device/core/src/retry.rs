//! Bounded-deadline retry executor.
//!
//! A [`RetryOperation`] wraps one logical operation. Each attempt runs to
//! completion before the next one starts; between attempts the captured
//! [`RetryPolicy`] decides whether to continue and for how long to wait.
//! The overall deadline is `start + max_timeout`: once it has passed no
//! further attempt is made, whatever the policy says, and the caller receives
//! the last transport error rather than a synthetic timeout.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    backoff::RetryPolicy,
    error::{ClientError, TransportError},
};

/// One retry-governed execution of an asynchronous action.
///
/// The policy is captured at construction, so swapping the client's policy
/// never affects an operation that has already started.
#[derive(Debug, Clone)]
pub struct RetryOperation {
    name: &'static str,
    policy: Arc<dyn RetryPolicy>,
    max_timeout: Duration,
    cancel: Option<CancellationToken>,
}

impl RetryOperation {
    /// Creates an operation named `name` for logging.
    ///
    /// A `max_timeout` of zero allows exactly one attempt.
    pub fn new(name: &'static str, policy: Arc<dyn RetryPolicy>, max_timeout: Duration) -> Self {
        Self {
            name,
            policy,
            max_timeout,
            cancel: None,
        }
    }

    /// Abandons the operation when `token` is cancelled during a backoff wait.
    ///
    /// An attempt already running is never interrupted; cancellation is only
    /// observed between attempts.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// Runs `action` until it succeeds, the policy refuses the error, the
    /// deadline passes, or the operation is cancelled.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Transport`] with the last error observed when the
    ///   policy refuses it or the deadline has elapsed.
    /// - [`ClientError::Cancelled`] when the cancellation token fires while
    ///   waiting for the next attempt.
    pub async fn retry<T, F, Fut>(self, mut action: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let deadline = Instant::now() + self.max_timeout;
        let mut attempt: u32 = 0;

        loop {
            let err = match action().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation = self.name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    operation = self.name,
                    attempt,
                    error = %err,
                    "Operation deadline of {:?} elapsed, giving up",
                    self.max_timeout
                );
                return Err(err.into());
            }

            if !self.policy.should_retry(&err) {
                warn!(operation = self.name, attempt, error = %err, "Error is not retryable");
                return Err(err.into());
            }

            let delay = self
                .policy
                .next_retry_timeout(attempt, err.is_throttling())
                .min(deadline - now);

            debug!(
                operation = self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying operation"
            );

            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(operation = self.name, "Retry abandoned, client closed");
                            return Err(ClientError::Cancelled(format!(
                                "{} abandoned after {} attempt(s): client closed",
                                self.name,
                                attempt + 1
                            )));
                        }
                        _ = sleep(delay) => {}
                    }
                }
                None => sleep(delay).await,
            }

            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::{
        backoff::{ExponentialBackoffWithJitter, NoRetry},
        error::TransportErrorKind,
    };

    /// Retries everything after a fixed delay.
    #[derive(Debug)]
    struct FixedDelay(Duration);

    impl RetryPolicy for FixedDelay {
        fn should_retry(&self, _error: &TransportError) -> bool {
            true
        }

        fn next_retry_timeout(&self, _attempt: u32, _throttled: bool) -> Duration {
            self.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let op = RetryOperation::new("probe", Arc::new(NoRetry), Duration::from_secs(1));

        let result = op
            .retry(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TransportError>(7)
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_deadline_with_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = Instant::now();
        let op = RetryOperation::new(
            "always_fails",
            Arc::new(FixedDelay(Duration::from_millis(300))),
            Duration::from_secs(1),
        );

        let result: Result<(), _> = op
            .retry(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::not_connected(format!("attempt {n}")))
            })
            .await;

        let elapsed = started.elapsed();
        // 0ms, 300ms, 600ms, 900ms, then a clamped wait lands exactly on 1000ms
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1100));

        let err = result.unwrap_err();
        let transport = err.transport_error().expect("transport error");
        assert_eq!(transport.kind(), TransportErrorKind::NotConnected);
        assert_eq!(transport.message(), "attempt 4");
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_refusal_means_single_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let op = RetryOperation::new("refused", Arc::new(NoRetry), Duration::from_secs(60));

        let result: Result<(), _> = op
            .retry(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::timeout("slow"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_allows_one_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let op = RetryOperation::new(
            "zero",
            Arc::new(FixedDelay(Duration::ZERO)),
            Duration::ZERO,
        );

        let result: Result<(), _> = op
            .retry(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::not_connected("down"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let op = RetryOperation::new(
            "flaky",
            Arc::new(ExponentialBackoffWithJitter::default()),
            Duration::from_secs(240),
        );

        let result = op
            .retry(move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TransportError::timeout("no ack"))
                } else {
                    Ok("enqueued")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "enqueued");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_pending_wait() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let op = RetryOperation::new(
            "update_sas",
            Arc::new(FixedDelay(Duration::from_secs(30))),
            Duration::from_secs(600),
        )
        .with_cancellation(token.clone());

        let counter = calls.clone();
        let handle = tokio::spawn(async move {
            op.retry(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TransportError::not_connected("down"))
                }
            })
            .await
        });

        sleep(Duration::from_secs(1)).await;
        token.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ClientError::Cancelled(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
