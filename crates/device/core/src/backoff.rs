//! Retry policies: exponential backoff with jitter and the no-retry policy.
//!
//! A policy is a pure decision function. Given a failed call's error it says
//! whether another attempt is worth making, and given the attempt number it
//! says how long to wait first. Policies hold no per-operation state; the
//! attempt counter lives in [`RetryOperation`](crate::retry::RetryOperation).
//!
//! # Algorithm
//!
//! ```text
//! delay[0] = 0                                   (when immediate_first_retry)
//! delay[n] = min(c_min + (2^(n-1) - 1) * jitter, c_max)
//! jitter   ~ uniform(c * (1 - jitter_down), c * (1 - jitter_up))
//! ```
//!
//! Throttling errors select a second, slower parameter set so a device backs
//! off harder when the service explicitly asks it to.
//!
//! # Examples
//!
//! ```ignore
//! use hubdevice_core::backoff::{ExponentialBackoffWithJitter, RetryPolicy};
//!
//! let policy = ExponentialBackoffWithJitter::default();
//! assert_eq!(policy.next_retry_timeout(0, false), Duration::ZERO);
//! assert!(policy.next_retry_timeout(3, false) <= Duration::from_secs(10));
//! ```

use std::{collections::HashSet, fmt, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::error::{ClientError, TransportError, TransportErrorKind};

/// Strategy deciding whether and when a failed operation is attempted again.
///
/// Implementations must be pure: no side effects, same answer for the same
/// input (jitter aside). A policy may be swapped on the client at any time;
/// operations already in flight keep the policy they captured at start.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Whether `error` is worth another attempt.
    fn should_retry(&self, error: &TransportError) -> bool;

    /// How long to wait before attempt `attempt + 1`.
    ///
    /// `attempt` counts completed attempts starting at 0 for the first
    /// failure. `throttled` is true when the last error was a throttling error.
    fn next_retry_timeout(&self, attempt: u32, throttled: bool) -> Duration;
}

/// Set of error kinds a policy treats as transient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFilter {
    retryable: HashSet<TransportErrorKind>,
}

impl ErrorFilter {
    /// A filter that retries nothing.
    pub fn none() -> Self {
        Self {
            retryable: HashSet::new(),
        }
    }

    /// Marks `kind` as retryable (`true`) or terminal (`false`).
    pub fn with(mut self, kind: TransportErrorKind, retry: bool) -> Self {
        if retry {
            self.retryable.insert(kind);
        } else {
            self.retryable.remove(&kind);
        }
        self
    }

    pub fn is_retryable(&self, kind: TransportErrorKind) -> bool {
        self.retryable.contains(&kind)
    }
}

impl Default for ErrorFilter {
    /// Connectivity, timeout, throttling and transient server errors are retried.
    /// Everything that a second attempt cannot fix is not.
    fn default() -> Self {
        Self::none()
            .with(TransportErrorKind::NotConnected, true)
            .with(TransportErrorKind::Timeout, true)
            .with(TransportErrorKind::Throttling, true)
            .with(TransportErrorKind::InternalServer, true)
            .with(TransportErrorKind::ServiceUnavailable, true)
    }
}

/// Timing parameters for one backoff curve, in milliseconds.
///
/// Keys missing from a deserialized table take the [`normal`](Self::normal)
/// values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_backoff_bounds"))]
pub struct BackoffParameters {
    /// Base scale of the random jitter.
    #[validate(range(min = 1, max = 3_600_000, message = "c_ms must be between 1 and 3600000"))]
    pub c_ms: u64,

    /// Floor of every non-immediate delay.
    pub c_min_ms: u64,

    /// Ceiling of every delay.
    #[validate(range(max = 3_600_000, message = "c_max_ms must not exceed 3600000"))]
    pub c_max_ms: u64,

    /// Upper jitter bound as a fraction of `c`.
    #[validate(range(min = 0.0, max = 1.0, message = "jitter_up must be within [0, 1]"))]
    pub jitter_up: f64,

    /// Lower jitter bound as a fraction of `c`.
    #[validate(range(min = 0.0, max = 1.0, message = "jitter_down must be within [0, 1]"))]
    pub jitter_down: f64,
}

fn validate_backoff_bounds(params: &BackoffParameters) -> Result<(), ValidationError> {
    if params.c_min_ms > params.c_max_ms {
        let mut err = ValidationError::new("invalid_backoff_bounds");
        err.message = Some(
            format!(
                "c_min_ms ({}) must not exceed c_max_ms ({})",
                params.c_min_ms, params.c_max_ms
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

impl BackoffParameters {
    /// Curve used for ordinary transient failures.
    pub fn normal() -> Self {
        Self {
            c_ms: 100,
            c_min_ms: 100,
            c_max_ms: 10_000,
            jitter_up: 0.25,
            jitter_down: 0.5,
        }
    }

    /// Curve used after the service reported throttling.
    pub fn throttled() -> Self {
        Self {
            c_ms: 5_000,
            c_min_ms: 10_000,
            c_max_ms: 60_000,
            jitter_up: 0.25,
            jitter_down: 0.5,
        }
    }

    /// Inclusive range the random jitter is drawn from, in milliseconds.
    fn jitter_bounds(&self) -> (f64, f64) {
        let c = self.c_ms as f64;
        let a = c * (1.0 - self.jitter_up);
        let b = c * (1.0 - self.jitter_down);
        (a.min(b), a.max(b))
    }

    fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let (low, high) = self.jitter_bounds();
        let jitter = low + rng.random::<f64>() * (high - low);
        // 2^62 already saturates any sane c_max
        let growth = 2f64.powi(attempt.saturating_sub(1).min(62) as i32) - 1.0;
        let millis = (self.c_min_ms as f64 + growth * jitter).min(self.c_max_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

impl Default for BackoffParameters {
    fn default() -> Self {
        Self::normal()
    }
}

/// Default policy: exponential backoff with random jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffWithJitter {
    immediate_first_retry: bool,
    normal: BackoffParameters,
    throttled: BackoffParameters,
    filter: ErrorFilter,
}

impl ExponentialBackoffWithJitter {
    /// Builds a policy from explicit curves.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Argument`] when either curve fails validation
    /// (for example `c_min_ms > c_max_ms` or a jitter fraction outside [0, 1]).
    pub fn new(
        immediate_first_retry: bool,
        normal: BackoffParameters,
        throttled: BackoffParameters,
    ) -> Result<Self, ClientError> {
        for params in [&normal, &throttled] {
            params
                .validate()
                .map_err(|e| ClientError::Argument(format!("invalid retry policy: {e}")))?;
        }
        Ok(Self {
            immediate_first_retry,
            normal,
            throttled,
            filter: ErrorFilter::default(),
        })
    }

    /// Replaces the error classification.
    pub fn with_error_filter(mut self, filter: ErrorFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn immediate_first_retry(&self) -> bool {
        self.immediate_first_retry
    }

    pub fn error_filter(&self) -> &ErrorFilter {
        &self.filter
    }
}

impl Default for ExponentialBackoffWithJitter {
    fn default() -> Self {
        Self {
            immediate_first_retry: true,
            normal: BackoffParameters::normal(),
            throttled: BackoffParameters::throttled(),
            filter: ErrorFilter::default(),
        }
    }
}

impl RetryPolicy for ExponentialBackoffWithJitter {
    fn should_retry(&self, error: &TransportError) -> bool {
        self.filter.is_retryable(error.kind())
    }

    fn next_retry_timeout(&self, attempt: u32, throttled: bool) -> Duration {
        if attempt == 0 && self.immediate_first_retry {
            return Duration::ZERO;
        }
        let params = if throttled {
            &self.throttled
        } else {
            &self.normal
        };
        params.delay(attempt, &mut rand::rng())
    }
}

/// Policy that never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _error: &TransportError) -> bool {
        false
    }

    fn next_retry_timeout(&self, _attempt: u32, _throttled: bool) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_classification() {
        let policy = ExponentialBackoffWithJitter::default();
        assert!(policy.should_retry(&TransportError::not_connected("link down")));
        assert!(policy.should_retry(&TransportError::timeout("no ack")));
        assert!(policy.should_retry(&TransportError::throttled("429")));
        assert!(!policy.should_retry(&TransportError::unauthorized("bad sas")));
        assert!(!policy.should_retry(&TransportError::new(
            TransportErrorKind::MessageTooLarge,
            "256KB limit"
        )));
    }

    #[test]
    fn test_immediate_first_retry() {
        let policy = ExponentialBackoffWithJitter::default();
        assert_eq!(policy.next_retry_timeout(0, false), Duration::ZERO);
        assert_eq!(policy.next_retry_timeout(0, true), Duration::ZERO);
    }

    #[test]
    fn test_delay_progression_stays_within_bounds() {
        let policy = ExponentialBackoffWithJitter::default();

        // attempt 1 has no growth term, so it sits exactly at c_min
        assert_eq!(
            policy.next_retry_timeout(1, false),
            Duration::from_millis(100)
        );

        for attempt in 2..40 {
            let delay = policy.next_retry_timeout(attempt, false);
            assert!(delay >= Duration::from_millis(100), "attempt {attempt}");
            assert!(delay <= Duration::from_secs(10), "attempt {attempt}");
        }

        // growth saturates at the cap
        assert_eq!(
            policy.next_retry_timeout(30, false),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_second_attempt_jitter_window() {
        let policy = ExponentialBackoffWithJitter::default();
        // c_min + 1 * jitter, jitter within [50, 75]
        for _ in 0..100 {
            let delay = policy.next_retry_timeout(2, false);
            assert!(delay >= Duration::from_millis(150));
            assert!(delay <= Duration::from_millis(175));
        }
    }

    #[test]
    fn test_throttled_curve_is_slower() {
        let policy = ExponentialBackoffWithJitter::default();
        assert_eq!(
            policy.next_retry_timeout(1, true),
            Duration::from_secs(10)
        );
        assert_eq!(
            policy.next_retry_timeout(20, true),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_without_immediate_first_retry() {
        let policy = ExponentialBackoffWithJitter::new(
            false,
            BackoffParameters::normal(),
            BackoffParameters::throttled(),
        )
        .unwrap();
        assert_eq!(
            policy.next_retry_timeout(0, false),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let inverted = BackoffParameters {
            c_min_ms: 20_000,
            c_max_ms: 10_000,
            ..BackoffParameters::normal()
        };
        let err = ExponentialBackoffWithJitter::new(true, inverted, BackoffParameters::throttled())
            .unwrap_err();
        assert!(err.is_argument());

        let bad_jitter = BackoffParameters {
            jitter_up: 1.5,
            ..BackoffParameters::normal()
        };
        assert!(
            ExponentialBackoffWithJitter::new(true, BackoffParameters::normal(), bad_jitter)
                .is_err()
        );
    }

    #[test]
    fn test_custom_error_filter() {
        let policy = ExponentialBackoffWithJitter::default().with_error_filter(
            ErrorFilter::default()
                .with(TransportErrorKind::Unauthorized, true)
                .with(TransportErrorKind::Timeout, false),
        );
        assert!(policy.should_retry(&TransportError::unauthorized("renewing")));
        assert!(!policy.should_retry(&TransportError::timeout("slow")));
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = NoRetry;
        assert!(!policy.should_retry(&TransportError::not_connected("down")));
        assert_eq!(policy.next_retry_timeout(5, true), Duration::ZERO);
    }
}
