//! Client configuration.
//!
//! Every tunable the client core uses (operation deadline, backoff curves,
//! diagnostics sampling, event buffer size) lives here instead of in module
//! constants, so deployments and tests can override them.
//!
//! # Examples
//!
//! ```toml
//! max_operation_timeout_ms = 60000
//! event_channel_capacity = 256
//!
//! [retry]
//! policy = "exponential"
//! immediate_first_retry = false
//!
//! [retry.normal]
//! c_ms = 100
//! c_min_ms = 100
//! c_max_ms = 10000
//! jitter_up = 0.25
//! jitter_down = 0.5
//!
//! [diagnostics]
//! enabled = true
//! sampling_percentage = 10
//! ```

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};
use validator::Validate;

use super::{
    backoff::{BackoffParameters, ExponentialBackoffWithJitter, NoRetry, RetryPolicy},
    diagnostics::DiagnosticSampler,
    error::ClientError,
};

/// Default upper bound on one operation, retries included: 4 minutes.
pub const DEFAULT_MAX_OPERATION_TIMEOUT_MS: u64 = 240_000;

/// Top-level client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// Overall deadline of one operation including every retry, in milliseconds.
    ///
    /// `0` allows a single attempt.
    #[validate(range(
        max = 86_400_000,
        message = "max_operation_timeout_ms must not exceed one day"
    ))]
    pub max_operation_timeout_ms: u64,

    #[validate(nested)]
    pub retry: RetryConfig,

    #[validate(nested)]
    pub diagnostics: DiagnosticsConfig,

    /// Buffer of the application event broadcast (`error`, `disconnect`).
    #[validate(range(
        min = 1,
        max = 65_536,
        message = "event_channel_capacity must be between 1 and 65536"
    ))]
    pub event_channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_operation_timeout_ms: DEFAULT_MAX_OPERATION_TIMEOUT_MS,
            retry: RetryConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            event_channel_capacity: 64,
        }
    }
}

impl ClientConfig {
    pub fn max_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.max_operation_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicyKind {
    #[default]
    Exponential,
    /// Every failure is terminal.
    None,
}

/// Retry policy selection and backoff curves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    pub policy: RetryPolicyKind,

    /// Retry the first failure without waiting.
    pub immediate_first_retry: bool,

    /// Curve for ordinary transient failures.
    #[validate(nested)]
    pub normal: BackoffParameters,

    /// Curve used when the service reports throttling.
    #[validate(nested)]
    #[serde(deserialize_with = "throttled_curve")]
    pub throttled: BackoffParameters,
}

/// Throttled-curve keys as they appear in a config table.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BackoffOverrides {
    c_ms: Option<u64>,
    c_min_ms: Option<u64>,
    c_max_ms: Option<u64>,
    jitter_up: Option<f64>,
    jitter_down: Option<f64>,
}

// a partial [retry.throttled] table keeps the throttled values for unset keys
fn throttled_curve<'de, D>(deserializer: D) -> Result<BackoffParameters, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = BackoffOverrides::deserialize(deserializer)?;
    let base = BackoffParameters::throttled();
    Ok(BackoffParameters {
        c_ms: overrides.c_ms.unwrap_or(base.c_ms),
        c_min_ms: overrides.c_min_ms.unwrap_or(base.c_min_ms),
        c_max_ms: overrides.c_max_ms.unwrap_or(base.c_max_ms),
        jitter_up: overrides.jitter_up.unwrap_or(base.jitter_up),
        jitter_down: overrides.jitter_down.unwrap_or(base.jitter_down),
    })
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicyKind::Exponential,
            immediate_first_retry: true,
            normal: BackoffParameters::normal(),
            throttled: BackoffParameters::throttled(),
        }
    }
}

impl RetryConfig {
    /// Builds the configured policy.
    pub fn build_policy(&self) -> Result<Arc<dyn RetryPolicy>, ClientError> {
        Ok(match self.policy {
            RetryPolicyKind::Exponential => Arc::new(ExponentialBackoffWithJitter::new(
                self.immediate_first_retry,
                self.normal.clone(),
                self.throttled.clone(),
            )?),
            RetryPolicyKind::None => Arc::new(NoRetry),
        })
    }
}

/// Message sampling for end-to-end diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,

    #[validate(range(max = 100, message = "sampling_percentage must be between 0 and 100"))]
    pub sampling_percentage: u32,
}

impl DiagnosticsConfig {
    pub fn build_sampler(&self) -> Result<DiagnosticSampler, ClientError> {
        if self.enabled {
            DiagnosticSampler::new(self.sampling_percentage)
        } else {
            Ok(DiagnosticSampler::disabled())
        }
    }
}
