//! Deterministic sampling of outgoing messages for end-to-end diagnostics.
//!
//! A sampled message carries a [`DiagnosticContext`]: an 8-character base-62
//! correlation id and its creation time in epoch seconds with millisecond
//! precision. The hub uses them to trace a message through the service.
//!
//! Sampling is round-robin rather than random: for message index `i` in a
//! 100-message window, a message is sampled when
//! `floor((i - 2) * pct / 100) < floor((i - 1) * pct / 100)`. That spreads the
//! sampled messages evenly across the window.

use rand::{distr::Alphanumeric, Rng};
use time::OffsetDateTime;

use super::{error::ClientError, message::Message};

const WINDOW: u32 = 100;
const ID_LENGTH: usize = 8;

/// Correlation data attached to a sampled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticContext {
    /// 8 random characters from `[A-Za-z0-9]`.
    pub id: String,
    /// Seconds since the epoch, formatted with 3 decimal digits.
    pub creation_time_utc: String,
}

impl DiagnosticContext {
    pub fn generate() -> Self {
        let id = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(ID_LENGTH)
            .map(char::from)
            .collect();
        Self {
            id,
            creation_time_utc: epoch_seconds(OffsetDateTime::now_utc()),
        }
    }
}

fn epoch_seconds(at: OffsetDateTime) -> String {
    let millis = at.unix_timestamp_nanos() / 1_000_000;
    format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000))
}

/// Per-client message sampler.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticSampler {
    enabled: bool,
    percentage: u32,
    counter: u32,
}

impl DiagnosticSampler {
    /// Creates an enabled sampler.
    ///
    /// # Errors
    ///
    /// [`ClientError::Argument`] when `percentage` exceeds 100.
    pub fn new(percentage: u32) -> Result<Self, ClientError> {
        Ok(Self {
            enabled: true,
            percentage: Self::check(percentage)?,
            counter: 0,
        })
    }

    /// A sampler that never samples.
    pub fn disabled() -> Self {
        Self::default()
    }

    fn check(percentage: u32) -> Result<u32, ClientError> {
        if percentage > 100 {
            return Err(ClientError::Argument(format!(
                "sampling percentage must be between 0 and 100, got {percentage}"
            )));
        }
        Ok(percentage)
    }

    pub fn percentage(&self) -> u32 {
        self.percentage
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Changes the percentage and enables the sampler. The window position is kept.
    pub fn set_percentage(&mut self, percentage: u32) -> Result<(), ClientError> {
        self.percentage = Self::check(percentage)?;
        self.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Decides whether the next outgoing message is sampled.
    pub fn should_sample(&mut self) -> bool {
        if !self.enabled || self.percentage == 0 {
            return false;
        }
        if self.counter == WINDOW {
            self.counter = 0;
        }
        self.counter += 1;

        let i = i64::from(self.counter);
        let pct = i64::from(self.percentage);
        let window = i64::from(WINDOW);
        ((i - 2) * pct).div_euclid(window) < ((i - 1) * pct).div_euclid(window)
    }

    /// Attaches a fresh [`DiagnosticContext`] when the message is sampled.
    ///
    /// Returns whether the message was decorated.
    pub fn decorate(&mut self, message: &mut Message) -> bool {
        if !self.should_sample() {
            return false;
        }
        message.diagnostics = Some(DiagnosticContext::generate());
        true
    }
}
