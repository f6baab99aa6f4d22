//! Logging initialization.
//!
//! The `LoggerManager` validates the logging configuration and installs the
//! global `tracing` subscriber with a console layer, a journald layer, or
//! both. `RUST_LOG` overrides the configured level when set.

use std::{fmt as stdfmt, io};

use thiserror::Error;
use time::{format_description::OwnedFormatItem, OffsetDateTime};
use tracing::instrument;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Layer, Registry,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig, TimestampFormat},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// IO error, typically while opening the journald socket.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    #[error(
        "Failed to initialize journald logger while console output is enabled. Please check your configuration."
    )]
    JournaldFailedWithConsoleEnabled,
}

/// Renders event timestamps in the configured [`TimestampFormat`].
#[derive(Debug, Clone)]
enum LogTimer {
    Rfc3339,
    Unix,
    Custom(OwnedFormatItem),
}

impl LogTimer {
    fn new(format: &TimestampFormat) -> Result<Self, LoggerError> {
        Ok(match format {
            TimestampFormat::Rfc3339 => LogTimer::Rfc3339,
            TimestampFormat::Unix => LogTimer::Unix,
            TimestampFormat::Custom(description) => LogTimer::Custom(
                time::format_description::parse_owned::<1>(description)
                    .map_err(|e| LoggerError::InitializationError(e.to_string()))?,
            ),
        })
    }

    fn render(&self, at: OffsetDateTime) -> Result<String, stdfmt::Error> {
        match self {
            LogTimer::Rfc3339 => at
                .format(&time::format_description::well_known::Rfc3339)
                .map_err(|_| stdfmt::Error),
            LogTimer::Unix => Ok(format!("{}.{:03}", at.unix_timestamp(), at.millisecond())),
            LogTimer::Custom(items) => at.format(items).map_err(|_| stdfmt::Error),
        }
    }
}

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> stdfmt::Result {
        let rendered = self.render(OffsetDateTime::now_utc())?;
        w.write_str(&rendered)
    }
}

/// Validates logging configuration and installs the global subscriber.
pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if configuration validation fails.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    /// Installs the global subscriber. Call once, before the client is built.
    ///
    /// # Errors
    ///
    /// Fails when no layer could be created, or when journald fails while it
    /// was requested next to console output.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(console_config) = self.config.console.as_ref().filter(|c| c.enabled) {
            let timer = LogTimer::new(&self.config.timestamp_format)?;
            layers.push(console_layer(console_config, timer, self.filter()));
        }

        if let Some(journald_config) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match tracing_journald::layer() {
                Ok(layer) => {
                    let layer = layer.with_syslog_identifier(journald_config.identifier.clone());
                    layers.push(layer.with_filter(self.filter()).boxed());
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald_config.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if self.config.console.as_ref().is_some_and(|c| c.enabled) {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }
}

fn console_layer(config: &ConsoleConfig, timer: LogTimer, filter: EnvFilter) -> BoxedLayer {
    let base = fmt::layer()
        .with_timer(timer)
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_span_events(if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .with_ansi(config.ansi_colors)
        .with_writer(io::stdout);

    match config.format {
        LogFormat::Json => base.json().with_filter(filter).boxed(),
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_filter(filter).boxed(),
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        let config = LoggerConfig {
            level: "loud".into(),
            ..Default::default()
        };
        assert!(matches!(
            LoggerManager::new(config),
            Err(LoggerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_no_layers_configured() {
        let config = LoggerConfig {
            console: None,
            journald: None,
            ..Default::default()
        };
        let mut manager = LoggerManager::new(config).unwrap();
        assert!(matches!(manager.init(), Err(LoggerError::NoLayersConfigured)));
    }

    #[test]
    fn test_timer_formats() {
        let at = datetime!(2024-03-01 12:30:45.250 UTC);

        let rfc = LogTimer::new(&TimestampFormat::Rfc3339).unwrap();
        let rendered = rfc.render(at).unwrap();
        assert!(rendered.starts_with("2024-03-01T12:30:45"), "{rendered}");
        assert!(rendered.ends_with('Z'), "{rendered}");

        let unix = LogTimer::new(&TimestampFormat::Unix).unwrap();
        assert_eq!(unix.render(at).unwrap(), "1709296245.250");

        let custom =
            LogTimer::new(&TimestampFormat::Custom("[hour]:[minute]:[second]".into())).unwrap();
        assert_eq!(custom.render(at).unwrap(), "12:30:45");
    }
}
