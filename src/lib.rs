//! hubdevice — device-side SDK for a cloud IoT hub
//!
//! The client core lives in the `hubdevice-core` crate and is re-exported
//! here as [`core`]. This crate adds what an application needs around it:
//!
//! * `config` — TOML configuration for logging and the client, validated with
//!   the `validator` crate and located through `HUBDEVICE_CONFIG`.
//!
//! * `logger` — `tracing` subscriber setup with console output (compact,
//!   pretty or JSON) and optional systemd journald integration.
//!
//! ```ignore
//! let config = hubdevice::config::Config::new()?;
//! hubdevice::logger::LoggerManager::new(config.logger.clone())?.init()?;
//!
//! let client = hubdevice::core::Client::builder(transport)
//!     .config(config.client.clone())
//!     .build()?;
//! client.open().await?;
//! ```

pub mod config;
pub mod logger;

pub use hubdevice_core as core;
