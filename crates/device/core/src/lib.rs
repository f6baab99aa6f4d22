//! # hubdevice-core: device client core for a cloud IoT hub
//!
//! The transport-independent heart of a device SDK. Concrete wire protocols
//! (MQTT, AMQP, HTTP) plug in through the [`Transport`] trait; this crate adds:
//!
//! - **Policy-driven retries** with exponential backoff, jitter and an overall
//!   deadline per operation
//! - **Feature tracking** for C2D messages, direct methods and desired-property
//!   updates, restored automatically after transient disconnects
//! - **Twin synchronization** with delete-on-null merging and path-scoped
//!   change notifications
//! - **Diagnostics sampling** of outgoing telemetry
//!
//! # Quick Start
//!
//! ```ignore
//! use hubdevice_core::{Client, Message, MethodRequest, MethodResponse};
//! use serde_json::json;
//!
//! let client = Client::new(transport)?;
//! client.open().await?;
//!
//! client.send_event(Message::from_json(&json!({"temperature": 21.5}))?).await?;
//!
//! client.on_device_method("reboot", |_: MethodRequest, response: MethodResponse| async move {
//!     let _ = response.send(200, &json!({"accepted": true})).await;
//! })?;
//!
//! let twin = client.get_twin().await?;
//! twin.reported().update(json!({"firmware": "1.4.2"})).await?;
//!
//! let mut messages = client.messages();
//! while let Some(message) = messages.recv().await {
//!     client.complete(&message).await?;
//! }
//! ```
//!
//! # Events
//!
//! Errors that do not belong to a specific call, and disconnects, are
//! published on [`Client::events`]. A disconnect is only reported when
//! recovery is impossible: either the error is not retryable, or re-enabling
//! a feature that was active before the drop failed.

pub mod backoff;
pub mod blob;
pub mod client;
pub mod config;
pub mod credentials;
pub mod diagnostics;
pub mod error;
pub mod message;
pub mod results;
pub mod retry;
pub mod state;
pub mod subscription;
pub mod transport;
pub mod twin;

mod context;
mod supervisor;

#[cfg(test)]
mod test_support;

pub use backoff::{
    BackoffParameters, ErrorFilter, ExponentialBackoffWithJitter, NoRetry, RetryPolicy,
};
pub use blob::BlobUploader;
pub use client::{Client, ClientBuilder, ClientEvent, MethodHandler};
pub use config::{ClientConfig, DiagnosticsConfig, RetryConfig, RetryPolicyKind};
pub use credentials::{CredentialsProvider, DeviceCredentials};
pub use diagnostics::{DiagnosticContext, DiagnosticSampler};
pub use error::{ClientError, TransportError, TransportErrorKind};
pub use message::{Message, MethodRequest, MethodResponse, MethodResponsePayload};
pub use results::{
    Connected, Disconnected, MessageAbandoned, MessageCompleted, MessageEnqueued,
    MessageRejected, SharedAccessSignatureUpdated, TransportConfigured,
};
pub use retry::RetryOperation;
pub use state::{Feature, FeatureState};
pub use subscription::MessageSubscription;
pub use transport::{Transport, TransportCapabilities, TransportEvent, TransportOptions};
pub use twin::{DesiredPropertySubscription, ReportedProperties, Twin, TwinProperties, TwinState};

pub type Result<T> = std::result::Result<T, ClientError>;
