//! The transport capability consumed by the client core.
//!
//! Concrete wire protocols (MQTT, AMQP, HTTP) live outside this crate and
//! implement [`Transport`]. The client owns its transport exclusively and
//! drives every call through a [`RetryOperation`](crate::retry::RetryOperation).
//!
//! Transports push asynchronous notifications through a broadcast channel
//! returned by [`Transport::subscribe`]: received C2D messages, method
//! requests, desired-property patches, informational errors and disconnects.
//!
//! Enabling a feature (C2D, methods, desired-property updates) is expected to
//! establish the connection if the transport is not connected yet. Disconnect
//! recovery relies on this.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::{
    error::TransportError,
    message::{Message, MethodRequest, MethodResponsePayload},
    results::{
        Connected, Disconnected, MessageAbandoned, MessageCompleted, MessageEnqueued,
        MessageRejected, SharedAccessSignatureUpdated, TransportConfigured,
    },
    twin::TwinProperties,
};

/// Optional capabilities a transport declares up front.
///
/// The client checks these before calling the corresponding operation, so a
/// missing capability fails with `NotSupported` without a transport round-trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// The transport accepts [`Transport::set_options`].
    pub set_options: bool,
    /// The transport sends a batch in one round-trip. Without it the client
    /// falls back to sending messages one by one.
    pub batch_send: bool,
}

/// Transport-level options applied through `set_options`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Appended to the user agent reported to the service.
    pub product_info: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive: Option<u64>,
    /// PEM encoded CA certificate for hubs with private roots.
    pub ca: Option<String>,
    /// Protocol-specific settings passed through unchanged.
    pub extra: BTreeMap<String, Value>,
}

impl TransportOptions {
    pub fn is_empty(&self) -> bool {
        self.product_info.is_none()
            && self.keep_alive.is_none()
            && self.ca.is_none()
            && self.extra.is_empty()
    }
}

/// Notification pushed by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A cloud-to-device message arrived.
    Message(Message),
    /// The service invoked a direct method.
    MethodRequest(MethodRequest),
    /// The service pushed a desired-properties patch.
    TwinDesiredPropertiesUpdate(Value),
    /// Informational error, forwarded to the application as-is.
    Error(TransportError),
    /// The connection dropped. `None` means a clean disconnect.
    Disconnect(Option<TransportError>),
}

/// Abstract operations the client core invokes on a wire transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> Result<Connected, TransportError>;

    async fn disconnect(&self) -> Result<Disconnected, TransportError>;

    async fn send_event(&self, message: Message) -> Result<MessageEnqueued, TransportError>;

    /// Only called when [`TransportCapabilities::batch_send`] is declared.
    async fn send_event_batch(
        &self,
        messages: Vec<Message>,
    ) -> Result<MessageEnqueued, TransportError>;

    async fn complete(&self, message: &Message) -> Result<MessageCompleted, TransportError>;

    async fn reject(&self, message: &Message) -> Result<MessageRejected, TransportError>;

    async fn abandon(&self, message: &Message) -> Result<MessageAbandoned, TransportError>;

    async fn enable_c2d(&self) -> Result<(), TransportError>;

    async fn disable_c2d(&self) -> Result<(), TransportError>;

    async fn enable_methods(&self) -> Result<(), TransportError>;

    async fn disable_methods(&self) -> Result<(), TransportError>;

    async fn send_method_response(
        &self,
        response: MethodResponsePayload,
    ) -> Result<(), TransportError>;

    async fn get_twin(&self) -> Result<TwinProperties, TransportError>;

    async fn update_twin_reported_properties(&self, patch: &Value) -> Result<(), TransportError>;

    async fn enable_twin_desired_properties_updates(&self) -> Result<(), TransportError>;

    async fn disable_twin_desired_properties_updates(&self) -> Result<(), TransportError>;

    async fn update_shared_access_signature(
        &self,
        sas: &str,
    ) -> Result<SharedAccessSignatureUpdated, TransportError>;

    /// Only called when [`TransportCapabilities::set_options`] is declared.
    async fn set_options(
        &self,
        options: &TransportOptions,
    ) -> Result<TransportConfigured, TransportError>;

    fn capabilities(&self) -> TransportCapabilities;

    /// Returns a receiver for transport notifications.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
