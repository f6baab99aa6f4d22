//! Messages exchanged with the hub: telemetry/C2D messages and direct-method
//! requests and responses.
//!
//! # Examples
//!
//! ```ignore
//! let message = Message::new(r#"{"temperature":21.5}"#)
//!     .with_message_id("m-42")
//!     .with_content_type("application/json")
//!     .with_property("alert", "false");
//! client.send_event(message).await?;
//! ```

use std::{collections::BTreeMap, fmt, sync::Arc};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::{diagnostics::DiagnosticContext, error::ClientError, transport::Transport};

/// A device-to-cloud or cloud-to-device message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub data: Bytes,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Settlement token assigned by the transport to received C2D messages.
    pub lock_token: Option<String>,
    /// Application properties.
    pub properties: BTreeMap<String, String>,
    /// Set by the diagnostic sampler on sampled outgoing messages.
    pub diagnostics: Option<DiagnosticContext>,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Serializes `value` as the JSON body of a new message.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, ClientError> {
        let data = serde_json::to_vec(value)?;
        Ok(Self::new(data)
            .with_content_type("application/json")
            .with_content_encoding("utf-8"))
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_lock_token(mut self, token: impl Into<String>) -> Self {
        self.lock_token = Some(token.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// A direct-method invocation pushed by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    pub request_id: String,
    pub method_name: String,
    pub payload: Bytes,
}

impl MethodRequest {
    pub fn new(
        request_id: impl Into<String>,
        method_name: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method_name: method_name.into(),
            payload: payload.into(),
        }
    }

    /// Decodes the request payload as JSON. An empty payload decodes as `null`.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        if self.payload.is_empty() {
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// What the device sends back for a direct-method request.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponsePayload {
    pub request_id: String,
    pub status: u16,
    pub payload: Bytes,
}

/// Reply channel for one direct-method request.
///
/// [`send`](Self::send) consumes the response, so every request is answered
/// at most once.
pub struct MethodResponse {
    request_id: String,
    transport: Arc<dyn Transport>,
}

impl MethodResponse {
    pub(crate) fn new(request_id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            request_id: request_id.into(),
            transport,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Sends `status` with `payload` serialized as JSON.
    pub async fn send<T: Serialize>(self, status: u16, payload: &T) -> Result<(), ClientError> {
        let payload = Bytes::from(serde_json::to_vec(payload)?);
        debug!(request_id = %self.request_id, status, "Sending method response");
        self.transport
            .send_method_response(MethodResponsePayload {
                request_id: self.request_id,
                status,
                payload,
            })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for MethodResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodResponse")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn test_message_builder() {
        let message = Message::new("hello")
            .with_message_id("m-1")
            .with_correlation_id("c-1")
            .with_property("level", "critical");

        assert_eq!(message.data, Bytes::from_static(b"hello"));
        assert_eq!(message.message_id.as_deref(), Some("m-1"));
        assert_eq!(message.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(message.properties.get("level").map(String::as_str), Some("critical"));
        assert!(message.diagnostics.is_none());
    }

    #[test]
    fn test_message_json_roundtrip() {
        let message = Message::from_json(&json!({"temperature": 21.5})).unwrap();
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        let body: Value = message.json().unwrap();
        assert_eq!(body["temperature"], 21.5);
    }

    #[test]
    fn test_method_request_payload() {
        let request = MethodRequest::new("7", "reboot", r#"{"delay":5}"#);
        let body: Value = request.payload_json().unwrap();
        assert_eq!(body, json!({"delay": 5}));

        let empty = MethodRequest::new("8", "ping", Bytes::new());
        let body: Value = empty.payload_json().unwrap();
        assert_eq!(body, Value::Null);

        let garbage = MethodRequest::new("9", "ping", "{oops");
        assert!(matches!(
            garbage.payload_json::<Value>(),
            Err(ClientError::Serialization(_))
        ));
    }
}
