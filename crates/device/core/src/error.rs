//! Error types for the device client core.
//!
//! Two layers of errors exist:
//!
//! - [`TransportError`] is what a transport (or the blob uploader) reports for a
//!   single failed call. It carries a [`TransportErrorKind`] so the active retry
//!   policy can classify it without string matching.
//! - [`ClientError`] is what every public client operation returns. Argument
//!   errors are produced before any transport interaction; everything else is a
//!   terminal transport failure or a cancellation caused by `close()`.
//!
//! # Usage
//!
//! ```ignore
//! match client.send_event(message).await {
//!     Ok(_) => {}
//!     Err(ClientError::Argument(msg)) => eprintln!("bad request: {msg}"),
//!     Err(ClientError::Transport(err)) if err.kind() == TransportErrorKind::Unauthorized => {
//!         // refresh credentials before trying again
//!     }
//!     Err(e) => eprintln!("send failed: {e}"),
//! }
//! ```

use std::fmt;

use thiserror::Error;

/// Category of a transport failure.
///
/// The set mirrors the error names an IoT hub service and its transports
/// report. Retry policies classify on this value only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    NotConnected,
    Timeout,
    Throttling,
    InternalServer,
    ServiceUnavailable,
    Unauthorized,
    DeviceNotFound,
    MessageTooLarge,
    QuotaExceeded,
    MessageLockLost,
    Format,
    InvalidOperation,
    NotImplemented,
    TwinRequest,
    Argument,
    Other,
}

impl TransportErrorKind {
    /// Returns a short string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::NotConnected => "NotConnected",
            TransportErrorKind::Timeout => "Timeout",
            TransportErrorKind::Throttling => "Throttling",
            TransportErrorKind::InternalServer => "InternalServer",
            TransportErrorKind::ServiceUnavailable => "ServiceUnavailable",
            TransportErrorKind::Unauthorized => "Unauthorized",
            TransportErrorKind::DeviceNotFound => "DeviceNotFound",
            TransportErrorKind::MessageTooLarge => "MessageTooLarge",
            TransportErrorKind::QuotaExceeded => "QuotaExceeded",
            TransportErrorKind::MessageLockLost => "MessageLockLost",
            TransportErrorKind::Format => "Format",
            TransportErrorKind::InvalidOperation => "InvalidOperation",
            TransportErrorKind::NotImplemented => "NotImplemented",
            TransportErrorKind::TwinRequest => "TwinRequest",
            TransportErrorKind::Argument => "Argument",
            TransportErrorKind::Other => "Other",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed transport call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotConnected, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Throttling, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unauthorized, message)
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the service asked the device to slow down.
    ///
    /// Retry policies switch to their throttled backoff parameters when this
    /// returns true.
    pub fn is_throttling(&self) -> bool {
        self.kind == TransportErrorKind::Throttling
    }
}

/// The error type returned by every public client operation.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Malformed caller input: empty name, duplicate method registration,
    /// invalid retry parameters, sampling percentage out of range.
    ///
    /// Never retried and always produced before the transport is touched.
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// The transport or a collaborator does not declare the capability an
    /// operation needs.
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Terminal transport failure: the retry policy refused the error or the
    /// operation deadline elapsed. Carries the last error observed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The operation was abandoned because the client was closed while it
    /// waited for its next attempt.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration validation failed.
    #[error("Configuration validation error: {0}")]
    Config(#[from] validator::ValidationErrors),

    /// A payload could not be encoded or decoded as JSON.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Returns the underlying transport error, if any.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            ClientError::Transport(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_argument(&self) -> bool {
        matches!(self, ClientError::Argument(_))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}
