//! Success markers returned by client operations.
//!
//! Each operation resolves to its own marker type so call sites read as what
//! happened (`MessageEnqueued`, `MessageCompleted`) rather than as a bare `()`.

use super::error::TransportError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connected;

/// The client lost (or gave up) its connection.
///
/// `reason` carries the transport error that triggered the disconnect, when
/// there was one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disconnected {
    pub reason: Option<TransportError>,
}

impl Disconnected {
    pub fn new(reason: Option<TransportError>) -> Self {
        Self { reason }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageEnqueued;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageCompleted;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageRejected;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageAbandoned;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportConfigured;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedAccessSignatureUpdated {
    /// Whether the transport had to reconnect to apply the new signature.
    pub needs_reconnect: bool,
}
