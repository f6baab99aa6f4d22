//! Credentials provider capability.
//!
//! Building credentials (parsing connection strings, signing SAS tokens,
//! scheduling renewal) is the provider's business. The client only consumes
//! the current credentials and reacts to freshly issued tokens.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::TransportError;

/// Connection parameters handed out by a [`CredentialsProvider`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCredentials {
    pub host: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub gateway_host: Option<String>,
    pub shared_access_signature: Option<String>,
}

#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_device_credentials(&self) -> Result<DeviceCredentials, TransportError>;

    /// Returns a receiver that yields credentials every time a new token is issued.
    fn subscribe_new_tokens(&self) -> broadcast::Receiver<DeviceCredentials>;
}
