//! Blob upload capability.

use async_trait::async_trait;
use bytes::Bytes;

use super::error::TransportError;

/// Uploads files to the storage account linked to the hub.
///
/// The client wraps every upload in a retry operation and forwards shared
/// access signature updates so uploads keep authenticating after renewal.
#[async_trait]
pub trait BlobUploader: Send + Sync + 'static {
    async fn upload_to_blob(&self, blob_name: &str, data: Bytes) -> Result<(), TransportError>;

    fn update_shared_access_signature(&self, sas: &str);
}
