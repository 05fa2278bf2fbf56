//! Object storage and infrastructure-credential abstractions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::Result;

/// Credentials for a site's storage bucket.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub bucket: String,
}

// Keep secrets out of logs.
impl fmt::Debug for StorageCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .finish()
    }
}

/// Trait for the service that issues storage credentials.
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Fetch the credentials bound to a storage service instance.
    async fn fetch_storage_credentials(&self, service_name: &str) -> Result<StorageCredentials>;
}

/// Trait for object storage backends.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Wait until the bucket accepts requests made with `credentials`.
    ///
    /// Newly issued credentials can take several seconds to become usable.
    async fn verify_bucket_ready(
        &self,
        credentials: &StorageCredentials,
        timeout: Duration,
    ) -> Result<()>;
}
