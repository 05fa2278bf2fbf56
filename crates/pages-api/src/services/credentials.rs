//! Storage credentials from Cloud Foundry service keys.
//!
//! A site's bucket is a brokered service instance. Its credentials live on a
//! service key, found in three steps: instance by name, key binding for the
//! instance, then the binding's details.

use async_trait::async_trait;
use pages_core::storage::{CredentialService, StorageCredentials};
use pages_core::{Error, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

pub struct CloudFoundryCredentials {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl CloudFoundryCredentials {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.api_url, path);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::Backend(format!("cloud foundry request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Backend(format!(
                "cloud foundry returned {} for {}: {}",
                status, path, text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Backend(format!("invalid cloud foundry response: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    resources: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    guid: String,
}

#[derive(Debug, Deserialize)]
struct BindingDetails {
    credentials: S3ServiceCredentials,
}

#[derive(Debug, Deserialize)]
struct S3ServiceCredentials {
    access_key_id: String,
    secret_access_key: String,
    region: String,
    bucket: String,
}

fn first_guid(page: Page<Resource>, what: &str, name: &str) -> Result<String> {
    page.resources
        .into_iter()
        .next()
        .map(|r| r.guid)
        .ok_or_else(|| Error::Infrastructure(format!("no {} found for {}", what, name)))
}

#[async_trait]
impl CredentialService for CloudFoundryCredentials {
    async fn fetch_storage_credentials(&self, service_name: &str) -> Result<StorageCredentials> {
        let instances: Page<Resource> = self
            .get(&format!(
                "/v3/service_instances?names={}",
                urlencoding::encode(service_name)
            ))
            .await?;
        let instance_guid = first_guid(instances, "service instance", service_name)?;

        let bindings: Page<Resource> = self
            .get(&format!(
                "/v3/service_credential_bindings?type=key&service_instance_guids={}",
                instance_guid
            ))
            .await?;
        let binding_guid = first_guid(bindings, "service key", service_name)?;

        let details: BindingDetails = self
            .get(&format!(
                "/v3/service_credential_bindings/{}/details",
                binding_guid
            ))
            .await?;

        debug!(service = %service_name, bucket = %details.credentials.bucket, "Fetched storage credentials");
        let creds = details.credentials;
        Ok(StorageCredentials {
            access_key_id: creds.access_key_id,
            secret_access_key: creds.secret_access_key,
            region: creds.region,
            bucket: creds.bucket,
        })
    }
}
