//! S3 bucket readiness probe.
//!
//! New service keys take a few seconds to propagate, so the probe signs a
//! `HEAD` request for the bucket and retries until it succeeds or the
//! timeout passes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use pages_core::storage::{ObjectStorage, StorageCredentials};
use pages_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// SHA-256 of an empty payload.
const EMPTY_PAYLOAD_HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

pub struct S3BucketProbe {
    client: reqwest::Client,
    /// Path-style endpoint override, e.g. a local MinIO.
    endpoint: Option<String>,
}

impl S3BucketProbe {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
        }
    }

    /// URL, host and canonical path addressing a bucket.
    fn bucket_location(
        &self,
        credentials: &StorageCredentials,
    ) -> Result<(String, String, String)> {
        match &self.endpoint {
            Some(endpoint) => {
                let url = url::Url::parse(endpoint).map_err(|e| {
                    Error::Infrastructure(format!("invalid storage endpoint: {}", e))
                })?;
                let host = match (url.host_str(), url.port()) {
                    (Some(host), Some(port)) => format!("{}:{}", host, port),
                    (Some(host), None) => host.to_string(),
                    (None, _) => {
                        return Err(Error::Infrastructure(format!(
                            "storage endpoint {} has no host",
                            endpoint
                        )));
                    }
                };
                let path = format!("/{}", credentials.bucket);
                Ok((format!("{}://{}{}", url.scheme(), host, path), host, path))
            }
            None => {
                let host = format!(
                    "{}.s3.{}.amazonaws.com",
                    credentials.bucket, credentials.region
                );
                Ok((format!("https://{}/", host), host, "/".to_string()))
            }
        }
    }

    async fn head_bucket(&self, credentials: &StorageCredentials) -> Result<reqwest::StatusCode> {
        let (url, host, path) = self.bucket_location(credentials)?;
        let now = Utc::now();
        let authorization = authorization_header(credentials, &host, &path, now);

        let response = self
            .client
            .head(&url)
            .header("x-amz-date", amz_date(now))
            .header("x-amz-content-sha256", EMPTY_PAYLOAD_HASH)
            .header("Authorization", authorization)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("bucket request failed: {}", e)))?;

        Ok(response.status())
    }
}

#[async_trait]
impl ObjectStorage for S3BucketProbe {
    async fn verify_bucket_ready(
        &self,
        credentials: &StorageCredentials,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.head_bucket(credentials).await {
                Ok(status) if status.is_success() => {
                    info!(bucket = %credentials.bucket, attempt, "Bucket is ready");
                    return Ok(());
                }
                Ok(status) => {
                    debug!(bucket = %credentials.bucket, attempt, status = %status, "Bucket not ready");
                }
                Err(e) => {
                    debug!(bucket = %credentials.bucket, attempt, error = %e, "Bucket not ready");
                }
            }

            if Instant::now() + RETRY_DELAY > deadline {
                return Err(Error::BackendTimeout(format!(
                    "bucket {} was not ready after {} seconds",
                    credentials.bucket,
                    timeout.as_secs()
                )));
            }
            sleep(RETRY_DELAY).await;
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take any size key");
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn amz_date(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Derive the SigV4 signing key for a day, region and service.
fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date);
    let k_region = hmac(&k_date, region);
    let k_service = hmac(&k_region, service);
    hmac(&k_service, "aws4_request")
}

/// SigV4 `Authorization` header for an unsigned-body `HEAD` request.
fn authorization_header(
    credentials: &StorageCredentials,
    host: &str,
    path: &str,
    at: DateTime<Utc>,
) -> String {
    let amz_date = amz_date(at);
    let date = at.format("%Y%m%d").to_string();
    let scope = format!("{}/{}/s3/aws4_request", date, credentials.region);

    let canonical_request = format!(
        "HEAD\n{}\n\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
        path, host, EMPTY_PAYLOAD_HASH, amz_date, SIGNED_HEADERS, EMPTY_PAYLOAD_HASH
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&credentials.secret_access_key, &date, &credentials.region, "s3");
    let signature = hex::encode(hmac(&key, &string_to_sign));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key_id, scope, SIGNED_HEADERS, signature
    )
}
