//! Error types for the build pipeline.

use thiserror::Error;

use crate::BuildId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Credential or service-instance lookups failed while provisioning.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),

    /// The external task never started, or started already failed.
    #[error("task dispatch failed: {0}")]
    BackendDispatchFailure(String),

    #[error("timeout: {0}")]
    BackendTimeout(String),

    /// The task ran and the backend reported it failed.
    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("no valid access token found for build {0}")]
    NoCredential(BuildId),

    /// Transport or API error from an external client.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
