//! Clients for the external services the pipeline talks to.

pub mod credentials;
pub mod github;
pub mod storage;

pub use credentials::CloudFoundryCredentials;
pub use github::GitHubClient;
pub use storage::S3BucketProbe;
