//! KDL configuration parsing for the Pages build pipeline.
//!
//! This crate handles:
//! - System configuration (pages.kdl)
//! - Worker polling budgets
//! - Environment variable overrides for secrets and URLs

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    BackendConfig, BackendKind, GitHubConfig, PollPolicy, StorageConfig, SystemConfig,
    WorkerConfig, load_system_config, parse_system_config,
};
