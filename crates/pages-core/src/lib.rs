//! Core domain types and traits for the Pages build pipeline.
//!
//! This crate contains:
//! - Record identifiers
//! - The build lifecycle state machine
//! - Site, user, and branch configuration types
//! - Traits for the external backends (task execution, source control, storage)
//! - Credential redaction for stored error messages

pub mod backend;
pub mod build;
pub mod error;
pub mod id;
pub mod redact;
pub mod site;
pub mod source_control;
pub mod storage;

pub use build::{
    Build, BuildState, BuildTask, BuildUpdate, LifecycleRecord, StatusUpdate, apply_status,
    can_complete, can_start, is_complete, is_in_progress,
};
pub use error::{Error, Result};
pub use id::{BuildId, BuildTaskId, SiteId, UserId};
