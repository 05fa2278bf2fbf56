//! Build scheduling for the Pages build pipeline.
//!
//! Workers claim jobs from a PostgreSQL queue (SKIP LOCKED), assemble each
//! build's environment, dispatch it to a task backend and poll it until it
//! finishes. Status changes from the worker and from the build container's
//! callback both go through the [`BuildLedger`].

pub mod credentials;
pub mod engine;
pub mod environment;
pub mod jobs;
pub mod ledger;
pub mod queue;
pub mod status;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use credentials::load_build_user_access_token;
pub use engine::{DispatchEngine, DispatchTarget};
pub use environment::{EnvironmentAssembler, EnvironmentSettings};
pub use jobs::{BuildTaskJob, JobContext, JobRunner, SiteBuildJob};
pub use ledger::BuildLedger;
pub use queue::{JobKind, JobQueue, PgJobQueue, QueuedJob};
pub use status::{ReporterSettings, StatusReporter};
pub use worker::Worker;
