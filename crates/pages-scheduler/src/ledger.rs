//! Records status updates for builds and build tasks.
//!
//! Both the dispatch worker and the status callback go through the ledger,
//! so every write is computed by [`apply_status`] against a freshly loaded
//! record. Out-of-order or repeated updates therefore never move a record
//! backwards or out of a terminal state.

use chrono::Utc;
use pages_core::source_control::CommitState;
use pages_core::{Build, BuildId, BuildTask, BuildTaskId, Result, StatusUpdate, apply_status};
use pages_db::{BuildRepo, SiteRepo};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::status::StatusReporter;

pub struct BuildLedger {
    builds: Arc<dyn BuildRepo>,
    sites: Arc<dyn SiteRepo>,
    reporter: Option<Arc<StatusReporter>>,
}

impl BuildLedger {
    pub fn new(builds: Arc<dyn BuildRepo>, sites: Arc<dyn SiteRepo>) -> Self {
        Self {
            builds,
            sites,
            reporter: None,
        }
    }

    /// Publish commit statuses when a build's reported state changes.
    pub fn with_reporter(mut self, reporter: Arc<StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub async fn record_build(&self, id: BuildId, status: &StatusUpdate) -> Result<Build> {
        let build = self.builds.get_build(id).await?;
        let update = apply_status(&build, status, Utc::now());
        if update.is_empty() {
            debug!(build_id = %id, status = %status.status, "Build already reflects status");
            return Ok(build);
        }

        let updated = self.builds.update_build(id, &update).await?;
        info!(build_id = %id, from = %build.state, to = %updated.state, "Recorded build status");

        if CommitState::from_build_state(build.state)
            != CommitState::from_build_state(updated.state)
        {
            self.report(&updated).await;
        }
        Ok(updated)
    }

    pub async fn record_task(&self, id: BuildTaskId, status: &StatusUpdate) -> Result<BuildTask> {
        let task = self.builds.get_build_task(id).await?;
        let update = apply_status(&task, status, Utc::now());
        if update.is_empty() {
            debug!(task_id = %id, status = %status.status, "Build task already reflects status");
            return Ok(task);
        }

        let updated = self.builds.update_build_task(id, &update).await?;
        info!(task_id = %id, from = %task.state, to = %updated.state, "Recorded build task status");
        Ok(updated)
    }

    // Reporting problems never fail the caller.
    async fn report(&self, build: &Build) {
        let Some(reporter) = &self.reporter else {
            return;
        };

        let site = match self.sites.get_site(build.site_id).await {
            Ok(site) => site,
            Err(e) => {
                warn!(build_id = %build.id, error = %e, "Failed to load site for status report");
                return;
            }
        };

        if let Err(e) = reporter.report(build, &site).await {
            warn!(build_id = %build.id, error = %e, "Failed to report commit status");
        }
    }
}
