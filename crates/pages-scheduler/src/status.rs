//! Publishes build progress as GitHub commit statuses.

use pages_core::site::Site;
use pages_core::source_control::{CommitState, CommitStatus, SourceControl};
use pages_core::{Build, Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::credentials::load_build_user_access_token;

/// Settings the reporter needs to build status links.
#[derive(Debug, Clone)]
pub struct ReporterSettings {
    /// Base URL of the admin application, without a trailing slash.
    pub app_url: String,
    /// Domain serving sites without a custom domain.
    pub proxy_domain: String,
    /// Status context, e.g. `pages/build`.
    pub context: String,
}

pub struct StatusReporter {
    source_control: Arc<dyn SourceControl>,
    settings: ReporterSettings,
}

impl StatusReporter {
    pub fn new(source_control: Arc<dyn SourceControl>, settings: ReporterSettings) -> Self {
        Self {
            source_control,
            settings,
        }
    }

    pub fn build_logs_url(&self, build: &Build) -> String {
        format!(
            "{}/sites/{}/builds/{}/logs",
            self.settings.app_url, build.site_id, build.id
        )
    }

    /// The status a build's current state maps to. `None` for skipped builds.
    pub fn commit_status(&self, build: &Build, site: &Site) -> Result<Option<CommitStatus>> {
        let sha = build.reported_commit_sha().ok_or_else(|| {
            Error::Validation(format!("build {} has no commit to report on", build.id))
        })?;

        let Some(state) = CommitState::from_build_state(build.state) else {
            return Ok(None);
        };

        let (target_url, description) = match state {
            CommitState::Pending => (self.build_logs_url(build), "The build is running."),
            CommitState::Success => (
                site.view_url(&build.branch, &self.settings.proxy_domain),
                "The build is complete!",
            ),
            CommitState::Error => (
                self.build_logs_url(build),
                "The build has encountered an error.",
            ),
        };

        Ok(Some(CommitStatus {
            owner: site.owner.clone(),
            repo: site.repository.clone(),
            sha: sha.to_string(),
            state,
            target_url,
            description: description.to_string(),
            context: self.settings.context.clone(),
        }))
    }

    /// Report the build's current state on its commit.
    pub async fn report(&self, build: &Build, site: &Site) -> Result<()> {
        let Some(status) = self.commit_status(build, site)? else {
            debug!(build_id = %build.id, state = %build.state, "Nothing to report");
            return Ok(());
        };

        let token = load_build_user_access_token(self.source_control.as_ref(), build, site).await?;
        self.source_control.set_commit_status(&token, &status).await?;

        info!(
            build_id = %build.id,
            sha = %status.sha,
            state = status.state.as_str(),
            "Reported commit status"
        );
        Ok(())
    }
}
