//! The two kinds of dispatchable records: site builds and build tasks.

use async_trait::async_trait;
use pages_config::PollPolicy;
use pages_core::backend::TaskSpec;
use pages_core::site::Site;
use pages_core::source_control::SourceControl;
use pages_core::{BuildId, BuildState, BuildTaskId, Error, Result, SiteId, StatusUpdate};
use pages_db::{BuildRepo, DbError, SiteRepo};
use std::sync::Arc;
use tracing::warn;

use crate::credentials::load_build_user_access_token;
use crate::engine::{DispatchEngine, DispatchTarget};
use crate::environment::EnvironmentAssembler;
use crate::ledger::BuildLedger;
use crate::queue::{JobKind, QueuedJob};

/// Shared dependencies of every job.
#[derive(Clone)]
pub struct JobContext {
    pub builds: Arc<dyn BuildRepo>,
    pub sites: Arc<dyn SiteRepo>,
    pub source_control: Arc<dyn SourceControl>,
    pub assembler: Arc<EnvironmentAssembler>,
    pub ledger: Arc<BuildLedger>,
    pub site_build_policy: PollPolicy,
    pub build_task_policy: PollPolicy,
}

impl JobContext {
    async fn load_site(&self, build_id: BuildId, site_id: SiteId) -> Result<Site> {
        self.sites.get_site(site_id).await.map_err(|e| match e {
            DbError::NotFound(_) => Error::Infrastructure(format!(
                "site {} for build {} does not exist",
                site_id, build_id
            )),
            other => other.into(),
        })
    }
}

/// Publishes one site build.
pub struct SiteBuildJob {
    id: BuildId,
    ctx: JobContext,
}

impl SiteBuildJob {
    pub fn new(id: BuildId, ctx: JobContext) -> Self {
        Self { id, ctx }
    }
}

#[async_trait]
impl DispatchTarget for SiteBuildJob {
    fn kind(&self) -> JobKind {
        JobKind::SiteBuild
    }

    fn record_id(&self) -> i64 {
        self.id.get()
    }

    fn poll_policy(&self) -> PollPolicy {
        self.ctx.site_build_policy
    }

    async fn prepare(&self, correlation_id: &str) -> Result<TaskSpec> {
        let build = self.ctx.builds.get_build(self.id).await?;
        let site = self.ctx.load_site(build.id, build.site_id).await?;

        // Public repositories clone without a token.
        let token = match load_build_user_access_token(
            self.ctx.source_control.as_ref(),
            &build,
            &site,
        )
        .await
        {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(build_id = %build.id, error = %e, "Dispatching without a GitHub token");
                None
            }
        };

        let spec = self
            .ctx
            .assembler
            .site_build_spec(&build, &site, token.as_deref(), correlation_id)
            .await?;

        self.ctx
            .ledger
            .record_build(self.id, &StatusUpdate::new(BuildState::Queued))
            .await?;
        Ok(spec)
    }

    async fn current_state(&self) -> Result<BuildState> {
        Ok(self.ctx.builds.get_build(self.id).await?.state)
    }

    async fn record(&self, status: StatusUpdate) -> Result<()> {
        self.ctx.ledger.record_build(self.id, &status).await?;
        Ok(())
    }
}

/// Runs one named task against a finished build.
pub struct BuildTaskJob {
    id: BuildTaskId,
    ctx: JobContext,
}

impl BuildTaskJob {
    pub fn new(id: BuildTaskId, ctx: JobContext) -> Self {
        Self { id, ctx }
    }
}

#[async_trait]
impl DispatchTarget for BuildTaskJob {
    fn kind(&self) -> JobKind {
        JobKind::BuildTask
    }

    fn record_id(&self) -> i64 {
        self.id.get()
    }

    fn poll_policy(&self) -> PollPolicy {
        self.ctx.build_task_policy
    }

    async fn prepare(&self, correlation_id: &str) -> Result<TaskSpec> {
        let task = self.ctx.builds.get_build_task(self.id).await?;
        let build = self.ctx.builds.get_build(task.build_id).await?;
        let site = self.ctx.load_site(build.id, build.site_id).await?;

        let spec = self
            .ctx
            .assembler
            .build_task_spec(&task, &build, &site, correlation_id)
            .await?;

        self.ctx
            .ledger
            .record_task(self.id, &StatusUpdate::new(BuildState::Queued))
            .await?;
        Ok(spec)
    }

    async fn current_state(&self) -> Result<BuildState> {
        Ok(self.ctx.builds.get_build_task(self.id).await?.state)
    }

    async fn record(&self, status: StatusUpdate) -> Result<()> {
        self.ctx.ledger.record_task(self.id, &status).await?;
        Ok(())
    }
}

/// Turns claimed queue entries into engine runs.
pub struct JobRunner {
    engine: DispatchEngine,
    ctx: JobContext,
}

impl JobRunner {
    pub fn new(engine: DispatchEngine, ctx: JobContext) -> Self {
        Self { engine, ctx }
    }

    pub async fn run(&self, job: &QueuedJob) -> Result<()> {
        match job.kind {
            JobKind::SiteBuild => {
                let target = SiteBuildJob::new(BuildId::new(job.record_id), self.ctx.clone());
                self.engine.run(&target).await
            }
            JobKind::BuildTask => {
                let target = BuildTaskJob::new(BuildTaskId::new(job.record_id), self.ctx.clone());
                self.engine.run(&target).await
            }
        }
    }
}
