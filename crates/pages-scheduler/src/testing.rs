//! In-memory fakes for scheduler tests.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pages_config::PollPolicy;
use pages_core::backend::{TaskBackend, TaskHandle, TaskSpec, TaskState};
use pages_core::site::{ContainerSizing, Site, User};
use pages_core::source_control::{CommitStatus, SourceControl};
use pages_core::storage::{CredentialService, ObjectStorage, StorageCredentials};
use pages_core::{
    Build, BuildId, BuildState, BuildTask, BuildTaskId, BuildUpdate, Error, Result, SiteId, UserId,
};
use pages_db::{BuildRepo, DbError, DbResult, SiteRepo};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::engine::DispatchEngine;
use crate::environment::{EnvironmentAssembler, EnvironmentSettings};
use crate::jobs::{JobContext, JobRunner};
use crate::ledger::BuildLedger;
use crate::queue::{JobKind, JobQueue, QueuedJob};
use crate::status::{ReporterSettings, StatusReporter};

pub fn make_site(id: i64, users: Vec<User>) -> Site {
    Site {
        id: SiteId::new(id),
        owner: "18f".to_string(),
        repository: "handbook".to_string(),
        default_branch: "main".to_string(),
        demo_branch: Some("demo".to_string()),
        domain: None,
        demo_domain: None,
        engine: "jekyll".to_string(),
        storage_service_name: Some("handbook-s3".to_string()),
        container: ContainerSizing::default(),
        branch_configs: vec![],
        environment: vec![],
        users,
    }
}

pub fn make_user(id: i64, token: Option<&str>, signed_in_minutes_ago: Option<i64>) -> User {
    User {
        id: UserId::new(id),
        username: format!("user{}", id),
        github_access_token: token.map(str::to_string),
        signed_in_at: signed_in_minutes_ago.map(|m| Utc::now() - ChronoDuration::minutes(m)),
    }
}

pub fn make_build(id: i64, site_id: i64, state: BuildState) -> Build {
    Build {
        id: BuildId::new(id),
        site_id: SiteId::new(site_id),
        user_id: None,
        branch: "main".to_string(),
        token: format!("build-token-{}", id),
        state,
        requested_commit_sha: Some("abc123".to_string()),
        cloned_commit_sha: None,
        error: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

pub fn make_task(id: i64, build_id: i64, state: BuildState) -> BuildTask {
    BuildTask {
        id: BuildTaskId::new(id),
        build_id: BuildId::new(build_id),
        task_type: "owasp-zap".to_string(),
        token: format!("task-token-{}", id),
        state,
        error: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

// Mirrors the COALESCE semantics of the Postgres repository.
fn write_update(
    state: &mut BuildState,
    error: &mut Option<String>,
    started_at: &mut Option<chrono::DateTime<Utc>>,
    completed_at: &mut Option<chrono::DateTime<Utc>>,
    update: &BuildUpdate,
) {
    if let Some(s) = update.state {
        *state = s;
    }
    if let Some(e) = &update.error {
        *error = Some(e.clone());
    }
    if started_at.is_none() {
        *started_at = update.started_at;
    }
    if completed_at.is_none() {
        *completed_at = update.completed_at;
    }
}

#[derive(Default)]
pub struct FakeBuildRepo {
    builds: Mutex<HashMap<BuildId, Build>>,
    tasks: Mutex<HashMap<BuildTaskId, BuildTask>>,
    written: Mutex<Vec<(BuildId, BuildState)>>,
    updates: AtomicUsize,
}

impl FakeBuildRepo {
    pub fn insert(&self, build: Build) {
        self.builds.lock().unwrap().insert(build.id, build);
    }

    pub fn insert_task(&self, task: BuildTask) {
        self.tasks.lock().unwrap().insert(task.id, task);
    }

    pub fn set_state(&self, id: BuildId, state: BuildState) {
        if let Some(build) = self.builds.lock().unwrap().get_mut(&id) {
            build.state = state;
        }
    }

    pub fn set_error(&self, id: BuildId, error: &str) {
        if let Some(build) = self.builds.lock().unwrap().get_mut(&id) {
            build.error = Some(error.to_string());
        }
    }

    pub fn build(&self, id: BuildId) -> Option<Build> {
        self.builds.lock().unwrap().get(&id).cloned()
    }

    pub fn task(&self, id: BuildTaskId) -> Option<BuildTask> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    /// States written to a build, in order.
    pub fn states_written(&self, id: BuildId) -> Vec<BuildState> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter(|(build_id, _)| *build_id == id)
            .map(|(_, state)| *state)
            .collect()
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildRepo for FakeBuildRepo {
    async fn get_build(&self, id: BuildId) -> DbResult<Build> {
        self.build(id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn get_build_task(&self, id: BuildTaskId) -> DbResult<BuildTask> {
        self.task(id)
            .ok_or_else(|| DbError::NotFound(format!("build task {}", id)))
    }

    async fn count_in_flight_builds(&self, site_id: SiteId) -> DbResult<i64> {
        let count = self
            .builds
            .lock()
            .unwrap()
            .values()
            .filter(|b| b.site_id == site_id && b.state.is_in_progress())
            .count();
        Ok(count as i64)
    }

    async fn update_build(&self, id: BuildId, update: &BuildUpdate) -> DbResult<Build> {
        let mut builds = self.builds.lock().unwrap();
        let build = builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        if let Some(sha) = &update.cloned_commit_sha {
            build.cloned_commit_sha = Some(sha.clone());
        }
        write_update(
            &mut build.state,
            &mut build.error,
            &mut build.started_at,
            &mut build.completed_at,
            update,
        );
        if let Some(state) = update.state {
            self.written.lock().unwrap().push((id, state));
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(build.clone())
    }

    async fn update_build_task(
        &self,
        id: BuildTaskId,
        update: &BuildUpdate,
    ) -> DbResult<BuildTask> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build task {}", id)))?;
        write_update(
            &mut task.state,
            &mut task.error,
            &mut task.started_at,
            &mut task.completed_at,
            update,
        );
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(task.clone())
    }
}

#[derive(Default)]
pub struct FakeSiteRepo {
    sites: Mutex<HashMap<SiteId, Site>>,
}

impl FakeSiteRepo {
    pub fn insert(&self, site: Site) {
        self.sites.lock().unwrap().insert(site.id, site);
    }

    pub fn remove(&self, id: SiteId) {
        self.sites.lock().unwrap().remove(&id);
    }
}

#[async_trait]
impl SiteRepo for FakeSiteRepo {
    async fn get_site(&self, id: SiteId) -> DbResult<Site> {
        self.sites
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("site {}", id)))
    }
}

type PollHook = Box<dyn FnOnce() + Send>;

/// Scripted task backend. Once the script runs out every poll reports
/// `Running`.
#[derive(Default)]
pub struct FakeBackend {
    start_error: Mutex<Option<Error>>,
    start_state: Mutex<Option<TaskState>>,
    polls: Mutex<VecDeque<Result<TaskState>>>,
    on_start: Mutex<Option<PollHook>>,
    before_first_poll: Mutex<Option<PollHook>>,
    last_spec: Mutex<Option<TaskSpec>>,
    cancel_fails: AtomicBool,
    starts: AtomicUsize,
    poll_count: AtomicUsize,
    cancels: AtomicUsize,
}

impl FakeBackend {
    pub fn script_polls(&self, polls: Vec<Result<TaskState>>) {
        *self.polls.lock().unwrap() = polls.into();
    }

    pub fn fail_start(&self, err: Error) {
        *self.start_error.lock().unwrap() = Some(err);
    }

    pub fn start_in(&self, state: TaskState) {
        *self.start_state.lock().unwrap() = Some(state);
    }

    pub fn fail_cancel(&self) {
        self.cancel_fails.store(true, Ordering::SeqCst);
    }

    /// Run `hook` inside `start_task`, before the handle is returned.
    pub fn on_start(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_start.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn before_first_poll(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_first_poll.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn last_spec(&self) -> Option<TaskSpec> {
        self.last_spec.lock().unwrap().clone()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn start_task(&self, spec: TaskSpec) -> Result<TaskHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.start_error.lock().unwrap().take() {
            return Err(err);
        }
        let handle = TaskHandle {
            id: format!("fake-{}", spec.correlation_id),
            correlation_id: spec.correlation_id.clone(),
            backend: self.name().to_string(),
            initial_state: self
                .start_state
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(TaskState::Pending),
        };
        *self.last_spec.lock().unwrap() = Some(spec);
        let hook = self.on_start.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(handle)
    }

    async fn fetch_task_status(&self, _handle: &TaskHandle) -> Result<TaskState> {
        let hook = self.before_first_poll.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(TaskState::Running))
    }

    async fn cancel_task(&self, _handle: &TaskHandle) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.cancel_fails.load(Ordering::SeqCst) {
            return Err(Error::Backend("task not found".to_string()));
        }
        Ok(())
    }
}

/// Grants push to a fixed set of tokens and records what it was asked.
#[derive(Default)]
pub struct FakeSourceControl {
    allowed: HashSet<String>,
    failing: HashSet<String>,
    checked: Mutex<Vec<String>>,
    statuses: Mutex<Vec<(String, CommitStatus)>>,
}

impl FakeSourceControl {
    pub fn allowing(tokens: &[&str]) -> Self {
        Self {
            allowed: tokens.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failing_for(mut self, token: &str) -> Self {
        self.failing.insert(token.to_string());
        self
    }

    pub fn checked(&self) -> Vec<String> {
        self.checked.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<(String, CommitStatus)> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceControl for FakeSourceControl {
    async fn check_push_permission(&self, token: &str, _owner: &str, _repo: &str) -> Result<bool> {
        self.checked.lock().unwrap().push(token.to_string());
        if self.failing.contains(token) {
            return Err(Error::Backend("bad credentials".to_string()));
        }
        Ok(self.allowed.contains(token))
    }

    async fn set_commit_status(&self, token: &str, status: &CommitStatus) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((token.to_string(), status.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCredentials {
    failure: Mutex<Option<String>>,
}

impl FakeCredentials {
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl CredentialService for FakeCredentials {
    async fn fetch_storage_credentials(&self, _service_name: &str) -> Result<StorageCredentials> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(Error::Backend(message));
        }
        Ok(StorageCredentials {
            access_key_id: "AKIAEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            region: "us-gov-west-1".to_string(),
            bucket: "site-bucket".to_string(),
        })
    }
}

#[derive(Default)]
pub struct FakeStorage {
    verifications: AtomicUsize,
    fails: AtomicBool,
}

impl FakeStorage {
    pub fn fail_verification(&self) {
        self.fails.store(true, Ordering::SeqCst);
    }

    pub fn verify_count(&self) -> usize {
        self.verifications.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn verify_bucket_ready(
        &self,
        credentials: &StorageCredentials,
        timeout: Duration,
    ) -> Result<()> {
        self.verifications.fetch_add(1, Ordering::SeqCst);
        if self.fails.load(Ordering::SeqCst) {
            return Err(Error::BackendTimeout(format!(
                "bucket {} not ready after {:?}",
                credentials.bucket, timeout
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeQueue {
    pending: Mutex<VecDeque<QueuedJob>>,
    completed: Mutex<Vec<Uuid>>,
    failed: Mutex<Vec<(Uuid, String)>>,
}

impl FakeQueue {
    pub fn completed(&self) -> Vec<Uuid> {
        self.completed.lock().unwrap().clone()
    }

    pub fn failed(&self) -> Vec<(Uuid, String)> {
        self.failed.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobQueue for FakeQueue {
    async fn enqueue(&self, kind: JobKind, record_id: i64) -> DbResult<QueuedJob> {
        let job = QueuedJob {
            id: Uuid::now_v7(),
            kind,
            record_id,
            attempts: 0,
            claimed_by: None,
        };
        self.pending.lock().unwrap().push_back(job.clone());
        Ok(job)
    }

    async fn claim(&self, worker_id: &str) -> DbResult<Option<QueuedJob>> {
        Ok(self.pending.lock().unwrap().pop_front().map(|mut job| {
            job.attempts += 1;
            job.claimed_by = Some(worker_id.to_string());
            job
        }))
    }

    async fn complete(&self, job_id: Uuid) -> DbResult<()> {
        self.completed.lock().unwrap().push(job_id);
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> DbResult<()> {
        self.failed.lock().unwrap().push((job_id, error.to_string()));
        Ok(())
    }
}

/// Site 7 with one pushing user and build 42 waiting to be dispatched.
pub struct Harness {
    pub builds: Arc<FakeBuildRepo>,
    pub sites: Arc<FakeSiteRepo>,
    pub backend: Arc<FakeBackend>,
    pub github: Arc<FakeSourceControl>,
    pub credentials: Arc<FakeCredentials>,
    pub storage: Arc<FakeStorage>,
    policy: PollPolicy,
}

impl Harness {
    pub fn new(policy: PollPolicy) -> Self {
        Self::with_github(policy, &["token"])
    }

    pub fn with_github(policy: PollPolicy, allowed: &[&str]) -> Self {
        let builds = Arc::new(FakeBuildRepo::default());
        builds.insert(make_build(42, 7, BuildState::Created));
        let sites = Arc::new(FakeSiteRepo::default());
        sites.insert(make_site(7, vec![make_user(1, Some("token"), Some(10))]));

        Self {
            builds,
            sites,
            backend: Arc::new(FakeBackend::default()),
            github: Arc::new(FakeSourceControl::allowing(allowed)),
            credentials: Arc::new(FakeCredentials::default()),
            storage: Arc::new(FakeStorage::default()),
            policy,
        }
    }

    pub fn context(&self) -> JobContext {
        let reporter = StatusReporter::new(
            self.github.clone(),
            ReporterSettings {
                app_url: "https://admin.example.gov".to_string(),
                proxy_domain: "sites.example.gov".to_string(),
                context: "pages/build".to_string(),
            },
        );
        let ledger = BuildLedger::new(self.builds.clone(), self.sites.clone())
            .with_reporter(Arc::new(reporter));
        let assembler = EnvironmentAssembler::new(
            self.builds.clone(),
            self.credentials.clone(),
            self.storage.clone(),
            EnvironmentSettings {
                app_url: "https://admin.example.gov".to_string(),
                provisioning_timeout: Duration::from_secs(15),
            },
        );

        JobContext {
            builds: self.builds.clone(),
            sites: self.sites.clone(),
            source_control: self.github.clone(),
            assembler: Arc::new(assembler),
            ledger: Arc::new(ledger),
            site_build_policy: self.policy,
            build_task_policy: self.policy,
        }
    }

    pub fn engine(&self) -> DispatchEngine {
        DispatchEngine::new(self.backend.clone())
    }

    pub fn runner(&self) -> JobRunner {
        JobRunner::new(self.engine(), self.context())
    }

    pub fn build(&self, id: i64) -> Build {
        self.builds.build(BuildId::new(id)).expect("build exists")
    }

    pub fn task(&self, id: i64) -> BuildTask {
        self.builds
            .task(BuildTaskId::new(id))
            .expect("task exists")
    }
}
