//! Build lifecycle state machine.
//!
//! Builds and build tasks share one lifecycle:
//!
//! ```text
//! created -> queued -> tasked -> processing -> success | error
//! ```
//!
//! `skipped` is an alternate terminal outcome set out of band. Status can
//! arrive from two independent writers (the dispatch worker and the status
//! callback), so [`apply_status`] is idempotent and only ever produces the
//! attributes that actually change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::redact::redact_credentials;
use crate::{BuildId, BuildTaskId, Error, SiteId, UserId};

/// Message stored when a build fails without saying why.
pub const UNKNOWN_FAILURE_MESSAGE: &str = "The build failed for an unknown reason";

/// Lifecycle state of a build or build task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Created,
    Queued,
    Tasked,
    Processing,
    Error,
    Success,
    Skipped,
}

impl BuildState {
    pub const ALL: [BuildState; 7] = [
        BuildState::Created,
        BuildState::Queued,
        BuildState::Tasked,
        BuildState::Processing,
        BuildState::Error,
        BuildState::Success,
        BuildState::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Created => "created",
            BuildState::Queued => "queued",
            BuildState::Tasked => "tasked",
            BuildState::Processing => "processing",
            BuildState::Error => "error",
            BuildState::Success => "success",
            BuildState::Skipped => "skipped",
        }
    }

    /// States a build can be in before work has finished.
    pub fn in_progress_states() -> &'static [BuildState] {
        &[
            BuildState::Created,
            BuildState::Queued,
            BuildState::Tasked,
            BuildState::Processing,
        ]
    }

    pub fn is_in_progress(&self) -> bool {
        is_in_progress(*self)
    }

    pub fn is_complete(&self) -> bool {
        is_complete(*self)
    }

    /// Complete or skipped: no further automated transition is expected.
    pub fn is_terminal(&self) -> bool {
        is_complete(*self) || *self == BuildState::Skipped
    }

    /// Position along the happy path. Terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            BuildState::Created => 0,
            BuildState::Queued => 1,
            BuildState::Tasked => 2,
            BuildState::Processing => 3,
            BuildState::Error | BuildState::Success | BuildState::Skipped => 4,
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BuildState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown build state: {}", s)))
    }
}

/// Whether an incoming status marks the point where work starts.
///
/// Only records that have not yet started can start, so a late `processing`
/// update never reopens a build that has moved past it.
pub fn can_start(current: BuildState, incoming: BuildState) -> bool {
    matches!(
        current,
        BuildState::Created | BuildState::Queued | BuildState::Tasked
    ) && incoming == BuildState::Processing
}

pub fn can_complete(incoming: BuildState) -> bool {
    matches!(incoming, BuildState::Error | BuildState::Success)
}

pub fn is_in_progress(state: BuildState) -> bool {
    matches!(
        state,
        BuildState::Created | BuildState::Queued | BuildState::Tasked | BuildState::Processing
    )
}

pub fn is_complete(state: BuildState) -> bool {
    matches!(state, BuildState::Error | BuildState::Success)
}

/// A status report for a build or task, from the worker or the callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: BuildState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "commitSha")]
    pub commit_sha: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: BuildState) -> Self {
        Self {
            status,
            message: None,
            commit_sha: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(BuildState::Error).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_commit_sha(mut self, sha: impl Into<String>) -> Self {
        self.commit_sha = Some(sha.into());
        self
    }
}

/// The attributes a status application changes. `None` means untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildUpdate {
    pub state: Option<BuildState>,
    pub cloned_commit_sha: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BuildUpdate {
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.cloned_commit_sha.is_none()
            && self.error.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
    }

    /// Fold this update into an in-memory record.
    pub fn apply_to<R: LifecycleRecord + ?Sized>(&self, record: &mut R) {
        record.merge(self);
    }
}

/// Read/write access to the lifecycle attributes of a record.
pub trait LifecycleRecord {
    fn state(&self) -> BuildState;
    fn started_at(&self) -> Option<DateTime<Utc>>;
    fn completed_at(&self) -> Option<DateTime<Utc>>;
    fn error(&self) -> Option<&str>;

    fn cloned_commit_sha(&self) -> Option<&str> {
        None
    }

    /// Write every set attribute of `update` onto the record.
    fn merge(&mut self, update: &BuildUpdate);
}

/// Compute the attributes to persist for an incoming status.
///
/// Applying the same status twice yields an empty update the second time.
/// A status that ranks behind the current state is ignored, so the record
/// never moves backwards. Once a record is terminal its state, error and
/// timestamps are frozen; only a newly reported cloned commit is still
/// recorded.
pub fn apply_status<R: LifecycleRecord + ?Sized>(
    record: &R,
    status: &StatusUpdate,
    at: DateTime<Utc>,
) -> BuildUpdate {
    let mut update = BuildUpdate::default();
    let current = record.state();

    if let Some(sha) = status.commit_sha.as_deref().filter(|sha| !sha.is_empty()) {
        if record.cloned_commit_sha() != Some(sha) {
            update.cloned_commit_sha = Some(sha.to_string());
        }
    }

    if current.is_terminal() || status.status.rank() < current.rank() {
        return update;
    }

    if current != status.status {
        update.state = Some(status.status);
    }

    if status.status == BuildState::Error {
        let message = redact_credentials(
            status
                .message
                .as_deref()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(UNKNOWN_FAILURE_MESSAGE),
        );
        if record.error() != Some(message.as_str()) {
            update.error = Some(message);
        }
    }

    if can_complete(status.status) && record.completed_at().is_none() {
        update.completed_at = Some(at);
    }

    if can_start(current, status.status) && record.started_at().is_none() {
        update.started_at = Some(at);
    }

    update
}

/// A request to render and publish one site branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub site_id: SiteId,
    /// Initiating user; absent for externally triggered builds.
    pub user_id: Option<UserId>,
    pub branch: String,
    /// Secret authenticating status callbacks for this build.
    #[serde(skip_serializing)]
    pub token: String,
    pub state: BuildState,
    pub requested_commit_sha: Option<String>,
    pub cloned_commit_sha: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Build {
    /// The commit to report status against: what was cloned, else what was asked for.
    pub fn reported_commit_sha(&self) -> Option<&str> {
        self.cloned_commit_sha
            .as_deref()
            .filter(|sha| !sha.is_empty())
            .or(self.requested_commit_sha.as_deref())
            .filter(|sha| !sha.is_empty())
    }
}

impl LifecycleRecord for Build {
    fn state(&self) -> BuildState {
        self.state
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn cloned_commit_sha(&self) -> Option<&str> {
        self.cloned_commit_sha.as_deref()
    }

    fn merge(&mut self, update: &BuildUpdate) {
        if let Some(state) = update.state {
            self.state = state;
        }
        if let Some(sha) = &update.cloned_commit_sha {
            self.cloned_commit_sha = Some(sha.clone());
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
    }
}

/// A named unit of work run against a build's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: BuildTaskId,
    pub build_id: BuildId,
    /// Name of the task type, e.g. `owasp-zap`.
    pub task_type: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub state: BuildState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LifecycleRecord for BuildTask {
    fn state(&self) -> BuildState {
        self.state
    }

    fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn merge(&mut self, update: &BuildUpdate) {
        if let Some(state) = update.state {
            self.state = state;
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
    }
}
