//! Source-control backend abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{BuildState, Result};

/// Commit status as the source-control system understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Error,
}

impl CommitState {
    /// Map a build state to a commit state. Skipped builds are not reported.
    pub fn from_build_state(state: BuildState) -> Option<Self> {
        match state {
            s if s.is_in_progress() => Some(CommitState::Pending),
            BuildState::Success => Some(CommitState::Success),
            BuildState::Error => Some(CommitState::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Error => "error",
        }
    }
}

/// A commit status to publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub state: CommitState,
    pub target_url: String,
    pub description: String,
    /// Label grouping statuses from this system, e.g. `pages/build`.
    pub context: String,
}

/// Trait for source-control backends.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Whether `token` may push to `owner/repo`.
    async fn check_push_permission(&self, token: &str, owner: &str, repo: &str) -> Result<bool>;

    /// Publish a commit status using `token`.
    async fn set_commit_status(&self, token: &str, status: &CommitStatus) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_state_mapping() {
        for state in BuildState::in_progress_states() {
            assert_eq!(
                CommitState::from_build_state(*state),
                Some(CommitState::Pending)
            );
        }
        assert_eq!(
            CommitState::from_build_state(BuildState::Success),
            Some(CommitState::Success)
        );
        assert_eq!(
            CommitState::from_build_state(BuildState::Error),
            Some(CommitState::Error)
        );
        assert_eq!(CommitState::from_build_state(BuildState::Skipped), None);
    }
}
