//! GitHub API client for repository permissions and commit statuses.

use async_trait::async_trait;
use pages_core::source_control::{CommitStatus, SourceControl};
use serde::{Deserialize, Serialize};

/// GitHub API client.
///
/// Unlike most clients this one is not bound to a token: each call is made
/// with whichever user credential the caller resolved.
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
}

impl GitHubClient {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn repo_url(&self, owner: &str, repo: &str) -> String {
        format!(
            "{}/repos/{}/{}",
            self.api_url,
            urlencoding::encode(owner),
            urlencoding::encode(repo)
        )
    }

    fn status_url(&self, status: &CommitStatus) -> String {
        format!(
            "{}/statuses/{}",
            self.repo_url(&status.owner, &status.repo),
            urlencoding::encode(&status.sha)
        )
    }

    /// Get a repository as seen by the token's user.
    pub async fn get_repo(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<Option<GitHubRepo>, GitHubError> {
        let response = self
            .client
            .get(self.repo_url(owner, repo))
            .header("Authorization", format!("Bearer {}", token))
            .header("User-Agent", "Pages-Builder")
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        // GitHub answers 404 for private repositories the user cannot see.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api(format!(
                "Failed to get repo ({}): {}",
                status, text
            )));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| GitHubError::Parse(e.to_string()))
    }

    /// Create a commit status.
    pub async fn create_status(
        &self,
        token: &str,
        status: &CommitStatus,
    ) -> Result<(), GitHubError> {
        let response = self
            .client
            .post(self.status_url(status))
            .header("Authorization", format!("Bearer {}", token))
            .header("User-Agent", "Pages-Builder")
            .header("Accept", "application/vnd.github+json")
            .json(&StatusPayload::from(status))
            .send()
            .await
            .map_err(|e| GitHubError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status_code = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GitHubError::Api(format!(
                "Failed to create status ({}): {}",
                status_code, text
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl SourceControl for GitHubClient {
    async fn check_push_permission(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> pages_core::Result<bool> {
        let repo = self.get_repo(token, owner, repo).await?;
        Ok(repo
            .and_then(|r| r.permissions)
            .is_some_and(|p| p.push))
    }

    async fn set_commit_status(
        &self,
        token: &str,
        status: &CommitStatus,
    ) -> pages_core::Result<()> {
        self.create_status(token, status).await?;
        Ok(())
    }
}

/// Body of `POST /repos/{owner}/{repo}/statuses/{sha}`.
#[derive(Debug, Serialize)]
struct StatusPayload<'a> {
    state: &'static str,
    target_url: &'a str,
    description: &'a str,
    context: &'a str,
}

impl<'a> From<&'a CommitStatus> for StatusPayload<'a> {
    fn from(status: &'a CommitStatus) -> Self {
        Self {
            state: status.state.as_str(),
            target_url: &status.target_url,
            description: &status.description,
            context: &status.context,
        }
    }
}

/// GitHub repository information.
#[derive(Debug, Serialize, Deserialize)]
pub struct GitHubRepo {
    pub id: i64,
    pub full_name: String,
    pub private: bool,
    pub default_branch: String,
    /// Present when the request was authenticated.
    pub permissions: Option<RepoPermissions>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RepoPermissions {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub pull: bool,
}

/// GitHub API errors.
#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<GitHubError> for pages_core::Error {
    fn from(err: GitHubError) -> Self {
        pages_core::Error::Backend(format!("github: {}", err))
    }
}
