//! Sites, their users, and per-branch configuration.
//!
//! These records are owned by the admin side of the platform; the build
//! pipeline only reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SiteId, UserId};

/// A published site backed by a GitHub repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub owner: String,
    pub repository: String,
    pub default_branch: String,
    pub demo_branch: Option<String>,
    /// Custom domain serving the default branch.
    pub domain: Option<String>,
    /// Custom domain serving the demo branch.
    pub demo_domain: Option<String>,
    /// Static site generator, e.g. `jekyll`, `hugo`, `node.js`, `static`.
    pub engine: String,
    /// Name of the storage service instance holding this site's bucket.
    pub storage_service_name: Option<String>,
    pub container: ContainerSizing,
    pub branch_configs: Vec<SiteBranchConfig>,
    pub environment: Vec<EnvironmentVariable>,
    /// Users authorized on this site.
    pub users: Vec<User>,
}

impl Site {
    pub fn branch_context(&self, branch: &str) -> BranchContext {
        if branch == self.default_branch {
            BranchContext::Site
        } else if self.demo_branch.as_deref() == Some(branch) {
            BranchContext::Demo
        } else {
            BranchContext::Preview
        }
    }

    /// Storage key prefix a branch publishes under.
    pub fn path_prefix(&self, branch: &str) -> String {
        match self.branch_context(branch) {
            BranchContext::Site => format!("site/{}/{}", self.owner, self.repository),
            BranchContext::Demo => format!("demo/{}/{}", self.owner, self.repository),
            BranchContext::Preview => {
                format!("preview/{}/{}/{}", self.owner, self.repository, branch)
            }
        }
    }

    fn custom_domain(&self, branch: &str) -> Option<&str> {
        match self.branch_context(branch) {
            BranchContext::Site => self.domain.as_deref(),
            BranchContext::Demo => self.demo_domain.as_deref(),
            BranchContext::Preview => None,
        }
        .filter(|d| !d.is_empty())
    }

    /// Base URL the generator should render links against.
    ///
    /// Branches served from their own domain render at the root.
    pub fn base_url(&self, branch: &str) -> String {
        match self.custom_domain(branch) {
            Some(_) => String::new(),
            None => format!("/{}", self.path_prefix(branch)),
        }
    }

    /// Public URL where a branch can be viewed once published.
    pub fn view_url(&self, branch: &str, proxy_domain: &str) -> String {
        match self.custom_domain(branch) {
            Some(domain) if domain.starts_with("http") => domain.trim_end_matches('/').to_string(),
            Some(domain) => format!("https://{}", domain.trim_end_matches('/')),
            None => format!(
                "https://{}/{}/",
                proxy_domain.trim_end_matches('/'),
                self.path_prefix(branch)
            ),
        }
    }

    /// Configuration for a branch: an exact branch match wins over the context default.
    pub fn branch_config(&self, branch: &str) -> Option<&SiteBranchConfig> {
        self.branch_configs
            .iter()
            .find(|c| c.branch.as_deref() == Some(branch))
            .or_else(|| {
                let context = self.branch_context(branch);
                self.branch_configs
                    .iter()
                    .find(|c| c.branch.is_none() && c.context == context)
            })
    }

    pub fn has_member(&self, user_id: UserId) -> bool {
        self.users.iter().any(|u| u.id == user_id)
    }

    pub fn member(&self, user_id: UserId) -> Option<&User> {
        self.users.iter().find(|u| u.id == user_id)
    }
}

/// Which published context a branch builds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchContext {
    Site,
    Demo,
    Preview,
}

impl BranchContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchContext::Site => "site",
            BranchContext::Demo => "demo",
            BranchContext::Preview => "preview",
        }
    }
}

/// Generator configuration attached to a branch or a whole context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteBranchConfig {
    /// Exact branch this applies to; `None` applies to every branch in `context`.
    pub branch: Option<String>,
    pub context: BranchContext,
    pub config: serde_json::Value,
}

/// A user-supplied environment variable passed through to the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

/// Container class a site's builds run in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSizing {
    /// Named container class selecting an alternate build image.
    pub name: Option<String>,
    pub size: ContainerSize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerSize {
    #[default]
    Regular,
    Large,
}

impl ContainerSize {
    /// Memory limit in megabytes.
    pub fn memory_mb(&self) -> u64 {
        match self {
            ContainerSize::Regular => 2048,
            ContainerSize::Large => 8192,
        }
    }

    /// Disk limit in megabytes.
    pub fn disk_mb(&self) -> u64 {
        match self {
            ContainerSize::Regular => 4096,
            ContainerSize::Large => 7168,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "regular" => Some(ContainerSize::Regular),
            "large" => Some(ContainerSize::Large),
            _ => None,
        }
    }
}

/// A platform user who may hold a GitHub credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing)]
    pub github_access_token: Option<String>,
    pub signed_in_at: Option<DateTime<Utc>>,
}
