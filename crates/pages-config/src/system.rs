//! System configuration parsing.
//!
//! ```kdl
//! app-url "https://pages.example.gov"
//! proxy-domain "sites.pages.example.gov"
//!
//! worker {
//!     concurrency 4
//!     site-build interval=30 attempts=120
//!     build-task interval=25 attempts=144
//!     provisioning-timeout 15
//! }
//!
//! backend "kubernetes" namespace="pages-builds" {
//!     image "ghcr.io/example/pages-build:latest"
//!     container "exp" image="ghcr.io/example/pages-build:exp"
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_STATUS_CONTEXT: &str = "pages/build";

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Public URL of this service; status callbacks and log links hang off it.
    pub app_url: String,
    /// Domain serving sites without a custom domain.
    pub proxy_domain: String,
    /// Address the callback server listens on.
    pub listen: String,
    pub database_url: Option<String>,
    pub worker: WorkerConfig,
    pub backend: BackendConfig,
    pub github: GitHubConfig,
    pub storage: StorageConfig,
}

/// How often and how long the worker polls a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Site builds: 30s x 120 attempts.
    pub fn site_build() -> Self {
        Self::new(Duration::from_secs(30), 120)
    }

    /// Build tasks: 25s x 144 attempts.
    pub fn build_task() -> Self {
        Self::new(Duration::from_secs(25), 144)
    }

    /// Total time the worker waits before giving up on a task.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker loops per process.
    pub concurrency: usize,
    pub site_build: PollPolicy,
    pub build_task: PollPolicy,
    /// Upper bound on waiting for a site's bucket to accept new credentials.
    pub provisioning_timeout: Duration,
    /// Delay between queue claims when the queue is empty.
    pub idle_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            site_build: PollPolicy::site_build(),
            build_task: PollPolicy::build_task(),
            provisioning_timeout: Duration::from_secs(15),
            idle_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Docker,
    Kubernetes { namespace: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Default build image.
    pub image: String,
    /// Named container classes mapped to alternate images.
    pub containers: HashMap<String, String>,
}

impl BackendConfig {
    /// Image for a container class, falling back to the default image.
    pub fn image_for(&self, container: Option<&str>) -> &str {
        container
            .and_then(|name| self.containers.get(name))
            .map(|s| s.as_str())
            .unwrap_or(&self.image)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub api_url: String,
    pub status_context: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_GITHUB_API_URL.to_string(),
            status_context: DEFAULT_STATUS_CONTEXT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// API issuing storage service credentials.
    pub credentials_url: Option<String>,
    /// Bearer token for the credentials API.
    pub credentials_token: Option<String>,
    /// S3-compatible endpoint; `None` targets AWS virtual-hosted buckets.
    pub endpoint: Option<String>,
}

impl SystemConfig {
    /// Override values from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Override values from `lookup`: `DATABASE_URL`, `GITHUB_API_URL`,
    /// `PAGES_CREDENTIALS_URL`, `PAGES_CREDENTIALS_TOKEN`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(url) = lookup("GITHUB_API_URL") {
            self.github.api_url = url;
        }
        if let Some(url) = lookup("PAGES_CREDENTIALS_URL") {
            self.storage.credentials_url = Some(url);
        }
        if let Some(token) = lookup("PAGES_CREDENTIALS_TOKEN") {
            self.storage.credentials_token = Some(token);
        }
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut app_url = None;
    let mut proxy_domain = None;
    let mut listen = DEFAULT_LISTEN.to_string();
    let mut database_url = None;
    let mut worker = WorkerConfig::default();
    let mut backend = None;
    let mut github = GitHubConfig::default();
    let mut storage = StorageConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "app-url" => {
                let url = require_string_arg(node, "app-url")?;
                url::Url::parse(&url).map_err(|e| ConfigError::InvalidValue {
                    field: "app-url".to_string(),
                    message: e.to_string(),
                })?;
                app_url = Some(url.trim_end_matches('/').to_string());
            }
            "proxy-domain" => proxy_domain = Some(require_string_arg(node, "proxy-domain")?),
            "listen" => listen = require_string_arg(node, "listen")?,
            "database-url" => database_url = Some(require_string_arg(node, "database-url")?),
            "worker" => worker = parse_worker(node)?,
            "backend" => backend = Some(parse_backend(node)?),
            "github" => github = parse_github(node)?,
            "storage" => storage = parse_storage(node)?,
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(SystemConfig {
        app_url: app_url.ok_or_else(|| ConfigError::MissingField("app-url".to_string()))?,
        proxy_domain: proxy_domain
            .ok_or_else(|| ConfigError::MissingField("proxy-domain".to_string()))?,
        listen,
        database_url,
        worker,
        backend: backend.ok_or_else(|| ConfigError::MissingField("backend".to_string()))?,
        github,
        storage,
    })
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerConfig> {
    let mut worker = WorkerConfig::default();

    let Some(children) = node.children() else {
        return Ok(worker);
    };

    for child in children.nodes() {
        match child.name().value() {
            "concurrency" => {
                let n = require_positive_arg(child, "worker.concurrency")?;
                worker.concurrency = n as usize;
            }
            "site-build" => worker.site_build = parse_poll_policy(child, worker.site_build)?,
            "build-task" => worker.build_task = parse_poll_policy(child, worker.build_task)?,
            "provisioning-timeout" => {
                let secs = require_positive_arg(child, "worker.provisioning-timeout")?;
                worker.provisioning_timeout = Duration::from_secs(secs);
            }
            "idle-delay-ms" => {
                let ms = require_positive_arg(child, "worker.idle-delay-ms")?;
                worker.idle_delay = Duration::from_millis(ms);
            }
            _ => {}
        }
    }

    Ok(worker)
}

fn parse_poll_policy(node: &KdlNode, defaults: PollPolicy) -> ConfigResult<PollPolicy> {
    let field = node.name().value();
    let interval = match get_int_prop(node, "interval") {
        Some(secs) => Duration::from_secs(positive(secs, &format!("{}.interval", field))?),
        None => defaults.interval,
    };
    let max_attempts = match get_int_prop(node, "attempts") {
        Some(n) => {
            let n = positive(n, &format!("{}.attempts", field))?;
            u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
                field: format!("{}.attempts", field),
                message: format!("{} is too large", n),
            })?
        }
        None => defaults.max_attempts,
    };
    Ok(PollPolicy::new(interval, max_attempts))
}

fn parse_backend(node: &KdlNode) -> ConfigResult<BackendConfig> {
    let kind_name = get_first_string_arg(node).unwrap_or_else(|| "docker".to_string());
    let kind = match kind_name.as_str() {
        "docker" => BackendKind::Docker,
        "kubernetes" => BackendKind::Kubernetes {
            namespace: get_string_prop(node, "namespace").unwrap_or_else(|| "default".to_string()),
        },
        other => {
            return Err(ConfigError::InvalidValue {
                field: "backend".to_string(),
                message: format!("unknown backend type: {}", other),
            });
        }
    };

    let mut image = None;
    let mut containers = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => image = Some(require_string_arg(child, "backend.image")?),
                "container" => {
                    let name = require_string_arg(child, "backend.container")?;
                    let image = get_string_prop(child, "image").ok_or_else(|| {
                        ConfigError::MissingField(format!("backend.container {} image", name))
                    })?;
                    if containers.insert(name.clone(), image).is_some() {
                        return Err(ConfigError::Duplicate(format!("container {}", name)));
                    }
                }
                _ => {}
            }
        }
    }

    Ok(BackendConfig {
        kind,
        image: image.ok_or_else(|| ConfigError::MissingField("backend.image".to_string()))?,
        containers,
    })
}

fn parse_github(node: &KdlNode) -> ConfigResult<GitHubConfig> {
    let mut github = GitHubConfig::default();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "api-url" => github.api_url = require_string_arg(child, "github.api-url")?,
                "status-context" => {
                    github.status_context = require_string_arg(child, "github.status-context")?
                }
                _ => {}
            }
        }
    }
    Ok(github)
}

fn parse_storage(node: &KdlNode) -> ConfigResult<StorageConfig> {
    let mut storage = StorageConfig::default();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "credentials-url" => {
                    storage.credentials_url =
                        Some(require_string_arg(child, "storage.credentials-url")?)
                }
                "endpoint" => {
                    storage.endpoint = Some(require_string_arg(child, "storage.endpoint")?)
                }
                _ => {}
            }
        }
    }
    Ok(storage)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn require_string_arg(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn require_positive_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value =
        get_first_int_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    positive(value, field)
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

fn positive(value: i128, field: &str) -> ConfigResult<u64> {
    if value <= 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("must be positive, got {}", value),
        });
    }
    u64::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} is too large", value),
    })
}
