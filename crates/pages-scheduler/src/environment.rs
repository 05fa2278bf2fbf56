//! Assembles the environment a build container runs with.
//!
//! Besides the flat variable map, assembly is where a site's storage bucket
//! is provisioned: freshly issued storage credentials take a while to become
//! usable, so the first build for a site waits for the bucket before it is
//! dispatched.

use pages_core::backend::TaskSpec;
use pages_core::site::Site;
use pages_core::storage::{CredentialService, ObjectStorage, StorageCredentials};
use pages_core::{Build, BuildTask, Error, Result};
use pages_db::BuildRepo;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Settings shared by every assembled environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    /// Base URL of the admin application, without a trailing slash.
    pub app_url: String,
    /// Upper bound on waiting for a new bucket to accept requests.
    pub provisioning_timeout: Duration,
}

pub struct EnvironmentAssembler {
    builds: Arc<dyn BuildRepo>,
    credentials: Arc<dyn CredentialService>,
    storage: Arc<dyn ObjectStorage>,
    settings: EnvironmentSettings,
}

impl EnvironmentAssembler {
    pub fn new(
        builds: Arc<dyn BuildRepo>,
        credentials: Arc<dyn CredentialService>,
        storage: Arc<dyn ObjectStorage>,
        settings: EnvironmentSettings,
    ) -> Self {
        Self {
            builds,
            credentials,
            storage,
            settings,
        }
    }

    pub fn build_callback_url(&self, build: &Build) -> String {
        format!(
            "{}/v0/build/{}/status/{}",
            self.settings.app_url, build.id, build.token
        )
    }

    pub fn task_callback_url(&self, task: &BuildTask) -> String {
        format!(
            "{}/v0/tasks/{}/status/{}",
            self.settings.app_url, task.id, task.token
        )
    }

    /// Task spec for a site build.
    ///
    /// The bucket is verified only while this build is the site's sole
    /// in-flight build. The count is read without a lock, so two builds that
    /// are both in flight before either assembles will both skip the wait.
    pub async fn site_build_spec(
        &self,
        build: &Build,
        site: &Site,
        github_token: Option<&str>,
        correlation_id: &str,
    ) -> Result<TaskSpec> {
        let credentials = self.storage_credentials(site).await?;

        let in_flight = self
            .builds
            .count_in_flight_builds(site.id)
            .await
            .map_err(|e| infrastructure("Unable to count in-flight builds", e.into()))?;
        if in_flight <= 1 {
            info!(site_id = %site.id, bucket = %credentials.bucket, "Waiting for bucket");
            self.storage
                .verify_bucket_ready(&credentials, self.settings.provisioning_timeout)
                .await
                .map_err(|e| infrastructure("Storage bucket is not ready", e))?;
        } else {
            debug!(site_id = %site.id, in_flight, "Bucket already provisioned for site");
        }

        let mut env = repository_env(build, site, &credentials);
        env.insert("BUILD_ID".into(), build.id.to_string());
        env.insert("STATUS_CALLBACK".into(), self.build_callback_url(build));
        env.insert("GENERATOR".into(), site.engine.clone());
        env.insert("BASEURL".into(), site.base_url(&build.branch));
        env.insert(
            "BRANCH_CONTEXT".into(),
            site.branch_context(&build.branch).as_str().to_string(),
        );
        if let Some(sha) = build.requested_commit_sha.as_deref().filter(|s| !s.is_empty()) {
            env.insert("COMMIT_SHA".into(), sha.to_string());
        }
        if let Some(config) = site.branch_config(&build.branch) {
            env.insert("SITE_CONFIG".into(), to_json(&config.config)?);
        }
        env.insert(
            "USER_ENVIRONMENT_VARIABLES".into(),
            to_json(&site.environment)?,
        );
        if let Some(token) = github_token {
            env.insert("GITHUB_TOKEN".into(), token.to_string());
        }

        Ok(TaskSpec {
            correlation_id: correlation_id.to_string(),
            label: format!("build-{}", build.id),
            env,
            sizing: site.container.clone(),
        })
    }

    /// Task spec for a build task. The parent build already provisioned the
    /// bucket, so this never waits on it.
    pub async fn build_task_spec(
        &self,
        task: &BuildTask,
        build: &Build,
        site: &Site,
        correlation_id: &str,
    ) -> Result<TaskSpec> {
        let credentials = self.storage_credentials(site).await?;

        let mut env = repository_env(build, site, &credentials);
        env.insert("BUILD_ID".into(), build.id.to_string());
        env.insert("TASK_ID".into(), task.id.to_string());
        env.insert("TASK_TYPE".into(), task.task_type.clone());
        env.insert("STATUS_CALLBACK".into(), self.task_callback_url(task));

        Ok(TaskSpec {
            correlation_id: correlation_id.to_string(),
            label: format!("task-{}", task.id),
            env,
            sizing: site.container.clone(),
        })
    }

    async fn storage_credentials(&self, site: &Site) -> Result<StorageCredentials> {
        let service_name = site
            .storage_service_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Error::Infrastructure(format!("site {} has no storage service", site.id))
            })?;

        self.credentials
            .fetch_storage_credentials(service_name)
            .await
            .map_err(|e| {
                infrastructure(
                    &format!("Unable to fetch credentials for {}", service_name),
                    e,
                )
            })
    }
}

fn repository_env(
    build: &Build,
    site: &Site,
    credentials: &StorageCredentials,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("OWNER".to_string(), site.owner.clone()),
        ("REPOSITORY".to_string(), site.repository.clone()),
        ("BRANCH".to_string(), build.branch.clone()),
        ("SITE_PREFIX".to_string(), site.path_prefix(&build.branch)),
        ("BUCKET".to_string(), credentials.bucket.clone()),
        ("AWS_DEFAULT_REGION".to_string(), credentials.region.clone()),
        (
            "AWS_ACCESS_KEY_ID".to_string(),
            credentials.access_key_id.clone(),
        ),
        (
            "AWS_SECRET_ACCESS_KEY".to_string(),
            credentials.secret_access_key.clone(),
        ),
    ])
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Internal(e.to_string()))
}

/// Wrap a failure as an infrastructure error without nesting prefixes.
fn infrastructure(context: &str, err: Error) -> Error {
    match err {
        Error::Infrastructure(message) => {
            Error::Infrastructure(format!("{}: {}", context, message))
        }
        other => Error::Infrastructure(format!("{}: {}", context, other)),
    }
}
