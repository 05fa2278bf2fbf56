//! Kubernetes task backend.
//!
//! Each task is a batch `Job` with a single container and no retries; the
//! dispatch worker owns all retry decisions.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec, JobStatus};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, PostParams};
use pages_config::BackendConfig;
use pages_core::backend::{TaskBackend, TaskHandle, TaskSpec, TaskState};
use pages_core::{Error, Result};
use std::collections::BTreeMap;
use tracing::info;

use crate::task_resource_name;

/// Finished jobs are garbage collected by the cluster after a day.
const FINISHED_JOB_TTL_SECONDS: i32 = 24 * 60 * 60;

/// Kubernetes-based task backend.
pub struct KubernetesTaskBackend {
    client: Client,
    namespace: String,
    config: BackendConfig,
}

impl KubernetesTaskBackend {
    pub async fn new(namespace: impl Into<String>, config: BackendConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.into(),
            config,
        })
    }

    pub fn with_client(
        client: Client,
        namespace: impl Into<String>,
        config: BackendConfig,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            config,
        }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Build the Job manifest for a task.
fn job_manifest(spec: &TaskSpec, image: &str) -> Job {
    let name = task_resource_name(&spec.correlation_id);

    let labels = BTreeMap::from([
        ("app.kubernetes.io/managed-by".to_string(), "pages".to_string()),
        ("pages/task".to_string(), name.clone()),
    ]);

    let env = spec
        .env
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();

    let limits = BTreeMap::from([
        (
            "memory".to_string(),
            Quantity(format!("{}Mi", spec.sizing.size.memory_mb())),
        ),
        (
            "ephemeral-storage".to_string(),
            Quantity(format!("{}Mi", spec.sizing.size.disk_mb())),
        ),
    ]);

    Job {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(FINISHED_JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "build".to_string(),
                        image: Some(image.to_string()),
                        env: Some(env),
                        resources: Some(ResourceRequirements {
                            limits: Some(limits),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Map a Job's status counters to a task state.
fn task_state_from(status: Option<&JobStatus>) -> TaskState {
    let Some(status) = status else {
        return TaskState::Pending;
    };

    if status.succeeded.unwrap_or(0) > 0 {
        return TaskState::Succeeded;
    }

    if status.failed.unwrap_or(0) > 0 {
        let reason = status
            .conditions
            .iter()
            .flatten()
            .find(|c| c.type_ == "Failed" && c.status == "True")
            .and_then(|c| c.message.clone().or_else(|| c.reason.clone()));
        return TaskState::Failed { reason };
    }

    if status.active.unwrap_or(0) > 0 {
        TaskState::Running
    } else {
        TaskState::Pending
    }
}

#[async_trait]
impl TaskBackend for KubernetesTaskBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn start_task(&self, spec: TaskSpec) -> Result<TaskHandle> {
        let image = self.config.image_for(spec.sizing.name.as_deref());
        let job = job_manifest(&spec, image);

        info!(namespace = %self.namespace, label = %spec.label, "Creating job");
        let created = self
            .jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| Error::BackendDispatchFailure(format!("Failed to create job: {}", e)))?;

        Ok(TaskHandle {
            id: created
                .metadata
                .name
                .unwrap_or_else(|| task_resource_name(&spec.correlation_id)),
            correlation_id: spec.correlation_id,
            backend: self.name().to_string(),
            initial_state: task_state_from(created.status.as_ref()),
        })
    }

    async fn fetch_task_status(&self, handle: &TaskHandle) -> Result<TaskState> {
        let job = self
            .jobs()
            .get(&handle.id)
            .await
            .map_err(|e| Error::Backend(format!("Failed to get job {}: {}", handle.id, e)))?;
        Ok(task_state_from(job.status.as_ref()))
    }

    async fn cancel_task(&self, handle: &TaskHandle) -> Result<()> {
        self.jobs()
            .delete(&handle.id, &DeleteParams::background())
            .await
            .map_err(|e| Error::Backend(format!("Failed to delete job {}: {}", handle.id, e)))?;
        Ok(())
    }
}
