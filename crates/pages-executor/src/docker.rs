//! Local Docker task backend.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerState, ContainerStateStatusEnum, HostConfig};
use futures::StreamExt;
use pages_config::BackendConfig;
use pages_core::backend::{TaskBackend, TaskHandle, TaskSpec, TaskState};
use pages_core::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::task_resource_name;

/// Runs each task as a container on the local Docker daemon.
pub struct DockerTaskBackend {
    docker: Docker,
    config: BackendConfig,
}

impl DockerTaskBackend {
    /// Connect to the local Docker daemon.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Backend(e.to_string()))?;
        Ok(Self { docker, config })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, config: BackendConfig) -> Self {
        Self { docker, config }
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

    async fn inspect(&self, container_name: &str) -> Result<TaskState> {
        let inspect = self
            .docker
            .inspect_container(container_name, None)
            .await
            .map_err(|e| Error::Backend(format!("Failed to inspect container: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Backend(format!("container {} has no state", container_name)))?;

        Ok(task_state_from(&state))
    }

    /// Force-remove a container, killing it if it still runs.
    async fn remove(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(container_name, Some(options))
            .await
            .map_err(|e| Error::Backend(format!("Failed to remove container: {}", e)))
    }

    async fn remove_or_warn(&self, container_name: &str) {
        match self.remove(container_name).await {
            Ok(()) => debug!(container = %container_name, "Removed container"),
            Err(e) => {
                warn!(container = %container_name, error = %e, "Failed to remove container")
            }
        }
    }
}

/// Map a container's state to a task state.
fn task_state_from(state: &ContainerState) -> TaskState {
    match state.status {
        Some(ContainerStateStatusEnum::RUNNING) | Some(ContainerStateStatusEnum::RESTARTING) => {
            TaskState::Running
        }
        Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD)
        | Some(ContainerStateStatusEnum::REMOVING) => exited_state(state),
        Some(ContainerStateStatusEnum::CREATED) | Some(ContainerStateStatusEnum::PAUSED) => {
            TaskState::Pending
        }
        _ if state.running.unwrap_or(false) => TaskState::Running,
        _ => TaskState::Pending,
    }
}

fn exited_state(state: &ContainerState) -> TaskState {
    match state.exit_code {
        Some(0) => TaskState::Succeeded,
        code => {
            let reason = if state.oom_killed.unwrap_or(false) {
                "container ran out of memory".to_string()
            } else if let Some(error) = state.error.as_deref().filter(|e| !e.is_empty()) {
                error.to_string()
            } else {
                match code {
                    Some(code) => format!("container exited with code {}", code),
                    None => "container exited".to_string(),
                }
            };
            TaskState::failed(reason)
        }
    }
}

#[async_trait]
impl TaskBackend for DockerTaskBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn start_task(&self, spec: TaskSpec) -> Result<TaskHandle> {
        let container_name = task_resource_name(&spec.correlation_id);
        let image = self.config.image_for(spec.sizing.name.as_deref()).to_string();

        self.pull_image(&image).await;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let labels = HashMap::from([
            ("pages.correlation-id".to_string(), spec.correlation_id.clone()),
            ("pages.label".to_string(), spec.label.clone()),
        ]);

        let host_config = HostConfig {
            memory: Some((spec.sizing.size.memory_mb() * 1024 * 1024) as i64),
            ..Default::default()
        };

        let config = Config {
            image: Some(image),
            env: Some(env),
            labels: Some(labels),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, label = %spec.label, "Creating container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| {
                Error::BackendDispatchFailure(format!("Failed to create container: {}", e))
            })?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                Error::BackendDispatchFailure(format!("Failed to start container: {}", e))
            })?;

        let initial_state = match self.inspect(&container_name).await {
            Ok(state) => state,
            Err(e) => {
                self.remove_or_warn(&container_name).await;
                return Err(Error::BackendDispatchFailure(e.to_string()));
            }
        };
        if matches!(initial_state, TaskState::Failed { .. }) {
            self.remove_or_warn(&container_name).await;
        }

        Ok(TaskHandle {
            id: container_name,
            correlation_id: spec.correlation_id,
            backend: self.name().to_string(),
            initial_state,
        })
    }

    /// A terminal state is reported once; the container is removed as soon
    /// as it has been observed.
    async fn fetch_task_status(&self, handle: &TaskHandle) -> Result<TaskState> {
        let state = self.inspect(&handle.id).await?;
        if state.is_terminal() {
            self.remove_or_warn(&handle.id).await;
        }
        Ok(state)
    }

    async fn cancel_task(&self, handle: &TaskHandle) -> Result<()> {
        self.remove(&handle.id).await
    }
}
