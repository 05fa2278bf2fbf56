//! Task execution backends for the Pages build pipeline.
//!
//! Provides backend implementations for running build containers:
//! - Kubernetes batch jobs (production)
//! - Local Docker (development)

pub mod docker;
pub mod kubernetes;

pub use docker::DockerTaskBackend;
pub use kubernetes::KubernetesTaskBackend;
pub use pages_core::backend::{TaskBackend, TaskHandle, TaskSpec, TaskState};

/// Name shared by the container, job, or pod running a task.
pub(crate) fn task_resource_name(correlation_id: &str) -> String {
    let name: String = format!("pages-{}", correlation_id)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    name.trim_end_matches('-').to_string()
}
