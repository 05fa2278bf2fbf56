//! Task backend trait and task types.
//!
//! A task backend runs one build or build task to completion in an isolated
//! container. The pipeline only starts, polls, and cancels tasks; it never
//! waits on a backend-side stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Result;
use crate::site::ContainerSizing;

/// Everything a backend needs to run one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique id correlating this dispatch with backend-side resources.
    pub correlation_id: String,
    /// Human readable label, e.g. `build-42`.
    pub label: String,
    /// Flat environment passed to the container.
    pub env: BTreeMap<String, String>,
    /// Container class and size hints.
    pub sizing: ContainerSizing,
}

/// Handle to a started task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Backend-specific identifier (container id, job name, ...).
    pub id: String,
    pub correlation_id: String,
    /// Name of the backend running this task.
    pub backend: String,
    /// State the backend reported when the task was started.
    pub initial_state: TaskState,
}

/// State of a task as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed { reason: Option<String> },
}

impl TaskState {
    pub fn failed(reason: impl Into<String>) -> Self {
        TaskState::Failed {
            reason: Some(reason.into()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed { .. } => "FAILED",
        }
    }
}

/// Trait for task-execution backends.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Start a task.
    async fn start_task(&self, spec: TaskSpec) -> Result<TaskHandle>;

    /// Fetch the current state of a task.
    async fn fetch_task_status(&self, handle: &TaskHandle) -> Result<TaskState>;

    /// Stop a task and release its resources.
    async fn cancel_task(&self, handle: &TaskHandle) -> Result<()>;
}
