//! Dispatch-and-poll engine.
//!
//! Runs one job through `start -> dispatch -> poll -> completed | failed`.
//! What differs between site builds and build tasks lives behind
//! [`DispatchTarget`]; the engine owns the timing, the backend calls and the
//! failure bookkeeping.

use async_trait::async_trait;
use pages_config::PollPolicy;
use pages_core::backend::{TaskBackend, TaskHandle, TaskSpec, TaskState};
use pages_core::{BuildState, Error, Result, StatusUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::queue::JobKind;

/// One dispatchable record.
#[async_trait]
pub trait DispatchTarget: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Id of the record, e.g. `42`.
    fn record_id(&self) -> i64;

    fn poll_policy(&self) -> PollPolicy;

    /// Load the record fresh and produce the task to run.
    ///
    /// On success the record is moved to `queued`.
    async fn prepare(&self, correlation_id: &str) -> Result<TaskSpec>;

    /// Persisted state of the record.
    async fn current_state(&self) -> Result<BuildState>;

    /// Apply a status to the record.
    async fn record(&self, status: StatusUpdate) -> Result<()>;

    /// The status a terminal backend state completes this record with.
    fn completion(&self, state: &TaskState) -> Option<StatusUpdate> {
        let noun = self.kind().noun();
        match state {
            TaskState::Succeeded => Some(StatusUpdate::new(BuildState::Success)),
            TaskState::Failed { reason } => Some(StatusUpdate::error(match reason {
                Some(reason) => format!("The {} failed: {}", noun, reason),
                None => format!("The {} failed", noun),
            })),
            TaskState::Pending | TaskState::Running => None,
        }
    }

    /// Label for logs, e.g. `build-42`.
    fn label(&self) -> String {
        format!("{}-{}", self.kind().noun(), self.record_id())
    }
}

/// Drives dispatch targets against a task backend.
pub struct DispatchEngine {
    backend: Arc<dyn TaskBackend>,
}

impl DispatchEngine {
    pub fn new(backend: Arc<dyn TaskBackend>) -> Self {
        Self { backend }
    }

    /// Run a target to completion.
    ///
    /// Any failure is written to the record's error unless the record is
    /// already terminal, and then returned to the caller.
    pub async fn run(&self, target: &dyn DispatchTarget) -> Result<()> {
        let label = target.label();

        if target.current_state().await?.is_terminal() {
            info!(target = %label, "Record already finished, nothing to dispatch");
            return Ok(());
        }

        match self.dispatch_and_poll(target, &label).await {
            Ok(()) => {
                info!(target = %label, "Task completed");
                Ok(())
            }
            Err(e) => {
                error!(target = %label, error = %e, "Task failed");
                self.mark_failed(target, &label, &e).await;
                Err(e)
            }
        }
    }

    async fn dispatch_and_poll(&self, target: &dyn DispatchTarget, label: &str) -> Result<()> {
        let correlation_id = format!("{}-{}", label, Uuid::new_v4().simple());
        let spec = target.prepare(&correlation_id).await?;

        info!(target = %label, backend = self.backend.name(), "Dispatching task");
        let handle = self.backend.start_task(spec).await.map_err(|e| match e {
            Error::BackendDispatchFailure(message) => Error::BackendDispatchFailure(message),
            other => Error::BackendDispatchFailure(other.to_string()),
        })?;

        if let TaskState::Failed { reason } = &handle.initial_state {
            return Err(Error::BackendDispatchFailure(format!(
                "task {} failed on start: {}",
                handle.id,
                reason.as_deref().unwrap_or("no reason given")
            )));
        }

        self.record_progress(target, label, BuildState::Tasked).await;

        let mut started = false;
        if handle.initial_state == TaskState::Running {
            self.record_progress(target, label, BuildState::Processing).await;
            started = true;
        }

        self.poll(target, label, &handle, started).await
    }

    async fn poll(
        &self,
        target: &dyn DispatchTarget,
        label: &str,
        handle: &TaskHandle,
        mut started: bool,
    ) -> Result<()> {
        let policy = target.poll_policy();

        for attempt in 1..=policy.max_attempts {
            sleep(policy.interval).await;

            let state = match self.backend.fetch_task_status(handle).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(target = %label, attempt, error = %e, "Failed to fetch task status");
                    continue;
                }
            };
            debug!(target = %label, attempt, state = state.as_str(), "Polled task");

            match &state {
                TaskState::Pending => {}
                TaskState::Running => {
                    if !started {
                        self.record_progress(target, label, BuildState::Processing).await;
                        started = true;
                    }
                }
                TaskState::Succeeded => {
                    if !started {
                        self.record_progress(target, label, BuildState::Processing).await;
                    }
                    if let Some(status) = target.completion(&state) {
                        target.record(status).await?;
                    }
                    return Ok(());
                }
                TaskState::Failed { reason } => {
                    if let Some(status) = target.completion(&state) {
                        self.record_unless_finished(target, label, status).await?;
                    }
                    return Err(Error::TaskFailed(
                        reason.clone().unwrap_or_else(|| format!("{} failed", label)),
                    ));
                }
            }
        }

        info!(target = %label, "Poll budget exhausted, cancelling task");
        if let Err(e) = self.backend.cancel_task(handle).await {
            warn!(target = %label, error = %e, "Failed to cancel task");
        }

        Err(Error::BackendTimeout(format!(
            "{} {} timed out after {}",
            target.kind().noun(),
            target.record_id(),
            describe_duration(policy.budget())
        )))
    }

    // Progress writes are advisory; the terminal write is what matters.
    async fn record_progress(&self, target: &dyn DispatchTarget, label: &str, state: BuildState) {
        if let Err(e) = target.record(StatusUpdate::new(state)).await {
            warn!(target = %label, state = %state, error = %e, "Failed to record progress");
        }
    }

    async fn record_unless_finished(
        &self,
        target: &dyn DispatchTarget,
        label: &str,
        status: StatusUpdate,
    ) -> Result<()> {
        let state = target.current_state().await?;
        if state.is_terminal() {
            info!(target = %label, state = %state, "Record already finished, keeping its state");
            return Ok(());
        }
        target.record(status).await
    }

    async fn mark_failed(&self, target: &dyn DispatchTarget, label: &str, err: &Error) {
        let status = StatusUpdate::error(failure_message(target.kind(), err));
        if let Err(e) = self.record_unless_finished(target, label, status).await {
            error!(target = %label, error = %e, "Failed to record failure");
        }
    }
}

/// The message stored on a failed record. Backend details stay in the logs.
fn failure_message(kind: JobKind, err: &Error) -> String {
    match err {
        Error::Infrastructure(message) => {
            format!("Unable to prepare the {} environment: {}", kind.noun(), message)
        }
        Error::BackendDispatchFailure(_) => format!("Unable to start the {}", kind.noun()),
        Error::BackendTimeout(message) | Error::TaskFailed(message) => message.clone(),
        other => other.to_string(),
    }
}

fn describe_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs {
        0 => format!("{} ms", duration.as_millis()),
        60 => "1 minute".to_string(),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        1 => "1 second".to_string(),
        s => format!("{} seconds", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::SiteBuildJob;
    use crate::testing::Harness;
    use pages_core::BuildId;
    use std::sync::Mutex;

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(30), 4)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_one_poll() {
        let h = Harness::new(policy());
        h.backend.script_polls(vec![Ok(TaskState::Succeeded)]);

        h.engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await
            .unwrap();

        let build = h.build(42);
        assert_eq!(build.state, BuildState::Success);
        let started = build.started_at.expect("started_at set");
        let completed = build.completed_at.expect("completed_at set");
        assert!(completed >= started);
        assert_eq!(h.backend.poll_count(), 1);
        assert_eq!(h.backend.cancel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_flow_through_running() {
        let h = Harness::new(policy());
        h.backend.script_polls(vec![
            Ok(TaskState::Pending),
            Ok(TaskState::Running),
            Ok(TaskState::Running),
            Ok(TaskState::Succeeded),
        ]);

        h.engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await
            .unwrap();

        assert_eq!(
            h.builds.states_written(BuildId::new(42)),
            vec![
                BuildState::Queued,
                BuildState::Tasked,
                BuildState::Processing,
                BuildState::Success
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_before_start_returns_is_not_overwritten() {
        let h = Harness::new(policy());
        let builds = h.builds.clone();
        h.backend.on_start(move || builds.set_state(BuildId::new(42), BuildState::Processing));
        let builds = h.builds.clone();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_poll = seen.clone();
        h.backend.before_first_poll(move || {
            *seen_in_poll.lock().unwrap() = builds.build(BuildId::new(42)).map(|b| b.state);
        });
        h.backend.script_polls(vec![Ok(TaskState::Running), Ok(TaskState::Succeeded)]);

        h.engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(BuildState::Processing));
        assert_eq!(
            h.builds.states_written(BuildId::new(42)),
            vec![BuildState::Queued, BuildState::Success]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_cancels_once_and_times_out() {
        let h = Harness::new(PollPolicy::new(Duration::from_secs(30), 120));

        let err = h
            .engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BackendTimeout(_)));
        assert_eq!(err.to_string(), "timeout: build 42 timed out after 60 minutes");
        assert_eq!(h.backend.poll_count(), 120);
        assert_eq!(h.backend.cancel_count(), 1);

        let build = h.build(42);
        assert_eq!(build.state, BuildState::Error);
        assert_eq!(
            build.error.as_deref(),
            Some("build 42 timed out after 60 minutes")
        );
        assert!(build.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_failure_does_not_block_failure() {
        let h = Harness::new(policy());
        h.backend.fail_cancel();

        let err = h
            .engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BackendTimeout(_)));
        assert_eq!(h.backend.cancel_count(), 1);
        assert_eq!(h.build(42).state, BuildState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_error_skips_polling() {
        let h = Harness::new(policy());
        h.backend.fail_start(Error::Backend("connection refused to pages-build-42-x".to_string()));

        let err = h
            .engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BackendDispatchFailure(_)));
        assert_eq!(h.backend.poll_count(), 0);

        let build = h.build(42);
        assert_eq!(build.state, BuildState::Error);
        assert_eq!(build.error.as_deref(), Some("Unable to start the build"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_failed_on_start_is_dispatch_failure() {
        let h = Harness::new(policy());
        h.backend.start_in(TaskState::failed("image not found"));

        let err = h
            .engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BackendDispatchFailure(_)));
        assert_eq!(h.backend.poll_count(), 0);
        assert_eq!(h.build(42).state, BuildState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_count_toward_budget() {
        let h = Harness::new(policy());
        h.backend.script_polls(vec![
            Err(Error::Backend("timeout".to_string())),
            Err(Error::Backend("timeout".to_string())),
            Ok(TaskState::Succeeded),
        ]);

        h.engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await
            .unwrap();

        assert_eq!(h.backend.poll_count(), 3);
        assert_eq!(h.build(42).state, BuildState::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_records_reason() {
        let h = Harness::new(policy());
        h.backend.script_polls(vec![
            Ok(TaskState::Running),
            Ok(TaskState::failed(
                "git clone https://secret@github.com/18f/handbook failed",
            )),
        ]);

        let err = h
            .engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TaskFailed(_)));
        let build = h.build(42);
        assert_eq!(build.state, BuildState::Error);
        assert_eq!(
            build.error.as_deref(),
            Some("The build failed: git clone https://[token_redacted]@github.com/18f/handbook failed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_keeps_callback_success() {
        let h = Harness::new(policy());
        h.backend.script_polls(vec![Ok(TaskState::failed("container exited with code 1"))]);
        let builds = h.builds.clone();
        h.backend.before_first_poll(move || {
            builds.set_state(BuildId::new(42), BuildState::Success);
        });

        let result = h
            .engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await;

        assert!(result.is_err());
        let build = h.build(42);
        assert_eq!(build.state, BuildState::Success);
        assert_eq!(build.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_callback_error() {
        let h = Harness::new(policy());
        let builds = h.builds.clone();
        h.backend.before_first_poll(move || {
            builds.set_state(BuildId::new(42), BuildState::Error);
            builds.set_error(BuildId::new(42), "jekyll build failed");
        });

        let result = h
            .engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await;

        assert!(matches!(result, Err(Error::BackendTimeout(_))));
        assert_eq!(h.backend.cancel_count(), 1);
        assert_eq!(
            h.build(42).error.as_deref(),
            Some("jekyll build failed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_record_is_not_dispatched() {
        let h = Harness::new(policy());
        h.builds.set_state(BuildId::new(42), BuildState::Skipped);

        h.engine()
            .run(&SiteBuildJob::new(BuildId::new(42), h.context()))
            .await
            .unwrap();

        assert_eq!(h.backend.start_count(), 0);
    }

    #[test]
    fn test_describe_duration() {
        assert_eq!(describe_duration(Duration::from_secs(3600)), "60 minutes");
        assert_eq!(describe_duration(Duration::from_secs(60)), "1 minute");
        assert_eq!(describe_duration(Duration::from_secs(90)), "90 seconds");
        assert_eq!(describe_duration(Duration::from_millis(250)), "250 ms");
    }
}
