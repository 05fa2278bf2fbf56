//! Worker that processes jobs from the queue.

use crate::jobs::JobRunner;
use crate::queue::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Back-off after the queue itself fails.
const QUEUE_ERROR_DELAY: Duration = Duration::from_secs(5);

/// A worker that claims and executes jobs.
pub struct Worker {
    id: String,
    queue: Arc<dyn JobQueue>,
    runner: Arc<JobRunner>,
    idle_delay: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        runner: Arc<JobRunner>,
        idle_delay: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            runner,
            idle_delay,
        }
    }

    /// Claim and run at most one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> pages_db::DbResult<bool> {
        let Some(job) = self.queue.claim(&self.id).await? else {
            return Ok(false);
        };
        info!(worker_id = %self.id, job_id = %job.id, kind = %job.kind, record_id = job.record_id, "Claimed job");

        match self.runner.run(&job).await {
            Ok(()) => {
                if let Err(e) = self.queue.complete(job.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to mark job complete");
                }
            }
            Err(e) => {
                error!(job_id = %job.id, kind = %job.kind, record_id = job.record_id, error = %e, "Job failed");
                if let Err(e) = self.queue.fail(job.id, &e.to_string()).await {
                    warn!(job_id = %job.id, error = %e, "Failed to mark job failed");
                }
            }
        }
        Ok(true)
    }

    /// Run the worker loop until `shutdown` flips to true. A job already
    /// claimed runs to completion first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "Starting worker");

        while !*shutdown.borrow() {
            let delay = match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => self.idle_delay,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    QUEUE_ERROR_DELAY
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}
