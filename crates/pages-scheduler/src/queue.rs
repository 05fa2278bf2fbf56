//! Job queue implementation using PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pages_db::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use uuid::Uuid;

/// What a queued job dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    SiteBuild,
    BuildTask,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SiteBuild => "site-build",
            JobKind::BuildTask => "build-task",
        }
    }

    /// Word used for this kind in user-facing messages.
    pub fn noun(&self) -> &'static str {
        match self {
            JobKind::SiteBuild => "build",
            JobKind::BuildTask => "task",
        }
    }

    /// Total attempts the queue allows. A failed build is re-run by the
    /// user, never by the queue.
    pub fn max_attempts(&self) -> i32 {
        1
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "site-build" => Some(JobKind::SiteBuild),
            "build-task" => Some(JobKind::BuildTask),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued job row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedJobRecord {
    pub id: Uuid,
    pub job_kind: String,
    pub record_id: i64,
    pub priority: i32,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A claimed or enqueued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: Uuid,
    pub kind: JobKind,
    /// Id of the build or build task this job dispatches.
    pub record_id: i64,
    pub attempts: i32,
    pub claimed_by: Option<String>,
}

impl TryFrom<QueuedJobRecord> for QueuedJob {
    type Error = DbError;

    fn try_from(record: QueuedJobRecord) -> DbResult<Self> {
        let kind = JobKind::parse(&record.job_kind).ok_or_else(|| {
            DbError::InvalidRecord(format!(
                "job {} has kind {:?}",
                record.id, record.job_kind
            ))
        })?;
        Ok(QueuedJob {
            id: record.id,
            kind,
            record_id: record.record_id,
            attempts: record.attempts,
            claimed_by: record.claimed_by,
        })
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job for a build or build task.
    async fn enqueue(&self, kind: JobKind, record_id: i64) -> DbResult<QueuedJob>;

    /// Claim the next available job, if any.
    async fn claim(&self, worker_id: &str) -> DbResult<Option<QueuedJob>>;

    async fn complete(&self, job_id: Uuid) -> DbResult<()>;

    /// Record a failure. The job returns to pending only while it has
    /// attempts left.
    async fn fail(&self, job_id: Uuid, error: &str) -> DbResult<()>;
}

/// Job queue backed by PostgreSQL.
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, kind: JobKind, record_id: i64) -> DbResult<QueuedJob> {
        let record = sqlx::query_as::<_, QueuedJobRecord>(
            r#"
            INSERT INTO job_queue (id, job_kind, record_id, max_attempts, status, created_at)
            VALUES ($1, $2, $3, $4, 'pending', NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(kind.as_str())
        .bind(record_id)
        .bind(kind.max_attempts())
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    /// Uses SKIP LOCKED so each job is claimed by exactly one worker.
    async fn claim(&self, worker_id: &str) -> DbResult<Option<QueuedJob>> {
        let record = sqlx::query_as::<_, QueuedJobRecord>(
            r#"
            UPDATE job_queue
            SET status = 'claimed', claimed_by = $1, claimed_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM job_queue
                WHERE status = 'pending'
                ORDER BY priority DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(QueuedJob::try_from).transpose()
    }

    async fn complete(&self, job_id: Uuid) -> DbResult<()> {
        sqlx::query("UPDATE job_queue SET status = 'completed' WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE job_queue SET
                status = CASE WHEN attempts < max_attempts THEN 'pending' ELSE 'failed' END,
                error = $2,
                claimed_by = NULL,
                claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
