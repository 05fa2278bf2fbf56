//! Build and build task repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pages_core::{Build, BuildId, BuildState, BuildTask, BuildTaskId, BuildUpdate, SiteId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A build row in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildRecord {
    pub id: i64,
    pub site_id: i64,
    pub user_id: Option<i64>,
    pub branch: String,
    pub token: String,
    pub state: String,
    pub requested_commit_sha: Option<String>,
    pub cloned_commit_sha: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRecord> for Build {
    type Error = DbError;

    fn try_from(record: BuildRecord) -> DbResult<Self> {
        Ok(Build {
            id: BuildId::new(record.id),
            site_id: SiteId::new(record.site_id),
            user_id: record.user_id.map(Into::into),
            branch: record.branch,
            token: record.token,
            state: parse_state(&record.state, "build", record.id)?,
            requested_commit_sha: record.requested_commit_sha,
            cloned_commit_sha: record.cloned_commit_sha,
            error: record.error,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        })
    }
}

/// A build task row in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildTaskRecord {
    pub id: i64,
    pub build_id: i64,
    pub task_type: String,
    pub token: String,
    pub state: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildTaskRecord> for BuildTask {
    type Error = DbError;

    fn try_from(record: BuildTaskRecord) -> DbResult<Self> {
        Ok(BuildTask {
            id: BuildTaskId::new(record.id),
            build_id: BuildId::new(record.build_id),
            task_type: record.task_type,
            token: record.token,
            state: parse_state(&record.state, "build task", record.id)?,
            error: record.error,
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        })
    }
}

fn parse_state(state: &str, kind: &str, id: i64) -> DbResult<BuildState> {
    state
        .parse()
        .map_err(|_| DbError::InvalidRecord(format!("{} {} has state {:?}", kind, id, state)))
}

#[async_trait]
pub trait BuildRepo: Send + Sync {
    async fn get_build(&self, id: BuildId) -> DbResult<Build>;
    async fn get_build_task(&self, id: BuildTaskId) -> DbResult<BuildTask>;

    /// Number of builds for a site that are created, queued, tasked or processing.
    async fn count_in_flight_builds(&self, site_id: SiteId) -> DbResult<i64>;

    /// Persist an update. Timestamps already set are never overwritten.
    async fn update_build(&self, id: BuildId, update: &BuildUpdate) -> DbResult<Build>;
    async fn update_build_task(&self, id: BuildTaskId, update: &BuildUpdate)
    -> DbResult<BuildTask>;
}

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn get_build(&self, id: BuildId) -> DbResult<Build> {
        let record = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        record.try_into()
    }

    async fn get_build_task(&self, id: BuildTaskId) -> DbResult<BuildTask> {
        let record =
            sqlx::query_as::<_, BuildTaskRecord>("SELECT * FROM build_tasks WHERE id = $1")
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("build task {}", id)))?;
        record.try_into()
    }

    async fn count_in_flight_builds(&self, site_id: SiteId) -> DbResult<i64> {
        let states: Vec<&str> = BuildState::in_progress_states()
            .iter()
            .map(|s| s.as_str())
            .collect();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM builds WHERE site_id = $1 AND state = ANY($2)",
        )
        .bind(site_id.get())
        .bind(&states)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn update_build(&self, id: BuildId, update: &BuildUpdate) -> DbResult<Build> {
        let record = sqlx::query_as::<_, BuildRecord>(
            r#"
            UPDATE builds SET
                state = COALESCE($2, state),
                cloned_commit_sha = COALESCE($3, cloned_commit_sha),
                error = COALESCE($4, error),
                started_at = COALESCE(started_at, $5),
                completed_at = COALESCE(completed_at, $6)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.get())
        .bind(update.state.map(|s| s.as_str()))
        .bind(update.cloned_commit_sha.as_deref())
        .bind(update.error.as_deref())
        .bind(update.started_at)
        .bind(update.completed_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        record.try_into()
    }

    async fn update_build_task(
        &self,
        id: BuildTaskId,
        update: &BuildUpdate,
    ) -> DbResult<BuildTask> {
        let record = sqlx::query_as::<_, BuildTaskRecord>(
            r#"
            UPDATE build_tasks SET
                state = COALESCE($2, state),
                error = COALESCE($3, error),
                started_at = COALESCE(started_at, $4),
                completed_at = COALESCE(completed_at, $5)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.get())
        .bind(update.state.map(|s| s.as_str()))
        .bind(update.error.as_deref())
        .bind(update.started_at)
        .bind(update.completed_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("build task {}", id)))?;
        record.try_into()
    }
}
