//! Site repository.
//!
//! Loads a site together with everything a build needs from it: members,
//! branch configuration, and user-supplied environment variables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pages_core::SiteId;
use pages_core::site::{
    BranchContext, ContainerSize, ContainerSizing, EnvironmentVariable, Site, SiteBranchConfig,
    User,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A site row in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SiteRecord {
    pub id: i64,
    pub owner: String,
    pub repository: String,
    pub default_branch: String,
    pub demo_branch: Option<String>,
    pub domain: Option<String>,
    pub demo_domain: Option<String>,
    pub engine: String,
    pub storage_service_name: Option<String>,
    pub container_name: Option<String>,
    pub container_size: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct UserRecord {
    id: i64,
    username: String,
    github_access_token: Option<String>,
    signed_in_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BranchConfigRecord {
    branch: Option<String>,
    context: String,
    config: serde_json::Value,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct EnvironmentVariableRecord {
    name: String,
    value: String,
}

#[async_trait]
pub trait SiteRepo: Send + Sync {
    /// Load a site with its users, branch configs and environment variables.
    async fn get_site(&self, id: SiteId) -> DbResult<Site>;
}

/// PostgreSQL implementation of SiteRepo.
pub struct PgSiteRepo {
    pool: PgPool,
}

impl PgSiteRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SiteRepo for PgSiteRepo {
    async fn get_site(&self, id: SiteId) -> DbResult<Site> {
        let record = sqlx::query_as::<_, SiteRecord>("SELECT * FROM sites WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("site {}", id)))?;

        let users = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT u.id, u.username, u.github_access_token, u.signed_in_at
            FROM users u
            JOIN site_users su ON su.user_id = u.id
            WHERE su.site_id = $1
            ORDER BY u.id
            "#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;

        let branch_configs = sqlx::query_as::<_, BranchConfigRecord>(
            "SELECT branch, context, config FROM site_branch_configs WHERE site_id = $1 ORDER BY id",
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;

        let environment = sqlx::query_as::<_, EnvironmentVariableRecord>(
            "SELECT name, value FROM user_environment_variables WHERE site_id = $1 ORDER BY name",
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await?;

        let container_size = ContainerSize::parse(&record.container_size).ok_or_else(|| {
            DbError::InvalidRecord(format!(
                "site {} has container size {:?}",
                record.id, record.container_size
            ))
        })?;

        Ok(Site {
            id: SiteId::new(record.id),
            owner: record.owner,
            repository: record.repository,
            default_branch: record.default_branch,
            demo_branch: record.demo_branch,
            domain: record.domain,
            demo_domain: record.demo_domain,
            engine: record.engine,
            storage_service_name: record.storage_service_name,
            container: ContainerSizing {
                name: record.container_name,
                size: container_size,
            },
            branch_configs: branch_configs
                .into_iter()
                .map(|c| {
                    Ok(SiteBranchConfig {
                        context: parse_context(&c.context)?,
                        branch: c.branch,
                        config: c.config,
                    })
                })
                .collect::<DbResult<Vec<_>>>()?,
            environment: environment
                .into_iter()
                .map(|v| EnvironmentVariable {
                    name: v.name,
                    value: v.value,
                })
                .collect(),
            users: users
                .into_iter()
                .map(|u| User {
                    id: u.id.into(),
                    username: u.username,
                    github_access_token: u.github_access_token,
                    signed_in_at: u.signed_in_at,
                })
                .collect(),
        })
    }
}

fn parse_context(context: &str) -> DbResult<BranchContext> {
    match context {
        "site" => Ok(BranchContext::Site),
        "demo" => Ok(BranchContext::Demo),
        "preview" => Ok(BranchContext::Preview),
        other => Err(DbError::InvalidRecord(format!(
            "unknown branch context {:?}",
            other
        ))),
    }
}
