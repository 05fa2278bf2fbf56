//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for pages_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => pages_core::Error::NotFound(msg),
            other => pages_core::Error::Internal(other.to_string()),
        }
    }
}
