//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for buildgate_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => buildgate_core::Error::NotFound(msg),
            DbError::InvalidInput(msg) => buildgate_core::Error::InvalidInput(msg),
            DbError::Database(sqlx::Error::RowNotFound) => {
                buildgate_core::Error::NotFound("row".to_string())
            }
            other => buildgate_core::Error::Transport(other.to_string()),
        }
    }
}
