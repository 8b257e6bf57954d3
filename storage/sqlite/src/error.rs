//! Error types for the SQLite storage backend.

use shale_core::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("SQLite error: {0}")]
    Rusqlite(rusqlite::Error),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("DDL error: {0}")]
    Ddl(String),

    #[error("task join error: {0}")]
    TaskJoin(String),

    #[error(transparent)]
    Storage(StorageError),
}

impl From<rusqlite::Error> for SqliteError {
    /// Classify constraint failures so callers can tell unique violations
    /// apart from other driver errors.
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, ref msg) = err {
            if e.code == rusqlite::ErrorCode::ConstraintViolation {
                return SqliteError::UniqueViolation(msg.clone().unwrap_or_else(|| e.to_string()));
            }
        }
        SqliteError::Rusqlite(err)
    }
}

impl From<StorageError> for SqliteError {
    fn from(err: StorageError) -> Self { SqliteError::Storage(err) }
}

impl From<SqliteError> for StorageError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Storage(e) => e,
            other => StorageError::Backend(Box::new(other)),
        }
    }
}
