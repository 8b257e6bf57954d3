use thiserror::Error;

/// Error kinds visible to callers of any shale backend.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("store not found: {0}")]
    StoreNotFound(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("operation on a completed or aborted transaction")]
    TransactionClosed,

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("database closed")]
    DatabaseClosed,

    #[error("database is closing; no new transactions accepted")]
    DatabaseClosing,

    #[error("persisted schema version {stored} is newer than declared version {declared}")]
    VersionTooNew { stored: u32, declared: u32 },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(&'static str),

    #[error("backend error: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl StorageError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self { StorageError::Backend(Box::new(err)) }

    pub fn invalid_argument(msg: impl Into<String>) -> Self { StorageError::InvalidArgument(msg.into()) }

    pub fn invalid_key(msg: impl Into<String>) -> Self { StorageError::InvalidKey(msg.into()) }
}

impl From<anyhow::Error> for StorageError {
    fn from(err: anyhow::Error) -> Self { StorageError::Backend(err.into()) }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self { StorageError::Backend(Box::new(err)) }
}
