//! Exclusive rusqlite connection shared through a spawn_blocking adapter.

use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::SqliteError;

/// Where the database lives.
#[derive(Clone, Debug)]
pub enum SqliteConfig {
    /// File-based database
    File(PathBuf),
    /// In-memory database (for testing)
    Memory,
}

/// The provider's single connection.
///
/// Since rusqlite::Connection is not Send, we wrap it in a Mutex and use
/// spawn_blocking for all operations.
#[derive(Debug)]
pub struct SharedConnection {
    inner: Arc<Mutex<Connection>>,
}

impl SharedConnection {
    pub async fn open(config: &SqliteConfig) -> Result<Self, SqliteError> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || {
            let conn = match &config {
                SqliteConfig::File(path) => Connection::open(path)?,
                SqliteConfig::Memory => Connection::open_in_memory()?,
            };

            // Performance settings
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA temp_store=MEMORY;",
            )?;

            Ok(Self { inner: Arc::new(Mutex::new(conn)) })
        })
        .await
        .map_err(|e| SqliteError::TaskJoin(e.to_string()))?
    }

    /// Run a closure against the connection inside spawn_blocking.
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T, SqliteError>
    where
        F: FnOnce(&Connection) -> Result<T, SqliteError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            f(&guard)
        })
        .await
        .map_err(|e| SqliteError::TaskJoin(e.to_string()))?
    }

    /// Like [`with_connection`], with mutable access (needed for explicit
    /// rusqlite transactions during migration).
    ///
    /// [`with_connection`]: SharedConnection::with_connection
    pub async fn with_connection_mut<F, T>(&self, f: F) -> Result<T, SqliteError>
    where
        F: FnOnce(&mut Connection) -> Result<T, SqliteError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.blocking_lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| SqliteError::TaskJoin(e.to_string()))?
    }
}

impl Clone for SharedConnection {
    fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}
