//! The SQLite provider: owns the connection, runs migration at open, and
//! hands out transactions admitted by the lock helper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use shale_core::{
    ErrorObserver, Schema, Store, StorageError, Transaction, TransactionLockHelper, TransactionToken,
};
use tracing::debug;

use crate::connection::{SharedConnection, SqliteConfig};
use crate::driver::{probe_fts3, SqlCapabilities};
use crate::error::SqliteError;
use crate::migration::migrate_schema;
use crate::store::SqlStore;

pub struct SqliteProvider {
    conn: SharedConnection,
    schema: Arc<Schema>,
    caps: SqlCapabilities,
    locks: Arc<TransactionLockHelper>,
    // One SQL transaction at a time on the single connection; held by write
    // transactions from BEGIN to COMMIT/ROLLBACK.
    write_slot: Arc<tokio::sync::Mutex<()>>,
    observer: Option<Arc<dyn ErrorObserver>>,
    closed: AtomicBool,
    config: SqliteConfig,
}

impl std::fmt::Debug for SqliteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteProvider").field("config", &self.config).finish_non_exhaustive()
    }
}

impl SqliteProvider {
    /// Open (creating if needed) and reconcile the persisted schema with the
    /// declared one. `wipe_if_exists` authorizes dropping persisted data when
    /// versions require it.
    pub async fn open(config: SqliteConfig, schema: Schema, wipe_if_exists: bool, verbose: bool) -> Result<Self, StorageError> {
        Self::open_with(config, schema, wipe_if_exists, verbose, None, None).await
    }

    /// [`open`] with explicit capability flags (tests, engines with known
    /// quirks) and an optional error observer.
    ///
    /// [`open`]: SqliteProvider::open
    pub async fn open_with(
        config: SqliteConfig,
        schema: Schema,
        wipe_if_exists: bool,
        verbose: bool,
        capabilities: Option<SqlCapabilities>,
        observer: Option<Arc<dyn ErrorObserver>>,
    ) -> Result<Self, StorageError> {
        schema.validate()?;
        let conn = SharedConnection::open(&config).await?;

        let caps = match capabilities {
            Some(caps) => caps,
            None => {
                let mut caps = SqlCapabilities::default();
                caps.supports_fts3 = conn.with_connection(|c| Ok(probe_fts3(c))).await?;
                caps
            }
        };

        let migration_schema = schema.clone();
        conn.with_connection_mut(move |c| migrate_schema(c, &migration_schema, &caps, wipe_if_exists, verbose)).await?;

        Ok(Self {
            conn,
            schema: Arc::new(schema),
            caps,
            locks: Arc::new(TransactionLockHelper::new()),
            write_slot: Arc::new(tokio::sync::Mutex::new(())),
            observer,
            closed: AtomicBool::new(false),
            config,
        })
    }

    pub fn schema(&self) -> &Schema { &self.schema }

    pub fn capabilities(&self) -> SqlCapabilities { self.caps }

    /// Open a transaction over the named stores. Conflicting transactions
    /// queue FIFO behind the lock helper; write transactions additionally
    /// wrap their statements in BEGIN IMMEDIATE .. COMMIT.
    pub async fn open_transaction(&self, store_names: &[&str], write: bool) -> Result<SqliteTransaction, StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::DatabaseClosed);
        }
        for name in store_names {
            if self.schema.store(name).is_none() {
                return Err(StorageError::StoreNotFound(name.to_string()));
            }
        }

        let names: Vec<String> = store_names.iter().map(|s| s.to_string()).collect();
        let token = self.locks.open_transaction(names.clone(), write).await?;

        let write_guard = if write {
            let guard = self.write_slot.clone().lock_owned().await;
            if let Err(e) = self.conn.with_connection(|c| Ok(c.execute_batch("BEGIN IMMEDIATE")?)).await {
                let err = StorageError::from(e);
                self.locks.transaction_failed(token, &err);
                return Err(err);
            }
            Some(guard)
        } else {
            None
        };

        Ok(SqliteTransaction {
            inner: Arc::new(TxInner {
                conn: self.conn.clone(),
                schema: self.schema.clone(),
                caps: self.caps,
                locks: self.locks.clone(),
                write,
                store_names: names,
                state: StdMutex::new(TxState::Open),
                token: StdMutex::new(Some(token)),
                write_guard: StdMutex::new(write_guard),
                observer: self.observer.clone(),
            }),
        })
    }

    /// Refuse new transactions and resolve once in-flight ones drain.
    pub async fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.locks.close_when_possible().await;
        }
        Ok(())
    }

    /// Close, then destroy the persisted database.
    pub async fn delete_database(&self) -> Result<(), StorageError> {
        self.close().await?;
        match &self.config {
            SqliteConfig::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || {
                    for suffix in ["", "-wal", "-shm"] {
                        let mut file = path.clone().into_os_string();
                        file.push(suffix);
                        match std::fs::remove_file(&file) {
                            Ok(()) => {}
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => return Err(SqliteError::Ddl(format!("delete database: {}", e))),
                        }
                    }
                    Ok(())
                })
                .await
                .map_err(|e| SqliteError::TaskJoin(e.to_string()))??;
                Ok(())
            }
            SqliteConfig::Memory => {
                self.conn
                    .with_connection(|c| {
                        let mut stmt = c.prepare(
                            "SELECT name, sql FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                        )?;
                        let tables: Vec<(String, Option<String>)> =
                            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?.collect::<Result<_, _>>()?;
                        drop(stmt);
                        // Virtual tables first; dropping them removes their shadow tables.
                        let is_virtual =
                            |sql: &Option<String>| sql.as_deref().is_some_and(|s| s.starts_with("CREATE VIRTUAL TABLE"));
                        for (name, _) in tables.iter().filter(|(_, sql)| is_virtual(sql)) {
                            c.execute(&format!("DROP TABLE IF EXISTS \"{}\"", name), [])?;
                        }
                        for (name, _) in tables.iter().filter(|(_, sql)| !is_virtual(sql)) {
                            c.execute(&format!("DROP TABLE IF EXISTS \"{}\"", name), [])?;
                        }
                        Ok(())
                    })
                    .await
                    .map_err(StorageError::from)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Completed,
    Aborted,
}

pub(crate) struct TxInner {
    pub(crate) conn: SharedConnection,
    pub(crate) schema: Arc<Schema>,
    pub(crate) caps: SqlCapabilities,
    locks: Arc<TransactionLockHelper>,
    pub(crate) write: bool,
    store_names: Vec<String>,
    state: StdMutex<TxState>,
    token: StdMutex<Option<TransactionToken>>,
    write_guard: StdMutex<Option<tokio::sync::OwnedMutexGuard<()>>>,
    observer: Option<Arc<dyn ErrorObserver>>,
}

impl TxInner {
    fn ensure_open(&self) -> Result<(), StorageError> {
        match *self.state.lock().expect("tx state poisoned") {
            TxState::Open => Ok(()),
            _ => Err(StorageError::TransactionClosed),
        }
    }

    fn observe(&self, err: &StorageError) {
        if let Some(observer) = &self.observer {
            observer.observe(err);
        }
    }

    /// Run one operation's statements against the shared connection. A driver
    /// error inside a write transaction rolls the whole transaction back.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, SqliteError> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        match self.conn.with_connection(f).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = StorageError::from(e);
                if self.write {
                    self.abort_internal(&err).await;
                }
                self.observe(&err);
                Err(err)
            }
        }
    }

    async fn abort_internal(&self, cause: &StorageError) {
        {
            let mut state = self.state.lock().expect("tx state poisoned");
            if *state != TxState::Open {
                return;
            }
            *state = TxState::Aborted;
        }
        if self.write {
            let _ = self.conn.with_connection(|c| Ok(c.execute_batch("ROLLBACK")?)).await;
        }
        *self.write_guard.lock().expect("write guard poisoned") = None;
        if let Some(token) = self.token.lock().expect("token poisoned").take() {
            self.locks.transaction_failed(token, cause);
        }
        debug!("transaction aborted: {}", cause);
    }
}

/// An open transaction. Stores and indexes borrowed from it keep a
/// back-reference and fail with `TransactionClosed` once it resolves.
pub struct SqliteTransaction {
    inner: Arc<TxInner>,
}

#[async_trait]
impl Transaction for SqliteTransaction {
    fn store(&self, name: &str) -> Result<Arc<dyn Store>, StorageError> {
        self.inner.ensure_open()?;
        if !self.inner.store_names.iter().any(|n| n == name) {
            return Err(StorageError::StoreNotFound(name.to_string()));
        }
        let store = self.inner.schema.store(name).ok_or_else(|| StorageError::StoreNotFound(name.to_string()))?.clone();
        Ok(Arc::new(SqlStore::new(self.inner.clone(), store)))
    }

    async fn complete(&self) -> Result<(), StorageError> {
        {
            let mut state = self.inner.state.lock().expect("tx state poisoned");
            match *state {
                TxState::Completed => return Ok(()),
                TxState::Aborted => return Err(StorageError::TransactionAborted("transaction was aborted".into())),
                // Flip eagerly so no operation can interleave with the commit.
                TxState::Open => *state = TxState::Completed,
            }
        }
        if self.inner.write {
            if let Err(e) = self.inner.conn.with_connection(|c| Ok(c.execute_batch("COMMIT")?)).await {
                let err = StorageError::from(e);
                {
                    let mut state = self.inner.state.lock().expect("tx state poisoned");
                    *state = TxState::Aborted;
                }
                let _ = self.inner.conn.with_connection(|c| Ok(c.execute_batch("ROLLBACK")?)).await;
                *self.inner.write_guard.lock().expect("write guard poisoned") = None;
                if let Some(token) = self.inner.token.lock().expect("token poisoned").take() {
                    self.inner.locks.transaction_failed(token, &err);
                }
                self.inner.observe(&err);
                return Err(err);
            }
        }
        *self.inner.write_guard.lock().expect("write guard poisoned") = None;
        if let Some(token) = self.inner.token.lock().expect("token poisoned").take() {
            self.inner.locks.transaction_complete(token);
        }
        Ok(())
    }

    async fn abort(&self) -> Result<(), StorageError> {
        {
            let state = self.inner.state.lock().expect("tx state poisoned");
            match *state {
                TxState::Completed => return Err(StorageError::TransactionClosed),
                TxState::Aborted => return Ok(()),
                TxState::Open => {}
            }
        }
        self.inner.abort_internal(&StorageError::TransactionAborted("explicit abort".into())).await;
        Ok(())
    }
}
