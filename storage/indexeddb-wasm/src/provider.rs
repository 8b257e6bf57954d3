//! The IndexedDB provider and its logical transaction surface.
//!
//! Native IndexedDB transactions auto-commit once no requests remain
//! outstanding within a turn, so isolation across awaits comes from the core
//! lock helper: each operation runs in its own short-lived native
//! transaction, admitted under the logical transaction's token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use shale_core::{
    ErrorObserver, Schema, Store, StorageError, Transaction, TransactionLockHelper, TransactionToken,
};
use tracing::{debug, info};

use crate::database::{Database, IdbCapabilities};
use crate::store::IdbStore;

pub struct IndexedDbProvider {
    db: Database,
    schema: Arc<Schema>,
    caps: IdbCapabilities,
    locks: Arc<TransactionLockHelper>,
    observer: Option<Arc<dyn ErrorObserver>>,
    closed: AtomicBool,
}

impl IndexedDbProvider {
    pub async fn open(name: &str, schema: Schema, wipe_if_exists: bool, verbose: bool) -> Result<Self, StorageError> {
        Self::open_with(name, schema, wipe_if_exists, verbose, IdbCapabilities::default(), None).await
    }

    pub async fn open_with(
        name: &str,
        schema: Schema,
        wipe_if_exists: bool,
        verbose: bool,
        caps: IdbCapabilities,
        observer: Option<Arc<dyn ErrorObserver>>,
    ) -> Result<Self, StorageError> {
        schema.validate()?;
        if verbose {
            info!("opening IndexedDB database {} at version {}", name, schema.version);
        }
        let schema = Arc::new(schema);
        let db = Database::open(name, schema.clone(), caps, wipe_if_exists).await?;
        Ok(Self {
            db,
            schema,
            caps,
            locks: Arc::new(TransactionLockHelper::new()),
            observer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn schema(&self) -> &Schema { &self.schema }

    pub async fn open_transaction(&self, store_names: &[&str], write: bool) -> Result<IndexedDbTransaction, StorageError> {
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
        Ok(IndexedDbTransaction {
            inner: Arc::new(IdbTxInner {
                db: self.db.clone(),
                schema: self.schema.clone(),
                caps: self.caps,
                locks: self.locks.clone(),
                write,
                store_names: names,
                state: StdMutex::new(TxState::Open),
                token: StdMutex::new(Some(token)),
                observer: self.observer.clone(),
            }),
        })
    }

    pub async fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.locks.close_when_possible().await;
            self.db.close();
        }
        Ok(())
    }

    pub async fn delete_database(&self) -> Result<(), StorageError> {
        self.close().await?;
        Database::delete(self.db.name()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Completed,
    Aborted,
}

pub(crate) struct IdbTxInner {
    pub(crate) db: Database,
    pub(crate) schema: Arc<Schema>,
    pub(crate) caps: IdbCapabilities,
    locks: Arc<TransactionLockHelper>,
    pub(crate) write: bool,
    store_names: Vec<String>,
    state: StdMutex<TxState>,
    token: StdMutex<Option<TransactionToken>>,
    observer: Option<Arc<dyn ErrorObserver>>,
}

impl IdbTxInner {
    pub(crate) fn ensure_open(&self) -> Result<(), StorageError> {
        match *self.state.lock().expect("tx state poisoned") {
            TxState::Open => Ok(()),
            _ => Err(StorageError::TransactionClosed),
        }
    }

    pub(crate) fn observe(&self, err: &StorageError) {
        if let Some(observer) = &self.observer {
            observer.observe(err);
        }
    }

    /// Record an operation failure. The engine already rolled the failed
    /// native transaction back; a failure in a write-mode logical
    /// transaction poisons the rest of it.
    pub(crate) fn fail(&self, err: &StorageError) {
        if self.write {
            let token = {
                let mut state = self.state.lock().expect("tx state poisoned");
                if *state != TxState::Open {
                    None
                } else {
                    *state = TxState::Aborted;
                    self.token.lock().expect("token poisoned").take()
                }
            };
            if let Some(token) = token {
                self.locks.transaction_failed(token, err);
            }
            debug!("transaction aborted: {}", err);
        }
        self.observe(err);
    }
}

pub struct IndexedDbTransaction {
    inner: Arc<IdbTxInner>,
}

#[async_trait]
impl Transaction for IndexedDbTransaction {
    fn store(&self, name: &str) -> Result<Arc<dyn Store>, StorageError> {
        self.inner.ensure_open()?;
        if !self.inner.store_names.iter().any(|n| n == name) {
            return Err(StorageError::StoreNotFound(name.to_string()));
        }
        let store = self.inner.schema.store(name).ok_or_else(|| StorageError::StoreNotFound(name.to_string()))?.clone();
        Ok(Arc::new(IdbStore::new(self.inner.clone(), store)))
    }

    async fn complete(&self) -> Result<(), StorageError> {
        let token = {
            let mut state = self.inner.state.lock().expect("tx state poisoned");
            match *state {
                TxState::Completed => return Ok(()),
                TxState::Aborted => return Err(StorageError::TransactionAborted("transaction was aborted".into())),
                TxState::Open => {
                    *state = TxState::Completed;
                    self.inner.token.lock().expect("token poisoned").take()
                }
            }
        };
        if let Some(token) = token {
            self.inner.locks.transaction_complete(token);
        }
        Ok(())
    }

    async fn abort(&self) -> Result<(), StorageError> {
        let token = {
            let mut state = self.inner.state.lock().expect("tx state poisoned");
            match *state {
                TxState::Completed => return Err(StorageError::TransactionClosed),
                TxState::Aborted => return Ok(()),
                TxState::Open => {
                    *state = TxState::Aborted;
                    self.inner.token.lock().expect("token poisoned").take()
                }
            }
        };
        if let Some(token) = token {
            self.inner.locks.transaction_failed(token, &StorageError::TransactionAborted("explicit abort".into()));
        }
        Ok(())
    }
}
