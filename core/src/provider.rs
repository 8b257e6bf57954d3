//! The backend-neutral transaction/store/index trait surface.
//!
//! Backends hand out `Arc<dyn Store>` / `Arc<dyn Index>` handles owned by an
//! open transaction; the handles hold a non-owning back-reference resolved
//! through the transaction's lifetime and fail with `TransactionClosed` once
//! it completes or aborts.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;

/// Hard cap applied to caller-supplied limits.
pub const MAX_LIMIT: u64 = 1 << 32;

/// Combinator used to merge per-term results of a full-text search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullTextTermResolution {
    And,
    Or,
}

/// Pagination and direction for index scans.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryPage {
    pub reverse: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryPage {
    pub fn limited(limit: u64) -> Self { Self { limit: Some(limit), ..Self::default() } }

    pub fn reversed() -> Self { Self { reverse: true, ..Self::default() } }

    pub fn effective_limit(&self) -> Option<u64> { self.limit.map(|l| l.min(MAX_LIMIT)) }
}

/// Bounds for a range scan. Bounds are inclusive unless flagged exclusive;
/// either side may be absent.
#[derive(Debug, Clone, Default)]
pub struct KeyRange {
    pub low: Option<Value>,
    pub high: Option<Value>,
    pub low_exclusive: bool,
    pub high_exclusive: bool,
}

impl KeyRange {
    pub fn new(low: Option<Value>, high: Option<Value>, low_exclusive: bool, high_exclusive: bool) -> Self {
        Self { low, high, low_exclusive, high_exclusive }
    }

    pub fn between(low: Value, high: Value) -> Self { Self::new(Some(low), Some(high), false, false) }
}

/// An open transaction over a named set of stores.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Borrow a store handle. Fails with `StoreNotFound` for names outside
    /// the transaction's store set and `TransactionClosed` afterwards.
    fn store(&self, name: &str) -> Result<Arc<dyn Store>, StorageError>;

    /// Commit (write mode) or finish (read mode) and resolve once the
    /// backend acknowledges. Resolving a second time is a no-op.
    async fn complete(&self) -> Result<(), StorageError>;

    /// Fail all pending operations with `TransactionAborted`, roll back, and
    /// release locks.
    async fn abort(&self) -> Result<(), StorageError>;
}

/// A named collection of items keyed by primary key.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &Value) -> Result<Option<Value>, StorageError>;

    /// Fetch several keys; missing keys are omitted, order follows the input.
    async fn get_multiple(&self, keys: &Value) -> Result<Vec<Value>, StorageError>;

    /// Insert or replace items, re-populating every index.
    async fn put(&self, items: &[Value]) -> Result<(), StorageError>;

    /// Delete by key(s), purging side-table rows first.
    async fn remove(&self, keys: &Value) -> Result<(), StorageError>;

    /// Unconditionally empty the store and every side table.
    async fn clear_all_data(&self) -> Result<(), StorageError>;

    fn open_primary_key(&self) -> Result<Arc<dyn Index>, StorageError>;

    fn open_index(&self, name: &str) -> Result<Arc<dyn Index>, StorageError>;
}

/// A view over a primary key or secondary index.
#[async_trait]
pub trait Index: Send + Sync {
    async fn get_all(&self, page: QueryPage) -> Result<Vec<Value>, StorageError>;

    async fn get_only(&self, key: &Value, page: QueryPage) -> Result<Vec<Value>, StorageError>;

    async fn get_range(&self, range: &KeyRange, page: QueryPage) -> Result<Vec<Value>, StorageError>;

    async fn count_all(&self) -> Result<u64, StorageError>;

    async fn count_only(&self, key: &Value) -> Result<u64, StorageError>;

    async fn count_range(&self, range: &KeyRange) -> Result<u64, StorageError>;

    /// Term-resolution search over a full-text index. `InvalidArgument` when
    /// the index is not full-text or the phrase tokenizes to nothing.
    async fn full_text_search(
        &self,
        phrase: &str,
        resolution: FullTextTermResolution,
        limit: Option<u64>,
    ) -> Result<Vec<Value>, StorageError>;
}

/// Observes every operation rejection a provider surfaces. Purely additive;
/// the original rejection always propagates to the caller.
pub trait ErrorObserver: Send + Sync {
    fn observe(&self, err: &StorageError);
}
