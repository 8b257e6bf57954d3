//! Core model for the shale indexed object store.
//!
//! Backends (SQLite, IndexedDB) implement the provider surface defined here.
//! Everything in this crate is backend-neutral: the declared [`Schema`], the
//! key-path codec, the full-text tokenizer, the transaction lock helper and
//! the async `Transaction`/`Store`/`Index` trait surface.

pub mod error;
pub mod fts;
pub mod keypath;
pub mod lock;
pub mod provider;
pub mod schema;
pub mod tokenize;

pub use error::StorageError;
pub use lock::{TransactionLockHelper, TransactionToken};
pub use provider::{ErrorObserver, FullTextTermResolution, Index, KeyRange, QueryPage, Store, Transaction, MAX_LIMIT};
pub use schema::{IndexMetadata, IndexSchema, KeyPath, Schema, StoreSchema};
