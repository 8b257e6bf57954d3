//! Browser IndexedDB storage backend for shale.
//!
//! Stores one structured-clone record per item in one object store per
//! declared store; the item lives under the record's `nsp_data` property and
//! synthetic key material (emulated primary keys, full-text token arrays)
//! sits beside it, never inside the item. Native indexes are used where the
//! engine supports them; when it lacks compound-key support, primary keys
//! are emulated through a pre-computed `nsp_pk` property and
//! compound/multi-entry/full-text indexes through sidecar object stores.
//! Full-text search always runs as prefix-expansion range scans merged per
//! term.
//!
//! Native IndexedDB transactions auto-commit when no requests remain
//! outstanding, so each operation runs in its own native transaction; the
//! logical transaction surface is provided by the core lock helper.

mod cb_future;
mod cb_stream;
mod database;
mod fts;
mod idb_value;
mod provider;
mod require;
mod store;

pub use database::{Database, IdbCapabilities};
pub use provider::{IndexedDbProvider, IndexedDbTransaction};
