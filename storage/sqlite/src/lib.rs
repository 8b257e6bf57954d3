//! SQLite storage backend for shale.
//!
//! Persists each store as a base table (`nsp_pk`, `nsp_data`, plus one
//! `nsp_i_*` TEXT column per column-based index), with side tables for
//! multi-entry and native-FTS indexes and a `metadata` table driving schema
//! migration. The `rusqlite` crate with the "bundled" feature supplies the
//! engine; the connection is owned exclusively by the provider and shared
//! through a `spawn_blocking` adapter.

mod connection;
mod driver;
mod error;
pub mod fts;
mod layout;
mod migration;
mod provider;
mod store;

pub use connection::{SharedConnection, SqliteConfig};
pub use driver::SqlCapabilities;
pub use error::SqliteError;
pub use provider::{SqliteProvider, SqliteTransaction};
