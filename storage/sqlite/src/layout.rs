//! Persisted table layout: canonical DDL text and naming.
//!
//! The CREATE TABLE text produced here is compared byte-for-byte against
//! `sqlite_master.sql` to detect layout drift, so it must be regenerated
//! identically for a given schema forever.

use shale_core::{IndexSchema, StoreSchema};

use crate::driver::SqlCapabilities;

pub const METADATA_TABLE: &str = "metadata";
pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";
pub const PK_COLUMN: &str = "nsp_pk";
pub const DATA_COLUMN: &str = "nsp_data";
pub const SIDE_KEY_COLUMN: &str = "nsp_key";
pub const SIDE_REFPK_COLUMN: &str = "nsp_refpk";

/// How an index is physically realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBacking {
    /// A `nsp_i_*` TEXT column on the base table (plus a SQL index, except
    /// for LIKE-fallback full-text columns, which LIKE cannot use anyway).
    Column,
    /// A `<store>_<index>` side table holding one row per entry.
    SideTable,
    /// An FTS3 virtual table named like a side table.
    FtsVirtual,
}

pub fn index_backing(index: &IndexSchema, caps: &SqlCapabilities) -> IndexBacking {
    if index.multi_entry {
        IndexBacking::SideTable
    } else if index.full_text && caps.supports_fts3 {
        IndexBacking::FtsVirtual
    } else {
        IndexBacking::Column
    }
}

pub fn index_column(index_name: &str) -> String { format!("nsp_i_{}", index_name) }

pub fn side_table_name(store_name: &str, index_name: &str) -> String { format!("{}_{}", store_name, index_name) }

pub fn sql_index_name(store_name: &str, index_name: &str) -> String { format!("idx_{}_{}", store_name, index_name) }

pub fn temp_table_name(store_name: &str) -> String { format!("temp_{}", store_name) }

pub fn column_indexes<'a>(store: &'a StoreSchema, caps: &SqlCapabilities) -> Vec<&'a IndexSchema> {
    store.indexes.iter().filter(|i| index_backing(i, caps) == IndexBacking::Column).collect()
}

pub fn side_indexes<'a>(store: &'a StoreSchema, caps: &SqlCapabilities) -> Vec<&'a IndexSchema> {
    store.indexes.iter().filter(|i| index_backing(i, caps) != IndexBacking::Column).collect()
}

/// Base-table column names in insertion order.
pub fn base_columns(store: &StoreSchema, caps: &SqlCapabilities) -> Vec<String> {
    let mut columns = vec![PK_COLUMN.to_string(), DATA_COLUMN.to_string()];
    columns.extend(column_indexes(store, caps).iter().map(|i| index_column(&i.name)));
    columns
}

/// The canonical CREATE TABLE text for a store's base table.
pub fn create_table_sql(store: &StoreSchema, caps: &SqlCapabilities) -> String {
    let mut extra = String::new();
    for index in column_indexes(store, caps) {
        extra.push_str(&format!(", {} TEXT", index_column(&index.name)));
    }
    format!("CREATE TABLE \"{}\" ({} TEXT PRIMARY KEY, {} TEXT{})", store.name, PK_COLUMN, DATA_COLUMN, extra)
}

/// DDL for one index: the SQL index over a column, or the side table (plus
/// its own indexes) for multi-entry, or the FTS3 virtual table.
pub fn create_index_sql(store: &StoreSchema, index: &IndexSchema, caps: &SqlCapabilities) -> Vec<String> {
    match index_backing(index, caps) {
        IndexBacking::Column => {
            if index.full_text {
                // LIKE fallback column; a btree index cannot serve LIKE '%...'.
                Vec::new()
            } else {
                let unique = if index.unique { "UNIQUE " } else { "" };
                vec![format!(
                    "CREATE {}INDEX \"{}\" ON \"{}\" ({})",
                    unique,
                    sql_index_name(&store.name, &index.name),
                    store.name,
                    index_column(&index.name)
                )]
            }
        }
        IndexBacking::SideTable => {
            let side = side_table_name(&store.name, &index.name);
            let data_column = if index.include_data_in_index { format!(", {} TEXT", DATA_COLUMN) } else { String::new() };
            let unique = if index.unique { "UNIQUE " } else { "" };
            vec![
                format!("CREATE TABLE \"{}\" ({} TEXT, {} TEXT{})", side, SIDE_KEY_COLUMN, SIDE_REFPK_COLUMN, data_column),
                format!(
                    "CREATE {}INDEX \"{}_key\" ON \"{}\" ({})",
                    unique,
                    sql_index_name(&store.name, &index.name),
                    side,
                    SIDE_KEY_COLUMN
                ),
                format!(
                    "CREATE INDEX \"{}_refpk\" ON \"{}\" ({})",
                    sql_index_name(&store.name, &index.name),
                    side,
                    SIDE_REFPK_COLUMN
                ),
            ]
        }
        IndexBacking::FtsVirtual => {
            let side = side_table_name(&store.name, &index.name);
            let data_column = if index.include_data_in_index { format!(", {} TEXT", DATA_COLUMN) } else { String::new() };
            vec![format!(
                "CREATE VIRTUAL TABLE \"{}\" USING fts3({} TEXT, {} TEXT{})",
                side, SIDE_KEY_COLUMN, SIDE_REFPK_COLUMN, data_column
            )]
        }
    }
}

/// Table names this store requires: the base table plus one side table per
/// side-backed index.
pub fn required_tables(store: &StoreSchema, caps: &SqlCapabilities) -> Vec<String> {
    let mut names = vec![store.name.clone()];
    names.extend(side_indexes(store, caps).iter().map(|i| side_table_name(&store.name, &i.name)));
    names
}
