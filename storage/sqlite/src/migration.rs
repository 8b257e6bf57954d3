//! Schema migration: reconcile the declared schema with persisted state.
//!
//! Runs once per open, entirely inside one rusqlite transaction, so a failed
//! migration leaves persisted state untouched. Drift detection compares the
//! canonical CREATE TABLE text against `sqlite_master.sql`, each declared
//! index against its persisted `IndexMetadata` row, and the physical
//! presence of SQL indexes and side tables. Any drift rebuilds the store in
//! place, streaming rows through the normal write path so every index is
//! repopulated.

use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use serde_json::Value;
use shale_core::{IndexMetadata, Schema, StorageError, StoreSchema};
use tracing::{debug, info};

use crate::driver::SqlCapabilities;
use crate::error::SqliteError;
use crate::layout::{
    self, create_index_sql, create_table_sql, required_tables, side_indexes, side_table_name, sql_index_name,
    temp_table_name, DATA_COLUMN, METADATA_TABLE, SCHEMA_VERSION_KEY,
};
use crate::store::{execute_write, prepare_write};

pub(crate) fn migrate_schema(
    c: &mut Connection,
    schema: &Schema,
    caps: &SqlCapabilities,
    wipe_requested: bool,
    verbose: bool,
) -> Result<(), SqliteError> {
    let tx = c.transaction()?;

    tx.execute(&format!("CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY, value TEXT)", METADATA_TABLE), [])?;

    let stored_version = read_stored_version(&tx)?;
    let mut wipe = wipe_requested;
    if let Some(stored) = stored_version {
        if stored > schema.version {
            // New code must not read newer schemas.
            if !wipe_requested {
                return Err(SqliteError::Storage(StorageError::VersionTooNew { stored, declared: schema.version }));
            }
            wipe = true;
        }
        if let Some(last_usable) = schema.last_usable_version {
            if stored < last_usable {
                wipe = true;
            }
        }
    }
    if verbose {
        info!(
            "migrating schema: stored version {:?}, declared {}, wipe {}",
            stored_version, schema.version, wipe
        );
    }

    let tables = existing_tables(&tx)?;
    let shadows = shadow_tables(&tables);
    let metadata = read_index_metadata(&tx)?;

    if wipe {
        drop_all_tables(&tx, &tables, &shadows)?;
        tx.execute(&format!("DELETE FROM {}", METADATA_TABLE), [])?;
    } else {
        // Drop persisted tables the declared schema no longer requires,
        // including stale side tables, along with their metadata rows.
        let required: HashSet<String> = schema.stores.iter().flat_map(|s| required_tables(s, caps)).collect();
        for name in tables.keys() {
            if name == METADATA_TABLE || required.contains(name) || shadows.contains(name) {
                continue;
            }
            debug!("dropping stale table {}", name);
            tx.execute(&format!("DROP TABLE IF EXISTS \"{}\"", name), [])?;
            for meta in metadata.values() {
                if meta.key == *name || meta.store_name == *name {
                    tx.execute(&format!("DELETE FROM {} WHERE name = ?", METADATA_TABLE), [&meta.key])?;
                }
            }
        }
    }

    // Re-snapshot after the drops above.
    let tables = existing_tables(&tx)?;
    let indexes = existing_index_names(&tx)?;
    let metadata = read_index_metadata(&tx)?;

    for store in &schema.stores {
        match tables.get(&store.name) {
            None => {
                debug!("creating store {}", store.name);
                create_store(&tx, store, caps)?;
            }
            Some(existing_sql) => {
                if store_drifts(store, caps, existing_sql.as_deref(), &tables, &indexes, &metadata) {
                    debug!("store {} drifted; rebuilding", store.name);
                    rebuild_store(&tx, store, caps, &metadata)?;
                }
            }
        }
    }

    tx.execute(
        &format!("INSERT OR REPLACE INTO {} (name, value) VALUES (?, ?)", METADATA_TABLE),
        rusqlite::params![SCHEMA_VERSION_KEY, schema.version.to_string()],
    )?;
    tx.commit()?;
    Ok(())
}

fn read_stored_version(c: &Connection) -> Result<Option<u32>, SqliteError> {
    match c.query_row(
        &format!("SELECT value FROM {} WHERE name = ?", METADATA_TABLE),
        [SCHEMA_VERSION_KEY],
        |row| row.get::<_, String>(0),
    ) {
        Ok(value) => Ok(value.parse::<u32>().ok()),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// All user tables, mapped to their stored CREATE text.
fn existing_tables(c: &Connection) -> Result<HashMap<String, Option<String>>, SqliteError> {
    let mut stmt =
        c.prepare("SELECT name, sql FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut tables = HashMap::new();
    for row in rows {
        let (name, sql): (String, Option<String>) = row?;
        tables.insert(name, sql);
    }
    Ok(tables)
}

fn existing_index_names(c: &Connection) -> Result<HashSet<String>, SqliteError> {
    let mut stmt = c.prepare("SELECT name FROM sqlite_master WHERE type='index' AND name NOT LIKE 'sqlite_%'")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut names = HashSet::new();
    for row in rows {
        names.insert(row?);
    }
    Ok(names)
}

fn is_virtual(sql: &Option<String>) -> bool { sql.as_deref().is_some_and(|s| s.starts_with("CREATE VIRTUAL TABLE")) }

/// FTS3 shadow tables (`<vt>_content`, `<vt>_segments`, ...) appear in
/// `sqlite_master` but belong to their virtual table: they must never be
/// dropped directly and vanish when the virtual table is dropped.
fn shadow_tables(tables: &HashMap<String, Option<String>>) -> HashSet<String> {
    let virtual_tables: Vec<&String> = tables.iter().filter(|(_, sql)| is_virtual(sql)).map(|(n, _)| n).collect();
    tables
        .keys()
        .filter(|name| virtual_tables.iter().any(|vt| *name != *vt && name.starts_with(&format!("{}_", vt))))
        .cloned()
        .collect()
}

fn drop_all_tables(
    c: &Connection,
    tables: &HashMap<String, Option<String>>,
    shadows: &HashSet<String>,
) -> Result<(), SqliteError> {
    // Virtual tables first; dropping one removes its shadow tables.
    for (name, sql) in tables {
        if is_virtual(sql) {
            c.execute(&format!("DROP TABLE IF EXISTS \"{}\"", name), [])?;
        }
    }
    for (name, sql) in tables {
        if !is_virtual(sql) && name != METADATA_TABLE && !shadows.contains(name) {
            c.execute(&format!("DROP TABLE IF EXISTS \"{}\"", name), [])?;
        }
    }
    Ok(())
}

fn read_index_metadata(c: &Connection) -> Result<HashMap<String, IndexMetadata>, SqliteError> {
    let mut stmt = c.prepare(&format!("SELECT name, value FROM {} WHERE name != ?", METADATA_TABLE))?;
    let rows = stmt.query_map([SCHEMA_VERSION_KEY], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    let mut metadata = HashMap::new();
    for row in rows {
        let (name, value) = row?;
        // An unparseable row counts as absent, which reads as drift below.
        if let Ok(meta) = serde_json::from_str::<IndexMetadata>(&value) {
            metadata.insert(name, meta);
        }
    }
    Ok(metadata)
}

fn store_drifts(
    store: &StoreSchema,
    caps: &SqlCapabilities,
    existing_sql: Option<&str>,
    tables: &HashMap<String, Option<String>>,
    indexes: &HashSet<String>,
    metadata: &HashMap<String, IndexMetadata>,
) -> bool {
    if existing_sql != Some(create_table_sql(store, caps).as_str()) {
        return true;
    }
    for index in &store.indexes {
        let expected = IndexMetadata::new(&store.name, index);
        match metadata.get(&expected.key) {
            Some(found) if *found == expected => {}
            _ => return true,
        }
        match layout::index_backing(index, caps) {
            layout::IndexBacking::Column => {
                if !index.full_text && !indexes.contains(&sql_index_name(&store.name, &index.name)) {
                    return true;
                }
            }
            _ => {
                if !tables.contains_key(&side_table_name(&store.name, &index.name)) {
                    return true;
                }
            }
        }
    }
    // Metadata rows for indexes the schema no longer declares are drift too.
    let declared: HashSet<&str> = store.indexes.iter().map(|i| i.name.as_str()).collect();
    metadata.values().any(|m| m.store_name == store.name && !declared.contains(m.index.name.as_str()))
}

fn create_store(c: &Connection, store: &StoreSchema, caps: &SqlCapabilities) -> Result<(), SqliteError> {
    let ddl = create_table_sql(store, caps);
    debug!("creating table: {}", ddl);
    c.execute(&ddl, [])?;
    for index in &store.indexes {
        for ddl in create_index_sql(store, index, caps) {
            debug!("creating index artifact: {}", ddl);
            c.execute(&ddl, [])?;
        }
        let meta = IndexMetadata::new(&store.name, index);
        c.execute(
            &format!("INSERT OR REPLACE INTO {} (name, value) VALUES (?, ?)", METADATA_TABLE),
            rusqlite::params![meta.key, serde_json::to_string(&meta)?],
        )?;
    }
    Ok(())
}

/// Rebuild a drifted store in place: drop its dependent indexes and side
/// tables, rename the base table aside, recreate everything from the declared
/// schema, then stream the old rows back through the normal write path.
fn rebuild_store(
    c: &Connection,
    store: &StoreSchema,
    caps: &SqlCapabilities,
    metadata: &HashMap<String, IndexMetadata>,
) -> Result<(), SqliteError> {
    let mut stmt =
        c.prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE ? AND name NOT LIKE 'sqlite_%'")?;
    let dependent: Vec<String> =
        stmt.query_map([format!("idx_{}_%", store.name)], |row| row.get(0))?.collect::<Result<_, _>>()?;
    drop(stmt);
    for name in dependent {
        c.execute(&format!("DROP INDEX IF EXISTS \"{}\"", name), [])?;
    }

    let mut sides: HashSet<String> =
        metadata.values().filter(|m| m.store_name == store.name).map(|m| m.key.clone()).collect();
    sides.extend(side_indexes(store, caps).iter().map(|i| side_table_name(&store.name, &i.name)));
    for side in &sides {
        c.execute(&format!("DROP TABLE IF EXISTS \"{}\"", side), [])?;
    }
    for meta in metadata.values() {
        if meta.store_name == store.name {
            c.execute(&format!("DELETE FROM {} WHERE name = ?", METADATA_TABLE), [&meta.key])?;
        }
    }

    let temp = temp_table_name(&store.name);
    c.execute(&format!("ALTER TABLE \"{}\" RENAME TO \"{}\"", store.name, temp), [])?;
    create_store(c, store, caps)?;

    let mut stmt = c.prepare(&format!("SELECT {} FROM \"{}\"", DATA_COLUMN, temp))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut items: Vec<Value> = Vec::new();
    for row in rows {
        items.push(serde_json::from_str(&row?)?);
    }
    drop(stmt);

    if !items.is_empty() {
        let prepared = prepare_write(store, caps, &items)?;
        execute_write(c, &prepared)?;
    }

    c.execute(&format!("DROP TABLE \"{}\"", temp), [])?;
    Ok(())
}
