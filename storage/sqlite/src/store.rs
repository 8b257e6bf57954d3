//! The SQL store/index runtime: batched writes, key lookups, and index scans
//! shared by live transactions and the migration engine's rebuild path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;

use shale_core::keypath::{self, index_key_from_item, list_of_keys, serialize_key, serialize_key_from_item, serialize_scalar};
use shale_core::schema::KeyPath;
use shale_core::{FullTextTermResolution, Index, IndexSchema, KeyRange, QueryPage, StorageError, Store, StoreSchema};

use crate::driver::SqlCapabilities;
use crate::error::SqliteError;
use crate::fts;
use crate::layout::{self, IndexBacking, DATA_COLUMN, PK_COLUMN, SIDE_KEY_COLUMN, SIDE_REFPK_COLUMN};
use crate::provider::TxInner;

/// Remove U+2028/U+2029, which some embedded drivers cannot store.
pub(crate) fn strip_unstorable(data: &str) -> String {
    data.chars().filter(|c| !matches!(c, '\u{2028}' | '\u{2029}')).collect()
}

pub(crate) struct SideWrite {
    pub table: String,
    pub include_data: bool,
    /// (key, refpk, data)
    pub rows: Vec<(String, String, Option<String>)>,
}

/// Everything `execute_write` needs, computed up front so key serialization
/// failures surface before any statement runs.
pub(crate) struct PreparedWrite {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
    pub pks: Vec<String>,
    pub side_writes: Vec<SideWrite>,
    pub max_variables: usize,
}

pub(crate) fn prepare_write(store: &StoreSchema, caps: &SqlCapabilities, items: &[Value]) -> Result<PreparedWrite, StorageError> {
    let columns = layout::base_columns(store, caps);
    let column_indexes = layout::column_indexes(store, caps);
    let side_schemas = layout::side_indexes(store, caps);

    let mut row_of: HashMap<String, usize> = HashMap::new();
    let mut rows: Vec<Vec<SqlValue>> = Vec::new();
    let mut pks: Vec<String> = Vec::new();
    let mut side_rows: Vec<HashMap<String, Vec<(String, Option<String>)>>> =
        side_schemas.iter().map(|_| HashMap::new()).collect();

    for item in items {
        let pk = serialize_key_from_item(item, &store.primary_key_path)?;
        let mut data = serde_json::to_string(item).map_err(StorageError::from)?;
        if caps.requires_unicode_replacement {
            data = strip_unstorable(&data);
        }

        let mut row: Vec<SqlValue> = Vec::with_capacity(columns.len());
        row.push(SqlValue::Text(pk.clone()));
        row.push(SqlValue::Text(data.clone()));
        for index in &column_indexes {
            let cell = if index.full_text {
                keypath::extract(item, &index.key_path.components()[0])
                    .and_then(|v| v.as_str())
                    .and_then(fts::fallback_column_value)
            } else {
                index_key_from_item(item, &index.key_path)
            };
            row.push(cell.map(SqlValue::Text).unwrap_or(SqlValue::Null));
        }

        for (i, index) in side_schemas.iter().enumerate() {
            let keys = side_entry_keys(item, index);
            let data_cell = index.include_data_in_index.then(|| data.clone());
            // Last write for a primary key wins, matching INSERT OR REPLACE.
            side_rows[i].insert(pk.clone(), keys.into_iter().map(|k| (k, data_cell.clone())).collect());
        }

        match row_of.get(&pk) {
            Some(&existing) => rows[existing] = row,
            None => {
                row_of.insert(pk.clone(), rows.len());
                rows.push(row);
                pks.push(pk);
            }
        }
    }

    let side_writes = side_schemas
        .iter()
        .enumerate()
        .map(|(i, index)| SideWrite {
            table: layout::side_table_name(&store.name, &index.name),
            include_data: index.include_data_in_index,
            rows: pks
                .iter()
                .flat_map(|pk| {
                    side_rows[i]
                        .get(pk)
                        .into_iter()
                        .flatten()
                        .map(|(key, data)| (key.clone(), pk.clone(), data.clone()))
                })
                .collect(),
        })
        .collect();

    Ok(PreparedWrite { table: store.name.clone(), columns, rows, pks, side_writes, max_variables: caps.max_variables })
}

/// Side-table entries contributed by one item: one per distinct array element
/// for a multi-entry index, one joined-token row for a native full-text
/// index. Values that cannot serve as keys contribute nothing.
fn side_entry_keys(item: &Value, index: &IndexSchema) -> Vec<String> {
    let path = &index.key_path.components()[0];
    if index.full_text {
        let Some(text) = keypath::extract(item, path).and_then(|v| v.as_str()) else {
            return Vec::new();
        };
        let terms = shale_core::tokenize::tokenize(text);
        if terms.is_empty() {
            Vec::new()
        } else {
            vec![terms.join(" ")]
        }
    } else {
        match keypath::extract(item, path) {
            Some(Value::Array(values)) => {
                let mut seen = HashSet::new();
                values
                    .iter()
                    .filter_map(|v| serialize_scalar(v).ok())
                    .filter(|k| seen.insert(k.clone()))
                    .collect()
            }
            Some(value) => serialize_scalar(value).ok().into_iter().collect(),
            None => Vec::new(),
        }
    }
}

fn delete_side_rows(c: &Connection, table: &str, pks: &[String], max_variables: usize) -> Result<(), SqliteError> {
    for chunk in pks.chunks(max_variables.max(1)) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("DELETE FROM \"{}\" WHERE {} IN ({})", table, SIDE_REFPK_COLUMN, placeholders);
        c.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    Ok(())
}

pub(crate) fn execute_write(c: &Connection, write: &PreparedWrite) -> Result<(), SqliteError> {
    // Purge existing side rows for every written primary key, then re-insert.
    for side in &write.side_writes {
        delete_side_rows(c, &side.table, &write.pks, write.max_variables)?;
    }

    if !write.rows.is_empty() {
        let ncols = write.columns.len();
        let rows_per_batch = (write.max_variables / ncols).max(1);
        let column_list = write.columns.iter().map(|c| format!("\"{}\"", c)).collect::<Vec<_>>().join(", ");
        let row_placeholders = format!("({})", vec!["?"; ncols].join(", "));
        for chunk in write.rows.chunks(rows_per_batch) {
            let sql = format!(
                "INSERT OR REPLACE INTO \"{}\" ({}) VALUES {}",
                write.table,
                column_list,
                vec![row_placeholders.as_str(); chunk.len()].join(", ")
            );
            c.execute(&sql, params_from_iter(chunk.iter().flatten()))?;
        }
    }

    for side in &write.side_writes {
        if side.rows.is_empty() {
            continue;
        }
        let ncols = if side.include_data { 3 } else { 2 };
        let rows_per_batch = (write.max_variables / ncols).max(1);
        let column_list = if side.include_data {
            format!("({}, {}, {})", SIDE_KEY_COLUMN, SIDE_REFPK_COLUMN, DATA_COLUMN)
        } else {
            format!("({}, {})", SIDE_KEY_COLUMN, SIDE_REFPK_COLUMN)
        };
        let row_placeholders = if side.include_data { "(?, ?, ?)" } else { "(?, ?)" };
        for chunk in side.rows.chunks(rows_per_batch) {
            let sql = format!(
                "INSERT INTO \"{}\" {} VALUES {}",
                side.table,
                column_list,
                vec![row_placeholders; chunk.len()].join(", ")
            );
            let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() * ncols);
            for (key, refpk, data) in chunk {
                params.push(key);
                params.push(refpk);
                if side.include_data {
                    params.push(data);
                }
            }
            c.execute(&sql, params.as_slice())?;
        }
    }
    Ok(())
}

pub(crate) fn execute_remove(
    c: &Connection,
    store: &StoreSchema,
    caps: &SqlCapabilities,
    pks: &[String],
) -> Result<(), SqliteError> {
    for index in layout::side_indexes(store, caps) {
        delete_side_rows(c, &layout::side_table_name(&store.name, &index.name), pks, caps.max_variables)?;
    }
    for chunk in pks.chunks(caps.max_variables.max(1)) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("DELETE FROM \"{}\" WHERE {} IN ({})", store.name, PK_COLUMN, placeholders);
        c.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    Ok(())
}

/// Run a SELECT whose single column is a serialized item; parse each row.
pub(crate) fn query_items(c: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Value>, SqliteError> {
    let mut stmt = c.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?;
    let mut items = Vec::new();
    for row in rows {
        items.push(serde_json::from_str(&row?)?);
    }
    Ok(items)
}

pub(crate) struct SqlStore {
    tx: Arc<TxInner>,
    store: StoreSchema,
}

impl SqlStore {
    pub(crate) fn new(tx: Arc<TxInner>, store: StoreSchema) -> Self { Self { tx, store } }

    fn ensure_writable(&self) -> Result<(), StorageError> {
        if self.tx.write {
            Ok(())
        } else {
            Err(StorageError::invalid_argument("write operation on a read-only transaction"))
        }
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn get(&self, key: &Value) -> Result<Option<Value>, StorageError> {
        let pk = serialize_key(key, &self.store.primary_key_path)?;
        let sql = format!("SELECT {} FROM \"{}\" WHERE {} = ?", DATA_COLUMN, self.store.name, PK_COLUMN);
        self.tx
            .run(move |c| match c.query_row(&sql, [&pk], |row| row.get::<_, String>(0)) {
                Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            })
            .await
    }

    async fn get_multiple(&self, keys: &Value) -> Result<Vec<Value>, StorageError> {
        let pks = list_of_keys(keys, &self.store.primary_key_path)?;
        if pks.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.store.name.clone();
        let max_variables = self.tx.caps.max_variables;
        self.tx
            .run(move |c| {
                let mut found: HashMap<String, Value> = HashMap::new();
                for chunk in pks.chunks(max_variables.max(1)) {
                    let placeholders = vec!["?"; chunk.len()].join(", ");
                    let sql = format!(
                        "SELECT {}, {} FROM \"{}\" WHERE {} IN ({})",
                        PK_COLUMN, DATA_COLUMN, table, PK_COLUMN, placeholders
                    );
                    let mut stmt = c.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params_from_iter(chunk.iter()), |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                        })?;
                    for row in rows {
                        let (pk, data) = row?;
                        found.insert(pk, serde_json::from_str(&data)?);
                    }
                }
                Ok(pks.iter().filter_map(|pk| found.remove(pk)).collect())
            })
            .await
    }

    async fn put(&self, items: &[Value]) -> Result<(), StorageError> {
        self.ensure_writable()?;
        if items.is_empty() {
            return Ok(());
        }
        let prepared = prepare_write(&self.store, &self.tx.caps, items)?;
        self.tx.run(move |c| execute_write(c, &prepared)).await
    }

    async fn remove(&self, keys: &Value) -> Result<(), StorageError> {
        self.ensure_writable()?;
        let pks = list_of_keys(keys, &self.store.primary_key_path)?;
        if pks.is_empty() {
            return Ok(());
        }
        let store = self.store.clone();
        let caps = self.tx.caps;
        self.tx.run(move |c| execute_remove(c, &store, &caps, &pks)).await
    }

    async fn clear_all_data(&self) -> Result<(), StorageError> {
        self.ensure_writable()?;
        let store = self.store.clone();
        let caps = self.tx.caps;
        self.tx
            .run(move |c| {
                for index in layout::side_indexes(&store, &caps) {
                    c.execute(&format!("DELETE FROM \"{}\"", layout::side_table_name(&store.name, &index.name)), [])?;
                }
                c.execute(&format!("DELETE FROM \"{}\"", store.name), [])?;
                Ok(())
            })
            .await
    }

    fn open_primary_key(&self) -> Result<Arc<dyn Index>, StorageError> {
        Ok(Arc::new(SqlIndex { tx: self.tx.clone(), store: self.store.clone(), index: None }))
    }

    fn open_index(&self, name: &str) -> Result<Arc<dyn Index>, StorageError> {
        let index = self.store.index(name).ok_or_else(|| StorageError::IndexNotFound(name.to_string()))?.clone();
        Ok(Arc::new(SqlIndex { tx: self.tx.clone(), store: self.store.clone(), index: Some(index) }))
    }
}

enum KeyFilter {
    All,
    Only(String),
    Range { low: Option<String>, high: Option<String>, low_exclusive: bool, high_exclusive: bool },
}

/// A view over the primary key (`index: None`) or one secondary index.
pub(crate) struct SqlIndex {
    tx: Arc<TxInner>,
    store: StoreSchema,
    index: Option<IndexSchema>,
}

impl SqlIndex {
    fn key_path(&self) -> &KeyPath {
        self.index.as_ref().map(|i| &i.key_path).unwrap_or(&self.store.primary_key_path)
    }

    fn scan_sql(&self, filter: &KeyFilter, page: QueryPage, count: bool) -> (String, Vec<SqlValue>) {
        let (from, key_expr, select_expr, not_null) = match &self.index {
            None => (format!("\"{}\"", self.store.name), PK_COLUMN.to_string(), DATA_COLUMN.to_string(), false),
            Some(index) => match layout::index_backing(index, &self.tx.caps) {
                IndexBacking::Column => (
                    format!("\"{}\"", self.store.name),
                    layout::index_column(&index.name),
                    DATA_COLUMN.to_string(),
                    true,
                ),
                IndexBacking::SideTable | IndexBacking::FtsVirtual => {
                    let side = layout::side_table_name(&self.store.name, &index.name);
                    if index.include_data_in_index {
                        (format!("\"{}\" mi", side), format!("mi.{}", SIDE_KEY_COLUMN), format!("mi.{}", DATA_COLUMN), false)
                    } else {
                        (
                            format!(
                                "\"{}\" mi JOIN \"{}\" b ON b.{} = mi.{}",
                                side, self.store.name, PK_COLUMN, SIDE_REFPK_COLUMN
                            ),
                            format!("mi.{}", SIDE_KEY_COLUMN),
                            format!("b.{}", DATA_COLUMN),
                            false,
                        )
                    }
                }
            },
        };

        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        if not_null {
            clauses.push(format!("{} IS NOT NULL", key_expr));
        }
        match filter {
            KeyFilter::All => {}
            KeyFilter::Only(key) => {
                clauses.push(format!("{} = ?", key_expr));
                params.push(SqlValue::Text(key.clone()));
            }
            KeyFilter::Range { low, high, low_exclusive, high_exclusive } => {
                if let Some(low) = low {
                    clauses.push(format!("{} {} ?", key_expr, if *low_exclusive { ">" } else { ">=" }));
                    params.push(SqlValue::Text(low.clone()));
                }
                if let Some(high) = high {
                    clauses.push(format!("{} {} ?", key_expr, if *high_exclusive { "<" } else { "<=" }));
                    params.push(SqlValue::Text(high.clone()));
                }
            }
        }
        let where_clause = if clauses.is_empty() { String::new() } else { format!(" WHERE {}", clauses.join(" AND ")) };

        if count {
            return (format!("SELECT COUNT(*) FROM {}{}", from, where_clause), params);
        }

        let direction = if page.reverse { "DESC" } else { "ASC" };
        let mut sql = format!("SELECT {} FROM {}{} ORDER BY {} {}", select_expr, from, where_clause, key_expr, direction);
        match (page.effective_limit(), page.offset) {
            (Some(limit), Some(offset)) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                params.push(SqlValue::Integer(limit as i64));
                params.push(SqlValue::Integer(offset as i64));
            }
            (Some(limit), None) => {
                sql.push_str(" LIMIT ?");
                params.push(SqlValue::Integer(limit as i64));
            }
            (None, Some(offset)) => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                params.push(SqlValue::Integer(offset as i64));
            }
            (None, None) => {}
        }
        (sql, params)
    }

    async fn fetch(&self, filter: KeyFilter, page: QueryPage) -> Result<Vec<Value>, StorageError> {
        let (sql, params) = self.scan_sql(&filter, page, false);
        self.tx.run(move |c| query_items(c, &sql, &params)).await
    }

    async fn count(&self, filter: KeyFilter) -> Result<u64, StorageError> {
        let (sql, params) = self.scan_sql(&filter, QueryPage::default(), true);
        self.tx
            .run(move |c| Ok(c.query_row(&sql, params_from_iter(params.iter()), |row| row.get::<_, i64>(0))? as u64))
            .await
    }

    fn range_filter(&self, range: &KeyRange) -> Result<KeyFilter, StorageError> {
        let low = range.low.as_ref().map(|k| serialize_key(k, self.key_path())).transpose()?;
        let high = range.high.as_ref().map(|k| serialize_key(k, self.key_path())).transpose()?;
        Ok(KeyFilter::Range { low, high, low_exclusive: range.low_exclusive, high_exclusive: range.high_exclusive })
    }
}

#[async_trait]
impl Index for SqlIndex {
    async fn get_all(&self, page: QueryPage) -> Result<Vec<Value>, StorageError> { self.fetch(KeyFilter::All, page).await }

    async fn get_only(&self, key: &Value, page: QueryPage) -> Result<Vec<Value>, StorageError> {
        let key = serialize_key(key, self.key_path())?;
        self.fetch(KeyFilter::Only(key), page).await
    }

    async fn get_range(&self, range: &KeyRange, page: QueryPage) -> Result<Vec<Value>, StorageError> {
        let filter = self.range_filter(range)?;
        self.fetch(filter, page).await
    }

    async fn count_all(&self) -> Result<u64, StorageError> { self.count(KeyFilter::All).await }

    async fn count_only(&self, key: &Value) -> Result<u64, StorageError> {
        let key = serialize_key(key, self.key_path())?;
        self.count(KeyFilter::Only(key)).await
    }

    async fn count_range(&self, range: &KeyRange) -> Result<u64, StorageError> {
        let filter = self.range_filter(range)?;
        self.count(filter).await
    }

    async fn full_text_search(
        &self,
        phrase: &str,
        resolution: FullTextTermResolution,
        limit: Option<u64>,
    ) -> Result<Vec<Value>, StorageError> {
        let index = match &self.index {
            Some(index) if index.full_text => index.clone(),
            _ => return Err(StorageError::invalid_argument("full-text search requires a full-text index")),
        };
        let store = self.store.clone();
        let caps = self.tx.caps;
        let phrase = phrase.to_string();
        self.tx.run(move |c| fts::search(c, &store, &index, &caps, &phrase, resolution, limit)).await
    }
}
