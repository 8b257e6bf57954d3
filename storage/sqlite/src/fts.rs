//! Full-text search over SQL backings: native FTS3 MATCH when the engine has
//! it, sentinel-delimited LIKE scans when it does not.

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::Value;

use shale_core::fts::sanitize;
use shale_core::tokenize::tokenize;
use shale_core::{FullTextTermResolution, IndexSchema, StorageError, StoreSchema, MAX_LIMIT};

use crate::driver::SqlCapabilities;
use crate::error::SqliteError;
use crate::layout::{self, IndexBacking, DATA_COLUMN, PK_COLUMN, SIDE_KEY_COLUMN, SIDE_REFPK_COLUMN};
use crate::store::query_items;

/// Delimits tokens in the LIKE-fallback column. Tokenization strips the
/// sentinel's characters, so it can never occur inside a stored token, and
/// the column itself is never surfaced in results.
pub const FTS_SENTINEL: &str = "^$^";

/// The value stored in a LIKE-fallback column: every token of the source
/// text, sentinel-prefixed so `LIKE '%<sep><term>%'` prefix-matches each.
pub(crate) fn fallback_column_value(text: &str) -> Option<String> {
    let terms = tokenize(text);
    if terms.is_empty() {
        None
    } else {
        Some(format!("{}{}", FTS_SENTINEL, terms.join(FTS_SENTINEL)))
    }
}

/// UAX#29 words can contain '_', which is a LIKE wildcard.
fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

pub(crate) fn search(
    c: &Connection,
    store: &StoreSchema,
    index: &IndexSchema,
    caps: &SqlCapabilities,
    phrase: &str,
    resolution: FullTextTermResolution,
    limit: Option<u64>,
) -> Result<Vec<Value>, SqliteError> {
    let terms = tokenize(&sanitize(phrase));
    if terms.is_empty() {
        return Err(SqliteError::Storage(StorageError::invalid_argument("search phrase tokenizes to no terms")));
    }
    let limit = limit.map(|l| l.min(MAX_LIMIT));

    match layout::index_backing(index, caps) {
        IndexBacking::FtsVirtual => search_native(c, store, index, &terms, resolution, limit),
        IndexBacking::Column => search_like(c, store, index, &terms, resolution, limit),
        IndexBacking::SideTable => {
            Err(SqliteError::Storage(StorageError::invalid_argument("index is not a full-text index")))
        }
    }
}

fn limit_clause(limit: Option<u64>, params: &mut Vec<SqlValue>) -> &'static str {
    match limit {
        Some(l) => {
            params.push(SqlValue::Integer(l as i64));
            " LIMIT ?"
        }
        None => "",
    }
}

fn search_native(
    c: &Connection,
    store: &StoreSchema,
    index: &IndexSchema,
    terms: &[String],
    resolution: FullTextTermResolution,
    limit: Option<u64>,
) -> Result<Vec<Value>, SqliteError> {
    let side = layout::side_table_name(&store.name, &index.name);
    let mut params: Vec<SqlValue> = Vec::new();

    let sql = match resolution {
        FullTextTermResolution::And => {
            // FTS3 treats space-separated terms as a conjunction; '*' makes
            // each a prefix match.
            let query = terms.iter().map(|t| format!("{}*", t)).collect::<Vec<_>>().join(" ");
            params.push(SqlValue::Text(query));
            let (select, from) = if index.include_data_in_index {
                (format!("mi.{}", DATA_COLUMN), format!("\"{}\" mi", side))
            } else {
                (
                    format!("b.{}", DATA_COLUMN),
                    format!("\"{}\" mi JOIN \"{}\" b ON b.{} = mi.{}", side, store.name, PK_COLUMN, SIDE_REFPK_COLUMN),
                )
            };
            let mut sql = format!("SELECT {} FROM {} WHERE mi.{} MATCH ?", select, from, SIDE_KEY_COLUMN);
            sql.push_str(limit_clause(limit, &mut params));
            sql
        }
        FullTextTermResolution::Or => {
            // One MATCH subquery per term; MATCH cannot be OR-combined within
            // a single WHERE on FTS3.
            let unions = terms
                .iter()
                .map(|_| format!("SELECT {} FROM \"{}\" WHERE {} MATCH ?", SIDE_REFPK_COLUMN, side, SIDE_KEY_COLUMN))
                .collect::<Vec<_>>()
                .join(" UNION ALL ");
            for term in terms {
                params.push(SqlValue::Text(format!("{}*", term)));
            }
            let ids = format!("(SELECT DISTINCT {} FROM ({})) ids", SIDE_REFPK_COLUMN, unions);
            let mut sql = if index.include_data_in_index {
                format!(
                    "SELECT mi.{} FROM \"{}\" mi JOIN {} ON mi.{} = ids.{}",
                    DATA_COLUMN, side, ids, SIDE_REFPK_COLUMN, SIDE_REFPK_COLUMN
                )
            } else {
                format!(
                    "SELECT b.{} FROM \"{}\" b JOIN {} ON b.{} = ids.{}",
                    DATA_COLUMN, store.name, ids, PK_COLUMN, SIDE_REFPK_COLUMN
                )
            };
            sql.push_str(limit_clause(limit, &mut params));
            sql
        }
    };

    query_items(c, &sql, &params)
}

fn search_like(
    c: &Connection,
    store: &StoreSchema,
    index: &IndexSchema,
    terms: &[String],
    resolution: FullTextTermResolution,
    limit: Option<u64>,
) -> Result<Vec<Value>, SqliteError> {
    let column = layout::index_column(&index.name);
    let mut params: Vec<SqlValue> = Vec::new();
    let clauses: Vec<String> = terms
        .iter()
        .map(|term| {
            params.push(SqlValue::Text(format!("%{}{}%", FTS_SENTINEL, escape_like(term))));
            format!("\"{}\" LIKE ? ESCAPE '\\'", column)
        })
        .collect();
    let joiner = match resolution {
        FullTextTermResolution::And => " AND ",
        FullTextTermResolution::Or => " OR ",
    };
    let mut sql = format!("SELECT {} FROM \"{}\" WHERE ({})", DATA_COLUMN, store.name, clauses.join(joiner));
    sql.push_str(limit_clause(limit, &mut params));
    query_items(c, &sql, &params)
}
