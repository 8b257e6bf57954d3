//! Driver capability flags for the SQL statement-executor adapter.

use rusqlite::Connection;

use crate::error::SqliteError;

/// What the underlying SQL engine can do. These flags steer index layout
/// (`supports_fts3`), put batching (`max_variables`) and payload scrubbing
/// (`requires_unicode_replacement`).
#[derive(Debug, Clone, Copy)]
pub struct SqlCapabilities {
    /// Parameter cap per statement; multi-row inserts batch under this.
    pub max_variables: usize,
    /// Native FTS3 virtual tables. Without it, full-text indexes fall back
    /// to a sentinel-delimited token column queried with LIKE.
    pub supports_fts3: bool,
    /// Strip U+2028/U+2029 from serialized payloads before insertion.
    pub requires_unicode_replacement: bool,
}

impl Default for SqlCapabilities {
    fn default() -> Self { Self { max_variables: 999, supports_fts3: true, requires_unicode_replacement: false } }
}

/// Probe FTS3 availability by creating a throwaway virtual table in the temp
/// schema. Build variants without the FTS3 module fail the CREATE.
pub fn probe_fts3(conn: &Connection) -> bool {
    let probed = conn
        .execute_batch(
            "CREATE VIRTUAL TABLE temp.fts3_probe USING fts3(x);
             DROP TABLE temp.fts3_probe;",
        )
        .is_ok();
    tracing::debug!("FTS3 probe: {}", if probed { "available" } else { "unavailable" });
    probed
}

#[allow(dead_code)]
pub fn probe_capabilities(conn: &Connection) -> Result<SqlCapabilities, SqliteError> {
    Ok(SqlCapabilities { supports_fts3: probe_fts3(conn), ..SqlCapabilities::default() })
}
