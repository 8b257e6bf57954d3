#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};
use shale_core::{IndexSchema, QueryPage, Schema, StoreSchema, Transaction};
use shale_storage_sqlite::{SqlCapabilities, SqliteConfig, SqliteProvider};

static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A unique temp-file path for tests that reopen the same database.
pub fn temp_db_path(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    let n = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("shale_test_{}_{}_{}_{}.db", tag, std::process::id(), nanos, n))
}

pub fn users_schema() -> Schema {
    Schema::new(1, vec![StoreSchema::new("users", "id").with_index(IndexSchema::new("byName", "name"))])
}

pub async fn open_memory(schema: Schema) -> SqliteProvider {
    SqliteProvider::open(SqliteConfig::Memory, schema, false, false).await.expect("open in-memory provider")
}

pub async fn open_memory_with(schema: Schema, caps: SqlCapabilities) -> SqliteProvider {
    SqliteProvider::open_with(SqliteConfig::Memory, schema, false, false, Some(caps), None)
        .await
        .expect("open in-memory provider")
}

/// Put items in a fresh write transaction and commit.
pub async fn put_items(provider: &SqliteProvider, store: &str, items: &[Value]) {
    let tx = provider.open_transaction(&[store], true).await.expect("open write transaction");
    tx.store(store).unwrap().put(items).await.expect("put items");
    tx.complete().await.expect("commit");
}

/// Read every item in primary-key order through a fresh read transaction.
pub async fn all_items(provider: &SqliteProvider, store: &str) -> Vec<Value> {
    let tx = provider.open_transaction(&[store], false).await.expect("open read transaction");
    let items = tx.store(store).unwrap().open_primary_key().unwrap().get_all(QueryPage::default()).await.unwrap();
    tx.complete().await.unwrap();
    items
}

pub fn user(id: &str, name: &str) -> Value { json!({"id": id, "name": name}) }

pub fn ids(items: &[Value]) -> Vec<String> {
    items.iter().map(|i| i["id"].as_str().unwrap_or_default().to_string()).collect()
}
