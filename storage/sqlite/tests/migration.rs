mod common;

use common::*;
use serde_json::json;
use shale_core::{IndexSchema, KeyRange, QueryPage, Schema, StorageError, StoreSchema, Transaction};
use shale_storage_sqlite::{SqliteConfig, SqliteProvider};

async fn open_file(path: &std::path::Path, schema: Schema, wipe: bool) -> Result<SqliteProvider, StorageError> {
    SqliteProvider::open(SqliteConfig::File(path.to_path_buf()), schema, wipe, false).await
}

/// Inspect the raw database after the provider is closed.
fn inspect<T>(path: &std::path::Path, f: impl FnOnce(&rusqlite::Connection) -> T) -> T {
    let conn = rusqlite::Connection::open(path).unwrap();
    f(&conn)
}

fn stored_version(c: &rusqlite::Connection) -> String {
    c.query_row("SELECT value FROM metadata WHERE name = 'schemaVersion'", [], |r| r.get(0)).unwrap()
}

fn table_names(c: &rusqlite::Connection) -> Vec<String> {
    let mut stmt =
        c.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name").unwrap();
    stmt.query_map([], |r| r.get(0)).unwrap().collect::<Result<_, _>>().unwrap()
}

#[tokio::test]
async fn test_open_twice_is_idempotent() {
    let path = temp_db_path("idempotent");
    let provider = open_file(&path, users_schema(), false).await.unwrap();
    put_items(&provider, "users", &[user("a", "Ann")]).await;
    provider.close().await.unwrap();

    let before = inspect(&path, |c| {
        (table_names(c), c.query_row("SELECT sql FROM sqlite_master WHERE name='users'", [], |r| r.get::<_, String>(0)).unwrap())
    });

    let provider = open_file(&path, users_schema(), false).await.unwrap();
    assert_eq!(ids(&all_items(&provider, "users").await), vec!["a"]);
    provider.close().await.unwrap();

    let after = inspect(&path, |c| {
        let version = stored_version(c);
        (table_names(c), c.query_row("SELECT sql FROM sqlite_master WHERE name='users'", [], |r| r.get::<_, String>(0)).unwrap(), version)
    });
    assert_eq!(before.0, after.0);
    assert_eq!(before.1, after.1);
    assert_eq!(after.2, "1");

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_index_key_path_change_rebuilds_store() {
    let path = temp_db_path("keypath_change");
    let v1 = Schema::new(1, vec![StoreSchema::new("users", "id").with_index(IndexSchema::new("byName", "name"))]);
    let provider = open_file(&path, v1, false).await.unwrap();
    put_items(&provider, "users", &[json!({"id": "a", "name": "Ann", "nm": "ann"}), json!({"id": "b", "name": "Bob", "nm": "bob"})])
        .await;
    provider.close().await.unwrap();

    let v2 = Schema::new(2, vec![StoreSchema::new("users", "id").with_index(IndexSchema::new("byName", "nm"))]);
    let provider = open_file(&path, v2, false).await.unwrap();

    // Pre-existing rows are queryable through the re-keyed index.
    let tx = provider.open_transaction(&["users"], false).await.unwrap();
    let index = tx.store("users").unwrap().open_index("byName").unwrap();
    let range = KeyRange::new(Some(json!("ann")), Some(json!("bob")), false, false);
    assert_eq!(ids(&index.get_range(&range, QueryPage::default()).await.unwrap()), vec!["a", "b"]);
    tx.complete().await.unwrap();
    provider.close().await.unwrap();

    let metadata: String = inspect(&path, |c| {
        c.query_row("SELECT value FROM metadata WHERE name = 'users_byName'", [], |r| r.get(0)).unwrap()
    });
    assert!(metadata.contains("\"keyPath\":\"nm\""), "metadata not updated: {}", metadata);

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_wipe_on_downgrade() {
    let path = temp_db_path("downgrade");
    let v2 = Schema::new(2, vec![StoreSchema::new("users", "id")]);
    let provider = open_file(&path, v2, false).await.unwrap();
    put_items(&provider, "users", &[user("a", "Ann")]).await;
    provider.close().await.unwrap();

    let v1 = Schema::new(1, vec![StoreSchema::new("users", "id")]);
    let err = open_file(&path, v1.clone(), false).await.unwrap_err();
    assert!(matches!(err, StorageError::VersionTooNew { stored: 2, declared: 1 }));

    let provider = open_file(&path, v1, true).await.unwrap();
    assert!(all_items(&provider, "users").await.is_empty());
    provider.close().await.unwrap();

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_last_usable_version_forces_wipe() {
    let path = temp_db_path("last_usable");
    let v1 = Schema::new(1, vec![StoreSchema::new("users", "id")]);
    let provider = open_file(&path, v1, false).await.unwrap();
    put_items(&provider, "users", &[user("a", "Ann")]).await;
    provider.close().await.unwrap();

    let v3 = Schema::new(3, vec![StoreSchema::new("users", "id")]).with_last_usable_version(2);
    let provider = open_file(&path, v3, false).await.unwrap();
    assert!(all_items(&provider, "users").await.is_empty());
    provider.close().await.unwrap();

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_version_upgrade_preserves_data() {
    let path = temp_db_path("upgrade");
    let v1 = Schema::new(1, vec![StoreSchema::new("users", "id")]);
    let provider = open_file(&path, v1, false).await.unwrap();
    put_items(&provider, "users", &[user("a", "Ann")]).await;
    provider.close().await.unwrap();

    let v2 = Schema::new(2, vec![StoreSchema::new("users", "id")]);
    let provider = open_file(&path, v2, false).await.unwrap();
    assert_eq!(ids(&all_items(&provider, "users").await), vec!["a"]);
    provider.close().await.unwrap();

    assert_eq!(inspect(&path, stored_version), "2");
    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_dropped_store_and_side_tables_are_removed() {
    let path = temp_db_path("drop_store");
    let v1 = Schema::new(
        1,
        vec![
            StoreSchema::new("users", "id"),
            StoreSchema::new("items", "id").with_index(IndexSchema::new("byTag", "tags").multi_entry()),
        ],
    );
    let provider = open_file(&path, v1, false).await.unwrap();
    put_items(&provider, "items", &[json!({"id": "1", "tags": ["x"]})]).await;
    provider.close().await.unwrap();

    let v2 = Schema::new(2, vec![StoreSchema::new("users", "id")]);
    let provider = open_file(&path, v2, false).await.unwrap();
    provider.close().await.unwrap();

    let (tables, metadata_rows) = inspect(&path, |c| {
        let tables = table_names(c);
        let mut stmt = c.prepare("SELECT name FROM metadata WHERE name != 'schemaVersion' ORDER BY name").unwrap();
        let rows: Vec<String> = stmt.query_map([], |r| r.get(0)).unwrap().collect::<Result<_, _>>().unwrap();
        (tables, rows)
    });
    assert_eq!(tables, vec!["metadata".to_string(), "users".to_string()]);
    assert!(metadata_rows.is_empty(), "stale metadata rows: {:?}", metadata_rows);

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_dropped_index_rebuilds_without_column() {
    let path = temp_db_path("drop_index");
    let v1 = Schema::new(1, vec![StoreSchema::new("users", "id").with_index(IndexSchema::new("byName", "name"))]);
    let provider = open_file(&path, v1, false).await.unwrap();
    put_items(&provider, "users", &[user("a", "Ann")]).await;
    provider.close().await.unwrap();

    let v2 = Schema::new(2, vec![StoreSchema::new("users", "id")]);
    let provider = open_file(&path, v2, false).await.unwrap();
    assert_eq!(ids(&all_items(&provider, "users").await), vec!["a"]);
    provider.close().await.unwrap();

    let sql: String =
        inspect(&path, |c| c.query_row("SELECT sql FROM sqlite_master WHERE name='users'", [], |r| r.get(0)).unwrap());
    assert!(!sql.contains("nsp_i_byName"), "index column survived: {}", sql);

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_inconsistent_metadata_at_same_version_rebuilds() {
    let path = temp_db_path("metadata_drift");
    let provider = open_file(&path, users_schema(), false).await.unwrap();
    put_items(&provider, "users", &[user("a", "Ann")]).await;
    provider.close().await.unwrap();

    // Simulate metadata loss without a version change.
    inspect(&path, |c| c.execute("DELETE FROM metadata WHERE name = 'users_byName'", []).unwrap());

    let provider = open_file(&path, users_schema(), false).await.unwrap();
    let tx = provider.open_transaction(&["users"], false).await.unwrap();
    let index = tx.store("users").unwrap().open_index("byName").unwrap();
    assert_eq!(ids(&index.get_only(&json!("Ann"), QueryPage::default()).await.unwrap()), vec!["a"]);
    tx.complete().await.unwrap();
    provider.close().await.unwrap();

    let restored: bool = inspect(&path, |c| {
        c.query_row("SELECT COUNT(*) FROM metadata WHERE name = 'users_byName'", [], |r| r.get::<_, i64>(0)).unwrap() == 1
    });
    assert!(restored);

    std::fs::remove_file(&path).ok();
}

#[tokio::test]
async fn test_full_text_side_table_survives_reopen() {
    let path = temp_db_path("fts_reopen");
    let schema = Schema::new(1, vec![StoreSchema::new("notes", "id").with_index(IndexSchema::new("byText", "t").full_text())]);
    let provider = open_file(&path, schema.clone(), false).await.unwrap();
    put_items(&provider, "notes", &[json!({"id": "1", "t": "hello world"})]).await;
    provider.close().await.unwrap();

    let provider = open_file(&path, schema, false).await.unwrap();
    let tx = provider.open_transaction(&["notes"], false).await.unwrap();
    let index = tx.store("notes").unwrap().open_index("byText").unwrap();
    let found = index.full_text_search("hello", shale_core::FullTextTermResolution::And, None).await.unwrap();
    assert_eq!(ids(&found), vec!["1"]);
    tx.complete().await.unwrap();
    provider.close().await.unwrap();

    std::fs::remove_file(&path).ok();
}
