mod common;

use common::*;
use serde_json::json;
use shale_core::{QueryPage, Schema, StorageError, StoreSchema, Transaction};
use shale_storage_sqlite::SqlCapabilities;

#[tokio::test]
async fn test_round_trip() {
    let provider = open_memory(users_schema()).await;
    put_items(&provider, "users", &[user("a", "Ann")]).await;

    let tx = provider.open_transaction(&["users"], false).await.unwrap();
    let store = tx.store("users").unwrap();
    assert_eq!(store.get(&json!("a")).await.unwrap(), Some(user("a", "Ann")));
    assert_eq!(store.get(&json!("missing")).await.unwrap(), None);
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_get_only_through_index() {
    let provider = open_memory(users_schema()).await;
    put_items(&provider, "users", &[user("a", "Ann"), user("b", "Bob")]).await;

    let tx = provider.open_transaction(&["users"], false).await.unwrap();
    let index = tx.store("users").unwrap().open_index("byName").unwrap();
    let found = index.get_only(&json!("Ann"), QueryPage::default()).await.unwrap();
    assert_eq!(found, vec![user("a", "Ann")]);
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_get_multiple_preserves_order_and_omits_missing() {
    let provider = open_memory(users_schema()).await;
    put_items(&provider, "users", &[user("a", "Ann"), user("b", "Bob"), user("c", "Cyd")]).await;

    let tx = provider.open_transaction(&["users"], false).await.unwrap();
    let store = tx.store("users").unwrap();
    let found = store.get_multiple(&json!(["c", "missing", "a"])).await.unwrap();
    assert_eq!(ids(&found), vec!["c", "a"]);
    // Empty input never reaches the driver.
    assert!(store.get_multiple(&json!([])).await.unwrap().is_empty());
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_idempotent_put() {
    let provider = open_memory(users_schema()).await;
    put_items(&provider, "users", &[user("a", "Ann")]).await;
    put_items(&provider, "users", &[user("a", "Ann")]).await;

    let tx = provider.open_transaction(&["users"], false).await.unwrap();
    let store = tx.store("users").unwrap();
    assert_eq!(store.open_primary_key().unwrap().count_all().await.unwrap(), 1);
    assert_eq!(store.open_index("byName").unwrap().count_only(&json!("Ann")).await.unwrap(), 1);
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_put_replaces_and_reindexes() {
    let provider = open_memory(users_schema()).await;
    put_items(&provider, "users", &[user("a", "Ann")]).await;
    put_items(&provider, "users", &[user("a", "Anne")]).await;

    let tx = provider.open_transaction(&["users"], false).await.unwrap();
    let index = tx.store("users").unwrap().open_index("byName").unwrap();
    assert!(index.get_only(&json!("Ann"), QueryPage::default()).await.unwrap().is_empty());
    assert_eq!(index.get_only(&json!("Anne"), QueryPage::default()).await.unwrap(), vec![user("a", "Anne")]);
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_remove_and_clear() {
    let provider = open_memory(users_schema()).await;
    put_items(&provider, "users", &[user("a", "Ann"), user("b", "Bob")]).await;

    let tx = provider.open_transaction(&["users"], true).await.unwrap();
    let store = tx.store("users").unwrap();
    store.remove(&json!("a")).await.unwrap();
    assert_eq!(store.get(&json!("a")).await.unwrap(), None);
    assert_eq!(store.get(&json!("b")).await.unwrap(), Some(user("b", "Bob")));
    store.clear_all_data().await.unwrap();
    assert_eq!(store.open_primary_key().unwrap().count_all().await.unwrap(), 0);
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_compound_primary_key() {
    let schema = Schema::new(1, vec![StoreSchema::new("pairs", vec!["a", "b"])]);
    let provider = open_memory(schema).await;
    put_items(&provider, "pairs", &[json!({"a": 1, "b": 2, "v": "ab"})]).await;

    let tx = provider.open_transaction(&["pairs"], false).await.unwrap();
    let store = tx.store("pairs").unwrap();
    assert_eq!(store.get(&json!([1, 2])).await.unwrap(), Some(json!({"a": 1, "b": 2, "v": "ab"})));
    assert_eq!(store.get(&json!([2, 1])).await.unwrap(), None);
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_invalid_key_rejected() {
    let provider = open_memory(users_schema()).await;
    let tx = provider.open_transaction(&["users"], false).await.unwrap();
    let store = tx.store("users").unwrap();
    assert!(matches!(store.get(&json!({"bad": true})).await, Err(StorageError::InvalidKey(_))));
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_missing_primary_key_rejects_put() {
    let provider = open_memory(users_schema()).await;
    let tx = provider.open_transaction(&["users"], true).await.unwrap();
    let store = tx.store("users").unwrap();
    assert!(matches!(store.put(&[json!({"name": "NoId"})]).await, Err(StorageError::InvalidKey(_))));
    tx.abort().await.unwrap();
}

#[tokio::test]
async fn test_batched_put_matches_single_puts() {
    // 3 columns per row and max_variables=7 forces 2-row batches.
    let caps = SqlCapabilities { max_variables: 7, ..Default::default() };
    let provider = open_memory_with(users_schema(), caps).await;

    let items: Vec<_> = (0..25).map(|i| user(&format!("id{:02}", i), &format!("name{:02}", i))).collect();
    put_items(&provider, "users", &items).await;

    let all = all_items(&provider, "users").await;
    assert_eq!(all.len(), 25);
    assert_eq!(ids(&all), (0..25).map(|i| format!("id{:02}", i)).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_unicode_replacement_strips_separators() {
    let caps = SqlCapabilities { requires_unicode_replacement: true, ..Default::default() };
    let provider = open_memory_with(users_schema(), caps).await;
    put_items(&provider, "users", &[json!({"id": "a", "name": format!("An{}n", '\u{2028}')})]).await;

    let tx = provider.open_transaction(&["users"], false).await.unwrap();
    let found = tx.store("users").unwrap().get(&json!("a")).await.unwrap().unwrap();
    assert_eq!(found["name"], json!("Ann"));
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_numeric_key_ordering() {
    let schema = Schema::new(1, vec![StoreSchema::new("points", "n")]);
    let provider = open_memory(schema).await;
    let values = [-10.0, -1.5, 0.0, 2.0, 10.0, 100.0];
    let items: Vec<_> = values.iter().map(|n| json!({"n": n})).collect();
    put_items(&provider, "points", &items).await;

    let all = all_items(&provider, "points").await;
    let ordered: Vec<f64> = all.iter().map(|i| i["n"].as_f64().unwrap()).collect();
    assert_eq!(ordered, values);
}
