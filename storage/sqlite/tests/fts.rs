mod common;

use common::*;
use serde_json::json;
use shale_core::FullTextTermResolution::{And, Or};
use shale_core::{IndexSchema, Schema, StorageError, StoreSchema, Transaction};
use shale_storage_sqlite::{SqlCapabilities, SqliteProvider};

fn notes_schema(include_data: bool) -> Schema {
    let mut index = IndexSchema::new("byText", "t").full_text();
    if include_data {
        index = index.include_data();
    }
    Schema::new(1, vec![StoreSchema::new("notes", "id").with_index(index)])
}

async fn open_notes(supports_fts3: bool, include_data: bool) -> SqliteProvider {
    let caps = SqlCapabilities { supports_fts3, ..Default::default() };
    open_memory_with(notes_schema(include_data), caps).await
}

async fn seed_notes(provider: &SqliteProvider) {
    put_items(
        provider,
        "notes",
        &[
            json!({"id": "1", "t": "foo bar"}),
            json!({"id": "2", "t": "foo baz"}),
            json!({"id": "3", "t": "the category of cats"}),
        ],
    )
    .await;
}

#[tokio::test]
async fn test_and_or_resolution() {
    for supports_fts3 in [true, false] {
        let provider = open_notes(supports_fts3, false).await;
        seed_notes(&provider).await;

        let tx = provider.open_transaction(&["notes"], false).await.unwrap();
        let index = tx.store("notes").unwrap().open_index("byText").unwrap();

        let found = index.full_text_search("foo bar", And, None).await.unwrap();
        assert_eq!(ids(&found), vec!["1"], "fts3={}", supports_fts3);

        assert!(index.full_text_search("bar baz", And, None).await.unwrap().is_empty());

        let mut found = ids(&index.full_text_search("bar baz", Or, None).await.unwrap());
        found.sort();
        assert_eq!(found, vec!["1", "2"]);
        tx.complete().await.unwrap();
    }
}

#[tokio::test]
async fn test_and_is_subset_of_or() {
    for supports_fts3 in [true, false] {
        let provider = open_notes(supports_fts3, false).await;
        seed_notes(&provider).await;

        let tx = provider.open_transaction(&["notes"], false).await.unwrap();
        let index = tx.store("notes").unwrap().open_index("byText").unwrap();
        for phrase in ["foo", "foo bar", "bar baz cat"] {
            let anded = ids(&index.full_text_search(phrase, And, None).await.unwrap());
            let ored = ids(&index.full_text_search(phrase, Or, None).await.unwrap());
            for id in &anded {
                assert!(ored.contains(id), "And result {} missing from Or for {:?}", id, phrase);
            }
        }
        tx.complete().await.unwrap();
    }
}

#[tokio::test]
async fn test_prefix_match() {
    for supports_fts3 in [true, false] {
        let provider = open_notes(supports_fts3, false).await;
        seed_notes(&provider).await;

        let tx = provider.open_transaction(&["notes"], false).await.unwrap();
        let index = tx.store("notes").unwrap().open_index("byText").unwrap();
        // "cat" prefix-matches both "category" and "cats".
        let found = index.full_text_search("cat", Or, None).await.unwrap();
        assert_eq!(ids(&found), vec!["3"], "fts3={}", supports_fts3);
        tx.complete().await.unwrap();
    }
}

#[tokio::test]
async fn test_phrase_normalization() {
    for supports_fts3 in [true, false] {
        let provider = open_notes(supports_fts3, false).await;
        put_items(&provider, "notes", &[json!({"id": "1", "t": "Crème fraîche recipes"})]).await;

        let tx = provider.open_transaction(&["notes"], false).await.unwrap();
        let index = tx.store("notes").unwrap().open_index("byText").unwrap();
        let found = index.full_text_search("CREME", And, None).await.unwrap();
        assert_eq!(ids(&found), vec!["1"]);
        // Parentheses are stripped before reaching the backend.
        let found = index.full_text_search("(creme)", And, None).await.unwrap();
        assert_eq!(ids(&found), vec!["1"]);
        tx.complete().await.unwrap();
    }
}

#[tokio::test]
async fn test_empty_phrase_rejected() {
    let provider = open_notes(true, false).await;
    let tx = provider.open_transaction(&["notes"], false).await.unwrap();
    let index = tx.store("notes").unwrap().open_index("byText").unwrap();
    assert!(matches!(index.full_text_search("", And, None).await, Err(StorageError::InvalidArgument(_))));
    assert!(matches!(index.full_text_search("...", Or, None).await, Err(StorageError::InvalidArgument(_))));
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_search_on_non_full_text_index_rejected() {
    let provider = open_memory(users_schema()).await;
    let tx = provider.open_transaction(&["users"], false).await.unwrap();
    let index = tx.store("users").unwrap().open_index("byName").unwrap();
    assert!(matches!(index.full_text_search("x", And, None).await, Err(StorageError::InvalidArgument(_))));
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_include_data_in_index() {
    let provider = open_notes(true, true).await;
    seed_notes(&provider).await;

    let tx = provider.open_transaction(&["notes"], false).await.unwrap();
    let index = tx.store("notes").unwrap().open_index("byText").unwrap();
    let found = index.full_text_search("foo bar", And, None).await.unwrap();
    assert_eq!(found, vec![json!({"id": "1", "t": "foo bar"})]);
    tx.complete().await.unwrap();
}

#[tokio::test]
async fn test_limit() {
    for supports_fts3 in [true, false] {
        let provider = open_notes(supports_fts3, false).await;
        seed_notes(&provider).await;

        let tx = provider.open_transaction(&["notes"], false).await.unwrap();
        let index = tx.store("notes").unwrap().open_index("byText").unwrap();
        let found = index.full_text_search("foo", Or, Some(1)).await.unwrap();
        assert_eq!(found.len(), 1);
        tx.complete().await.unwrap();
    }
}

#[tokio::test]
async fn test_updated_item_reindexes_tokens() {
    for supports_fts3 in [true, false] {
        let provider = open_notes(supports_fts3, false).await;
        put_items(&provider, "notes", &[json!({"id": "1", "t": "alpha beta"})]).await;
        put_items(&provider, "notes", &[json!({"id": "1", "t": "gamma"})]).await;

        let tx = provider.open_transaction(&["notes"], false).await.unwrap();
        let index = tx.store("notes").unwrap().open_index("byText").unwrap();
        assert!(index.full_text_search("alpha", Or, None).await.unwrap().is_empty());
        assert_eq!(ids(&index.full_text_search("gamma", Or, None).await.unwrap()), vec!["1"]);
        tx.complete().await.unwrap();
    }
}
