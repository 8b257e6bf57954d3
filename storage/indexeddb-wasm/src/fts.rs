//! Range-scan full-text search: the index layer here only supports range
//! queries, so each term becomes a prefix-expansion range `[term, term⁺)`
//! over the token index (native multi-entry token property) or the sidecar's
//! key index; per-term result sets are deduplicated by primary key and then
//! merged according to the term resolution.

use std::sync::Arc;

use futures::StreamExt;
use send_wrapper::SendWrapper;
use serde_json::Value;
use shale_core::fts::{merge_term_results, prefix_successor, sanitize};
use shale_core::keypath::{serialize_key_from_item, serialize_scalar};
use shale_core::tokenize::tokenize;
use shale_core::{FullTextTermResolution, IndexSchema, StorageError, StoreSchema, MAX_LIMIT};
use wasm_bindgen::{JsCast, JsValue};
use web_sys::{IdbCursorWithValue, IdbKeyRange, IdbTransactionMode};

use crate::cb_stream::CbStream;
use crate::idb_value::{item_from_record, sidecar_name, uses_sidecar, DATA_PROPERTY, SIDE_REFPK_PROPERTY};
use crate::provider::IdbTxInner;
use crate::require::Require;
use crate::store::{await_request, request_error};

pub(crate) async fn search(
    tx: &Arc<IdbTxInner>,
    store: &StoreSchema,
    index: &IndexSchema,
    phrase: &str,
    resolution: FullTextTermResolution,
    limit: Option<u64>,
) -> Result<Vec<Value>, StorageError> {
    let terms = tokenize(&sanitize(phrase));
    if terms.is_empty() {
        return Err(StorageError::invalid_argument("search phrase tokenizes to no terms"));
    }
    let limit = limit.map(|l| l.min(MAX_LIMIT));

    let (db, store, index, caps) = (tx.db.clone(), store.clone(), index.clone(), tx.caps);
    SendWrapper::new(async move {
        let mut per_term: Vec<Vec<(String, Value)>> = Vec::with_capacity(terms.len());
        for term in &terms {
            let matches = if uses_sidecar(&index, &caps) {
                sidecar_term_matches(&db, &store, &index, term).await?
            } else {
                native_term_matches(&db, &store, &index, term).await?
            };
            per_term.push(matches);
        }
        let mut merged = merge_term_results(per_term, resolution);
        if let Some(limit) = limit {
            merged.truncate(limit as usize);
        }
        Ok(merged)
    })
    .await
}

fn prefix_range(low: &JsValue, high: Option<&JsValue>) -> Result<IdbKeyRange, StorageError> {
    Ok(match high {
        Some(high) => IdbKeyRange::bound_with_lower_open_and_upper_open(low, high, false, true).require("term range")?,
        None => IdbKeyRange::lower_bound(low).require("term range")?,
    })
}

/// One prefix range over the native token index; records dedupe by their
/// serialized primary key.
async fn native_term_matches(
    db: &crate::database::Database,
    store: &StoreSchema,
    index: &IndexSchema,
    term: &str,
) -> Result<Vec<(String, Value)>, StorageError> {
    let low = JsValue::from_str(term);
    let high = prefix_successor(term).map(|s| JsValue::from_str(&s));
    let range = prefix_range(&low, high.as_ref())?;

    let tx = db.transaction(std::slice::from_ref(&store.name), IdbTransactionMode::Readonly)?;
    let os = tx.object_store(&store.name).require("open object store")?;
    let idx = os.index(&index.name).require("open token index")?;
    let request = idx.open_cursor_with_range(range.as_ref()).require("open term cursor")?;

    let mut matches = Vec::new();
    let mut stream = CbStream::new(&request, "success", "error");
    while let Some(step) = stream.next().await {
        let cursor_result = step.map_err(|e| request_error(e, "term cursor"))?;
        if cursor_result.is_null() || cursor_result.is_undefined() {
            break;
        }
        let cursor: IdbCursorWithValue = cursor_result.dyn_into().require("cast cursor")?;
        let item = item_from_record(&cursor.value().require("cursor value")?)?;
        let pk = serialize_key_from_item(&item, &store.primary_key_path)?;
        matches.push((pk, item));
        cursor.continue_().require("advance cursor")?;
    }
    Ok(matches)
}

/// One prefix range over a sidecar's key index: rows carry serialized token
/// keys, so the range bounds are serialized too.
async fn sidecar_term_matches(
    db: &crate::database::Database,
    store: &StoreSchema,
    index: &IndexSchema,
    term: &str,
) -> Result<Vec<(String, Value)>, StorageError> {
    let low_key = serialize_scalar(&Value::String(term.to_string()))?;
    let high_key = prefix_successor(term)
        .map(|s| serialize_scalar(&Value::String(s)))
        .transpose()?;
    let low = JsValue::from_str(&low_key);
    let high = high_key.map(|s| JsValue::from_str(&s));
    let range = prefix_range(&low, high.as_ref())?;

    let table = sidecar_name(&store.name, &index.name);
    let rows = {
        let tx = db.transaction(std::slice::from_ref(&table), IdbTransactionMode::Readonly)?;
        let sc = tx.object_store(&table).require("open sidecar")?;
        let idx = sc.index("key").require("open sidecar key index")?;
        let request = idx.open_cursor_with_range(range.as_ref()).require("open term cursor")?;

        let mut rows: Vec<(JsValue, Option<String>)> = Vec::new();
        let mut stream = CbStream::new(&request, "success", "error");
        while let Some(step) = stream.next().await {
            let cursor_result = step.map_err(|e| request_error(e, "term cursor"))?;
            if cursor_result.is_null() || cursor_result.is_undefined() {
                break;
            }
            let cursor: IdbCursorWithValue = cursor_result.dyn_into().require("cast cursor")?;
            let row = cursor.value().require("cursor value")?;
            let refpk = js_sys::Reflect::get(&row, &JsValue::from_str(SIDE_REFPK_PROPERTY)).require("row refpk")?;
            let data = js_sys::Reflect::get(&row, &JsValue::from_str(DATA_PROPERTY))
                .ok()
                .and_then(|v| v.as_string());
            rows.push((refpk, data));
            cursor.continue_().require("advance cursor")?;
        }
        rows
    };

    let mut matches = Vec::new();
    if index.include_data_in_index {
        for (refpk, data) in rows {
            let data = data.ok_or_else(|| StorageError::invalid_argument("sidecar row missing payload"))?;
            let dedup = js_sys::JSON::stringify(&refpk).ok().and_then(|s| s.as_string()).unwrap_or_default();
            matches.push((dedup, serde_json::from_str(&data).map_err(StorageError::from)?));
        }
        return Ok(matches);
    }

    let tx = db.transaction(std::slice::from_ref(&store.name), IdbTransactionMode::Readonly)?;
    let os = tx.object_store(&store.name).require("open object store")?;
    for (refpk, _) in rows {
        let request = os.get(&refpk).require("get referenced item")?;
        await_request(&request, "get referenced item").await?;
        let found = request.result().require("get result")?;
        if !found.is_null() && !found.is_undefined() {
            let dedup = js_sys::JSON::stringify(&refpk).ok().and_then(|s| s.as_string()).unwrap_or_default();
            matches.push((dedup, item_from_record(&found)?));
        }
    }
    Ok(matches)
}
