//! Cursor-based store/index runtime over native object stores and sidecars.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use send_wrapper::SendWrapper;
use serde_json::Value;
use shale_core::{FullTextTermResolution, Index, IndexSchema, KeyRange, QueryPage, StorageError, Store, StoreSchema};
use wasm_bindgen::{JsCast, JsValue};
use web_sys::{IdbCursorDirection, IdbCursorWithValue, IdbKeyRange, IdbTransactionMode};

use crate::cb_future::CbFuture;
use crate::cb_stream::CbStream;
use crate::database::{sidecar_names, sidecar_row};
use crate::fts;
use crate::idb_value::{
    index_query_key, item_from_record, normalize_keys, primary_query_key, record_from_item, record_pk_js, sidecar_keys,
    sidecar_name, uses_sidecar, DATA_PROPERTY, SIDE_REFPK_PROPERTY,
};
use crate::provider::IdbTxInner;
use crate::require::{event_error_named, Require};

pub(crate) fn request_error(event: web_sys::Event, step: &'static str) -> StorageError {
    if event_error_named(&event, "ConstraintError") {
        return StorageError::Backend(anyhow::anyhow!("unique constraint violated: {}", step).into());
    }
    match Err::<(), _>(event).require(step) {
        Err(e) => e.into(),
        Ok(()) => unreachable!(),
    }
}

pub(crate) async fn await_request(request: &web_sys::IdbRequest, step: &'static str) -> Result<(), StorageError> {
    CbFuture::new(request, &["success"], "error").await.map_err(|e| request_error(e, step))
}

async fn await_complete(tx: &web_sys::IdbTransaction, step: &'static str) -> Result<(), StorageError> {
    // A failing request's error event bubbles to the transaction with the
    // request as its target, so the same classification applies.
    CbFuture::new(tx, &["complete"], "error").await.map_err(|e| request_error(e, step))
}

/// Delete every sidecar row referencing `refpk`.
async fn purge_sidecar_rows(sc: &web_sys::IdbObjectStore, refpk: &JsValue) -> Result<(), StorageError> {
    let refpk_index = sc.index("refpk").require("open refpk index")?;
    let range = IdbKeyRange::only(refpk).require("refpk range")?;
    let request = refpk_index.open_cursor_with_range(range.as_ref()).require("open refpk cursor")?;
    let mut stream = CbStream::new(&request, "success", "error");
    while let Some(step) = stream.next().await {
        let cursor_result = step.map_err(|e| request_error(e, "purge sidecar rows"))?;
        if cursor_result.is_null() || cursor_result.is_undefined() {
            break;
        }
        let cursor: IdbCursorWithValue = cursor_result.dyn_into().require("cast cursor")?;
        cursor.delete().require("delete sidecar row")?;
        cursor.continue_().require("advance cursor")?;
    }
    Ok(())
}

/// Walk a cursor request, honoring offset/limit, and collect raw values.
pub(crate) async fn cursor_collect(request: &web_sys::IdbRequest, page: QueryPage) -> Result<Vec<JsValue>, StorageError> {
    let limit = page.effective_limit();
    let offset = page.offset.unwrap_or(0).min(u32::MAX as u64) as u32;
    let mut advanced = offset == 0;
    let mut out = Vec::new();
    if limit == Some(0) {
        return Ok(out);
    }
    let mut stream = CbStream::new(request, "success", "error");
    while let Some(step) = stream.next().await {
        let cursor_result = step.map_err(|e| request_error(e, "cursor step"))?;
        if cursor_result.is_null() || cursor_result.is_undefined() {
            break;
        }
        let cursor: IdbCursorWithValue = cursor_result.dyn_into().require("cast cursor")?;
        if !advanced {
            advanced = true;
            cursor.advance(offset).require("advance past offset")?;
            continue;
        }
        out.push(cursor.value().require("cursor value")?);
        if limit.is_some_and(|l| out.len() as u64 >= l) {
            break;
        }
        cursor.continue_().require("advance cursor")?;
    }
    Ok(out)
}

pub(crate) struct IdbStore {
    tx: Arc<IdbTxInner>,
    store: StoreSchema,
}

impl IdbStore {
    pub(crate) fn new(tx: Arc<IdbTxInner>, store: StoreSchema) -> Self { Self { tx, store } }

    fn ensure_writable(&self) -> Result<(), StorageError> {
        if self.tx.write {
            Ok(())
        } else {
            Err(StorageError::invalid_argument("write operation on a read-only transaction"))
        }
    }

    /// Poison the logical transaction on driver failures; key and argument
    /// validation errors only reject the operation.
    fn settle<T>(&self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        if let Err(err) = &result {
            match err {
                StorageError::InvalidKey(_) | StorageError::InvalidArgument(_) => self.tx.observe(err),
                _ => self.tx.fail(err),
            }
        }
        result
    }
}

#[async_trait]
impl Store for IdbStore {
    async fn get(&self, key: &Value) -> Result<Option<Value>, StorageError> {
        self.tx.ensure_open()?;
        let (db, store, caps, key) = (self.tx.db.clone(), self.store.clone(), self.tx.caps, key.clone());
        let result = SendWrapper::new(async move {
            let key = primary_query_key(&key, &store, &caps)?;
            let tx = db.transaction(std::slice::from_ref(&store.name), IdbTransactionMode::Readonly)?;
            let os = tx.object_store(&store.name).require("open object store")?;
            let request = os.get(&key).require("get item")?;
            await_request(&request, "get item").await?;
            let found = request.result().require("get result")?;
            if found.is_null() || found.is_undefined() {
                Ok(None)
            } else {
                Ok(Some(item_from_record(&found)?))
            }
        })
        .await;
        self.settle(result)
    }

    async fn get_multiple(&self, keys: &Value) -> Result<Vec<Value>, StorageError> {
        self.tx.ensure_open()?;
        let keys = normalize_keys(keys, &self.store.primary_key_path);
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (db, store, caps) = (self.tx.db.clone(), self.store.clone(), self.tx.caps);
        let result = SendWrapper::new(async move {
            let tx = db.transaction(std::slice::from_ref(&store.name), IdbTransactionMode::Readonly)?;
            let os = tx.object_store(&store.name).require("open object store")?;
            let mut items = Vec::new();
            for key in &keys {
                let key = primary_query_key(key, &store, &caps)?;
                let request = os.get(&key).require("get item")?;
                await_request(&request, "get item").await?;
                let found = request.result().require("get result")?;
                if !found.is_null() && !found.is_undefined() {
                    items.push(item_from_record(&found)?);
                }
            }
            Ok(items)
        })
        .await;
        self.settle(result)
    }

    async fn put(&self, items: &[Value]) -> Result<(), StorageError> {
        self.tx.ensure_open()?;
        self.ensure_writable()?;
        if items.is_empty() {
            return Ok(());
        }
        let (db, store, caps, items) = (self.tx.db.clone(), self.store.clone(), self.tx.caps, items.to_vec());
        let result = SendWrapper::new(async move {
            let sidecars = sidecar_names(&store, &caps);
            let mut names = vec![store.name.clone()];
            names.extend(sidecars);
            let tx = db.transaction(&names, IdbTransactionMode::Readwrite)?;
            let os = tx.object_store(&store.name).require("open object store")?;
            let sidecar_indexes: Vec<&IndexSchema> =
                store.indexes.iter().filter(|i| uses_sidecar(i, &caps)).collect();

            for item in &items {
                let record = record_from_item(item, &store, &caps)?;
                let request = os.put(&record).require("put record")?;
                await_request(&request, "put record").await?;

                let pk = record_pk_js(item, &store, &caps)?;
                for index in &sidecar_indexes {
                    let sc = tx.object_store(&sidecar_name(&store.name, &index.name)).require("open sidecar")?;
                    purge_sidecar_rows(&sc, &pk).await?;
                    let data = index
                        .include_data_in_index
                        .then(|| serde_json::to_string(item))
                        .transpose()
                        .map_err(StorageError::from)?;
                    for key in sidecar_keys(item, index) {
                        let request = sc.put(&sidecar_row(&key, &pk, data.as_deref())).require("put sidecar row")?;
                        await_request(&request, "put sidecar row").await?;
                    }
                }
            }
            await_complete(&tx, "put").await
        })
        .await;
        self.settle(result)
    }

    async fn remove(&self, keys: &Value) -> Result<(), StorageError> {
        self.tx.ensure_open()?;
        self.ensure_writable()?;
        let keys = normalize_keys(keys, &self.store.primary_key_path);
        if keys.is_empty() {
            return Ok(());
        }
        let (db, store, caps) = (self.tx.db.clone(), self.store.clone(), self.tx.caps);
        let result = SendWrapper::new(async move {
            let sidecars = sidecar_names(&store, &caps);
            let mut names = vec![store.name.clone()];
            names.extend(sidecars.iter().cloned());
            let tx = db.transaction(&names, IdbTransactionMode::Readwrite)?;
            let os = tx.object_store(&store.name).require("open object store")?;
            for key in &keys {
                let pk = primary_query_key(key, &store, &caps)?;
                for sidecar in &sidecars {
                    let sc = tx.object_store(sidecar).require("open sidecar")?;
                    purge_sidecar_rows(&sc, &pk).await?;
                }
                let request = os.delete(&pk).require("delete item")?;
                await_request(&request, "delete item").await?;
            }
            await_complete(&tx, "remove").await
        })
        .await;
        self.settle(result)
    }

    async fn clear_all_data(&self) -> Result<(), StorageError> {
        self.tx.ensure_open()?;
        self.ensure_writable()?;
        let (db, store, caps) = (self.tx.db.clone(), self.store.clone(), self.tx.caps);
        let result = SendWrapper::new(async move {
            let mut names = vec![store.name.clone()];
            names.extend(sidecar_names(&store, &caps));
            let tx = db.transaction(&names, IdbTransactionMode::Readwrite)?;
            for name in &names {
                let request = tx.object_store(name).require("open object store")?.clear().require("clear store")?;
                await_request(&request, "clear store").await?;
            }
            await_complete(&tx, "clear").await
        })
        .await;
        self.settle(result)
    }

    fn open_primary_key(&self) -> Result<Arc<dyn Index>, StorageError> {
        Ok(Arc::new(IdbIndexView { tx: self.tx.clone(), store: self.store.clone(), index: None }))
    }

    fn open_index(&self, name: &str) -> Result<Arc<dyn Index>, StorageError> {
        let index = self.store.index(name).ok_or_else(|| StorageError::IndexNotFound(name.to_string()))?.clone();
        Ok(Arc::new(IdbIndexView { tx: self.tx.clone(), store: self.store.clone(), index: Some(index) }))
    }
}

enum Source {
    Primary,
    Native(String),
    Sidecar { table: String, include_data: bool },
}

pub(crate) struct IdbIndexView {
    tx: Arc<IdbTxInner>,
    store: StoreSchema,
    index: Option<IndexSchema>,
}

impl IdbIndexView {
    fn source(&self) -> Source {
        match &self.index {
            None => Source::Primary,
            Some(index) if uses_sidecar(index, &self.tx.caps) => Source::Sidecar {
                table: sidecar_name(&self.store.name, &index.name),
                include_data: index.include_data_in_index,
            },
            Some(index) => Source::Native(index.name.clone()),
        }
    }

    fn settle<T>(&self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        if let Err(err) = &result {
            match err {
                StorageError::InvalidKey(_) | StorageError::InvalidArgument(_) => self.tx.observe(err),
                _ => self.tx.fail(err),
            }
        }
        result
    }

    async fn scan(&self, range: RangeSpec, page: QueryPage) -> Result<Vec<Value>, StorageError> {
        self.tx.ensure_open()?;
        let (db, store, caps) = (self.tx.db.clone(), self.store.clone(), self.tx.caps);
        let (source, index) = (self.source(), self.index.clone());
        let result = SendWrapper::new(async move {
            let range = range.to_key_range(&store, index.as_ref(), &caps)?;
            let direction = if page.reverse { IdbCursorDirection::Prev } else { IdbCursorDirection::Next };
            let range_js: JsValue = match &range {
                Some(range) => range.clone().into(),
                None => JsValue::NULL,
            };
            match source {
                Source::Primary => {
                    let tx = db.transaction(std::slice::from_ref(&store.name), IdbTransactionMode::Readonly)?;
                    let os = tx.object_store(&store.name).require("open object store")?;
                    let request =
                        os.open_cursor_with_range_and_direction(&range_js, direction).require("open cursor")?;
                    cursor_collect(&request, page).await?.iter().map(item_from_record).collect()
                }
                Source::Native(index_name) => {
                    let tx = db.transaction(std::slice::from_ref(&store.name), IdbTransactionMode::Readonly)?;
                    let os = tx.object_store(&store.name).require("open object store")?;
                    let idx = os.index(&index_name).require("open index")?;
                    let request =
                        idx.open_cursor_with_range_and_direction(&range_js, direction).require("open cursor")?;
                    cursor_collect(&request, page).await?.iter().map(item_from_record).collect()
                }
                Source::Sidecar { table, include_data } => {
                    let rows = {
                        let tx = db.transaction(std::slice::from_ref(&table), IdbTransactionMode::Readonly)?;
                        let sc = tx.object_store(&table).require("open sidecar")?;
                        let idx = sc.index("key").require("open sidecar key index")?;
                        let request =
                            idx.open_cursor_with_range_and_direction(&range_js, direction).require("open cursor")?;
                        cursor_collect(&request, page).await?
                    };
                    if include_data {
                        let mut items = Vec::with_capacity(rows.len());
                        for row in &rows {
                            let data = js_sys::Reflect::get(row, &JsValue::from_str(DATA_PROPERTY))
                                .ok()
                                .and_then(|v| v.as_string())
                                .ok_or_else(|| StorageError::invalid_argument("sidecar row missing payload"))?;
                            items.push(serde_json::from_str(&data).map_err(StorageError::from)?);
                        }
                        Ok(items)
                    } else {
                        let tx = db.transaction(std::slice::from_ref(&store.name), IdbTransactionMode::Readonly)?;
                        let os = tx.object_store(&store.name).require("open object store")?;
                        let mut items = Vec::with_capacity(rows.len());
                        for row in &rows {
                            let refpk = js_sys::Reflect::get(row, &JsValue::from_str(SIDE_REFPK_PROPERTY))
                                .require("sidecar row refpk")?;
                            let request = os.get(&refpk).require("get referenced item")?;
                            await_request(&request, "get referenced item").await?;
                            let found = request.result().require("get result")?;
                            if !found.is_null() && !found.is_undefined() {
                                items.push(item_from_record(&found)?);
                            }
                        }
                        Ok(items)
                    }
                }
            }
        })
        .await;
        self.settle(result)
    }

    async fn count(&self, range: RangeSpec) -> Result<u64, StorageError> {
        self.tx.ensure_open()?;
        let (db, store, caps) = (self.tx.db.clone(), self.store.clone(), self.tx.caps);
        let (source, index) = (self.source(), self.index.clone());
        let result = SendWrapper::new(async move {
            let range = range.to_key_range(&store, index.as_ref(), &caps)?;
            let request = match source {
                Source::Primary => {
                    let tx = db.transaction(std::slice::from_ref(&store.name), IdbTransactionMode::Readonly)?;
                    let os = tx.object_store(&store.name).require("open object store")?;
                    match &range {
                        Some(range) => os.count_with_key(range.as_ref()).require("count")?,
                        None => os.count().require("count")?,
                    }
                }
                Source::Native(index_name) => {
                    let tx = db.transaction(std::slice::from_ref(&store.name), IdbTransactionMode::Readonly)?;
                    let os = tx.object_store(&store.name).require("open object store")?;
                    let idx = os.index(&index_name).require("open index")?;
                    match &range {
                        Some(range) => idx.count_with_key(range.as_ref()).require("count")?,
                        None => idx.count().require("count")?,
                    }
                }
                Source::Sidecar { table, .. } => {
                    let tx = db.transaction(std::slice::from_ref(&table), IdbTransactionMode::Readonly)?;
                    let sc = tx.object_store(&table).require("open sidecar")?;
                    let idx = sc.index("key").require("open sidecar key index")?;
                    match &range {
                        Some(range) => idx.count_with_key(range.as_ref()).require("count")?,
                        None => idx.count().require("count")?,
                    }
                }
            };
            await_request(&request, "count").await?;
            let count = request.result().require("count result")?.as_f64().unwrap_or(0.0);
            Ok(count as u64)
        })
        .await;
        self.settle(result)
    }
}

/// A not-yet-encoded range; encoding happens on the JS side of the wrapper.
enum RangeSpec {
    All,
    Only(Value),
    Range(KeyRange),
}

impl RangeSpec {
    fn to_key_range(
        &self,
        store: &StoreSchema,
        index: Option<&IndexSchema>,
        caps: &crate::database::IdbCapabilities,
    ) -> Result<Option<IdbKeyRange>, StorageError> {
        let encode = |key: &Value| -> Result<JsValue, StorageError> {
            match index {
                Some(index) => index_query_key(key, index, caps),
                None => primary_query_key(key, store, caps),
            }
        };
        match self {
            RangeSpec::All => Ok(None),
            RangeSpec::Only(key) => Ok(Some(IdbKeyRange::only(&encode(key)?).require("key range")?)),
            RangeSpec::Range(range) => {
                let low = range.low.as_ref().map(&encode).transpose()?;
                let high = range.high.as_ref().map(&encode).transpose()?;
                match (low, high) {
                    (None, None) => Ok(None),
                    (Some(low), None) => {
                        Ok(Some(IdbKeyRange::lower_bound_with_open(&low, range.low_exclusive).require("key range")?))
                    }
                    (None, Some(high)) => {
                        Ok(Some(IdbKeyRange::upper_bound_with_open(&high, range.high_exclusive).require("key range")?))
                    }
                    (Some(low), Some(high)) => Ok(Some(
                        IdbKeyRange::bound_with_lower_open_and_upper_open(
                            &low,
                            &high,
                            range.low_exclusive,
                            range.high_exclusive,
                        )
                        .require("key range")?,
                    )),
                }
            }
        }
    }
}

#[async_trait]
impl Index for IdbIndexView {
    async fn get_all(&self, page: QueryPage) -> Result<Vec<Value>, StorageError> {
        self.scan(RangeSpec::All, page).await
    }

    async fn get_only(&self, key: &Value, page: QueryPage) -> Result<Vec<Value>, StorageError> {
        self.scan(RangeSpec::Only(key.clone()), page).await
    }

    async fn get_range(&self, range: &KeyRange, page: QueryPage) -> Result<Vec<Value>, StorageError> {
        self.scan(RangeSpec::Range(range.clone()), page).await
    }

    async fn count_all(&self) -> Result<u64, StorageError> { self.count(RangeSpec::All).await }

    async fn count_only(&self, key: &Value) -> Result<u64, StorageError> {
        self.count(RangeSpec::Only(key.clone())).await
    }

    async fn count_range(&self, range: &KeyRange) -> Result<u64, StorageError> {
        self.count(RangeSpec::Range(range.clone())).await
    }

    async fn full_text_search(
        &self,
        phrase: &str,
        resolution: FullTextTermResolution,
        limit: Option<u64>,
    ) -> Result<Vec<Value>, StorageError> {
        self.tx.ensure_open()?;
        let index = match &self.index {
            Some(index) if index.full_text => index.clone(),
            _ => return Err(StorageError::invalid_argument("full-text search requires a full-text index")),
        };
        let result = fts::search(&self.tx, &self.store, &index, phrase, resolution, limit).await;
        self.settle(result)
    }
}
