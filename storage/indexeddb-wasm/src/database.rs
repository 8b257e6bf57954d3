//! Database open, upgrade-event migration, and record rewriting.
//!
//! The declared schema version maps onto the native IndexedDB version, so
//! schema reconciliation runs inside `onupgradeneeded`: object stores absent
//! from the schema are deleted, native indexes are diffed by key path and
//! multi-entry flag, and sidecar stores are created for indexes the engine
//! cannot express. Synthetic record properties (full-text token arrays,
//! emulated primary keys) and sidecar rows are re-derived after open when the
//! upgrade touched an existing store, since the upgrade callback itself must
//! stay synchronous.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use futures::StreamExt;
use send_wrapper::SendWrapper;
use shale_core::schema::KeyPath;
use shale_core::{Schema, StorageError, StoreSchema};
use tracing::debug;
use wasm_bindgen::{prelude::*, JsCast};
use web_sys::{
    window, IdbDatabase, IdbFactory, IdbIndexParameters, IdbObjectStoreParameters, IdbOpenDbRequest,
    IdbTransactionMode, IdbVersionChangeEvent,
};

use crate::cb_future::CbFuture;
use crate::cb_stream::CbStream;
use crate::idb_value::{
    self, emulated_pk, item_from_record, record_from_item, sidecar_keys, sidecar_name, token_property, uses_sidecar,
    DATA_PROPERTY, PK_PROPERTY, SIDE_KEY_PROPERTY, SIDE_REFPK_PROPERTY,
};
use crate::require::{event_error_named, Require};

/// What the hosting engine's IndexedDB implementation can express natively.
#[derive(Debug, Clone, Copy)]
pub struct IdbCapabilities {
    /// Compound keys and multi-entry indexes. When false, primary keys are
    /// emulated through a pre-computed `nsp_pk` property and compound,
    /// multi-entry, and full-text indexes through sidecar object stores.
    pub supports_compound_keys: bool,
}

impl Default for IdbCapabilities {
    fn default() -> Self { Self { supports_compound_keys: true } }
}

#[derive(Clone)]
pub struct Database(Arc<Inner>);

struct Inner {
    db: SendWrapper<IdbDatabase>,
    name: String,
    caps: IdbCapabilities,
}

fn factory() -> Result<IdbFactory, StorageError> {
    let window = window().ok_or(StorageError::BackendUnavailable("no window object"))?;
    window
        .indexed_db()
        .map_err(|_| StorageError::BackendUnavailable("indexedDB access denied"))?
        .ok_or(StorageError::BackendUnavailable("indexedDB missing"))
}

/// Schema key paths address the item, which lives under the record's payload
/// property, so every component gets the payload prefix.
fn data_key_path_js(key_path: &KeyPath) -> JsValue {
    match key_path {
        KeyPath::Single(path) => JsValue::from_str(&format!("{}.{}", DATA_PROPERTY, path)),
        KeyPath::Compound(paths) => {
            let array = js_sys::Array::new();
            for path in paths {
                array.push(&JsValue::from_str(&format!("{}.{}", DATA_PROPERTY, path)));
            }
            array.into()
        }
    }
}

fn key_paths_equal(a: &JsValue, b: &JsValue) -> bool {
    if let (Some(a), Some(b)) = (a.as_string(), b.as_string()) {
        return a == b;
    }
    if js_sys::Array::is_array(a) && js_sys::Array::is_array(b) {
        let (a, b) = (js_sys::Array::from(a), js_sys::Array::from(b));
        return a.length() == b.length() && (0..a.length()).all(|i| a.get(i).as_string() == b.get(i).as_string());
    }
    false
}

fn string_list(list: &web_sys::DomStringList) -> Vec<String> {
    (0..list.length()).filter_map(|i| list.item(i)).collect()
}

fn required_store_names(schema: &Schema, caps: &IdbCapabilities) -> HashSet<String> {
    let mut names = HashSet::new();
    for store in &schema.stores {
        names.insert(store.name.clone());
        for index in &store.indexes {
            if uses_sidecar(index, caps) {
                names.insert(sidecar_name(&store.name, &index.name));
            }
        }
    }
    names
}

pub(crate) fn sidecar_names(store: &StoreSchema, caps: &IdbCapabilities) -> Vec<String> {
    store.indexes.iter().filter(|i| uses_sidecar(i, caps)).map(|i| sidecar_name(&store.name, &i.name)).collect()
}

impl Database {
    /// Open (creating or migrating as needed). `wipe_if_exists` destroys any
    /// persisted database first.
    pub async fn open(
        name: &str,
        schema: Arc<Schema>,
        caps: IdbCapabilities,
        wipe_if_exists: bool,
    ) -> Result<Self, StorageError> {
        if name.is_empty() {
            return Err(StorageError::invalid_argument("database name cannot be empty"));
        }
        if wipe_if_exists {
            Self::delete(name).await?;
        }
        SendWrapper::new(Self::open_inner(name, schema, caps)).await
    }

    async fn open_inner(name: &str, schema: Arc<Schema>, caps: IdbCapabilities) -> Result<Self, StorageError> {
        let open_request =
            SendWrapper::new(factory()?.open_with_u32(name, schema.version.max(1)).require("open database")?);

        let upgrade_error: Rc<RefCell<Option<StorageError>>> = Rc::new(RefCell::new(None));
        let needs_rewrite = Rc::new(Cell::new(false));

        let closure = SendWrapper::new(Closure::wrap(Box::new({
            let schema = schema.clone();
            let upgrade_error = upgrade_error.clone();
            let needs_rewrite = needs_rewrite.clone();
            move |event: IdbVersionChangeEvent| match upgrade(&event, &schema, &caps) {
                Ok(rewrite) => needs_rewrite.set(rewrite),
                Err(e) => *upgrade_error.borrow_mut() = Some(e),
            }
        }) as Box<dyn FnMut(IdbVersionChangeEvent)>));
        open_request.set_onupgradeneeded(Some(closure.as_ref().unchecked_ref()));

        if let Err(event) = CbFuture::new(&*open_request, &["success"], "error").await {
            if event_error_named(&event, "VersionError") {
                let stored = Self::stored_version(name).await.unwrap_or(0);
                return Err(StorageError::VersionTooNew { stored, declared: schema.version });
            }
            Err::<(), _>(event).require("IndexedDB open failed")?;
        }
        if let Some(err) = upgrade_error.borrow_mut().take() {
            return Err(err);
        }

        let db = open_request.result().require("get database result")?.unchecked_into::<IdbDatabase>();
        let database = Self(Arc::new(Inner { db: SendWrapper::new(db), name: name.to_string(), caps }));

        if needs_rewrite.get() {
            debug!("schema upgrade touched existing stores; rewriting derived records");
            for store in &schema.stores {
                let derived = store.indexes.iter().any(|i| i.full_text || uses_sidecar(i, &caps));
                if derived || emulated_pk(store, &caps) {
                    database.rewrite_store(store).await?;
                }
            }
        }
        Ok(database)
    }

    /// The version persisted on disk, read through a version-less open.
    async fn stored_version(name: &str) -> Result<u32, StorageError> {
        let request = SendWrapper::new(factory()?.open(name).require("open database")?);
        CbFuture::new(&*request, &["success"], "error").await.require("read stored version")?;
        let db = request.result().require("get database result")?.unchecked_into::<IdbDatabase>();
        let version = db.version() as u32;
        db.close();
        Ok(version)
    }

    pub fn name(&self) -> &str { &self.0.name }

    pub fn capabilities(&self) -> IdbCapabilities { self.0.caps }

    pub(crate) fn connection(&self) -> IdbDatabase { (*self.0.db).clone() }

    pub(crate) fn transaction(
        &self,
        store_names: &[String],
        mode: IdbTransactionMode,
    ) -> Result<web_sys::IdbTransaction, StorageError> {
        let names = js_sys::Array::new();
        for name in store_names {
            names.push(&JsValue::from_str(name));
        }
        Ok(self.connection().transaction_with_str_sequence_and_mode(&names, mode).require("open transaction")?)
    }

    pub fn close(&self) { self.0.db.close(); }

    /// Delete the database entirely.
    pub async fn delete(name: &str) -> Result<(), StorageError> {
        let fut = SendWrapper::new(async move {
            let request = SendWrapper::new(factory()?.delete_database(name).require("delete database")?);
            CbFuture::new(&*request, &["success", "blocked"], "error").await.require("await delete request")?;
            Ok(())
        });
        fut.await
    }

    /// Re-derive synthetic properties and sidecar rows for every record of a
    /// store. Runs after upgrades that changed derived state; idempotent.
    async fn rewrite_store(&self, store: &StoreSchema) -> Result<(), StorageError> {
        let sidecars = sidecar_names(store, &self.0.caps);
        let sidecar_indexes: Vec<_> = store.indexes.iter().filter(|i| uses_sidecar(i, &self.0.caps)).collect();

        // Pass one: refresh each record in place and gather sidecar rows.
        let mut rows: Vec<(String, JsValue)> = Vec::new();
        {
            let tx = self.transaction(std::slice::from_ref(&store.name), IdbTransactionMode::Readwrite)?;
            let os = tx.object_store(&store.name).require("open store")?;
            let request = os.open_cursor().require("open cursor")?;
            let mut stream = CbStream::new(&request, "success", "error");
            while let Some(result) = stream.next().await {
                let cursor_result = result.require("cursor step")?;
                if cursor_result.is_null() || cursor_result.is_undefined() {
                    break;
                }
                let cursor: web_sys::IdbCursorWithValue = cursor_result.dyn_into().require("cast cursor")?;
                let item = item_from_record(&cursor.value().require("cursor value")?)?;
                let record = record_from_item(&item, store, &self.0.caps)?;
                cursor.update(&record).require("update record")?;

                let pk = idb_value::record_pk_js(&item, store, &self.0.caps)?;
                for index in &sidecar_indexes {
                    let table = sidecar_name(&store.name, &index.name);
                    let data = index
                        .include_data_in_index
                        .then(|| serde_json::to_string(&item))
                        .transpose()
                        .map_err(StorageError::from)?;
                    for key in sidecar_keys(&item, index) {
                        rows.push((table.clone(), sidecar_row(&key, &pk, data.as_deref())));
                    }
                }
                cursor.continue_().require("advance cursor")?;
            }
            CbFuture::new(&tx, &["complete"], "error").await.require("complete rewrite transaction")?;
        }

        // Pass two: rebuild sidecars from the gathered rows.
        if !sidecars.is_empty() {
            let tx = self.transaction(&sidecars, IdbTransactionMode::Readwrite)?;
            for name in &sidecars {
                let sc = tx.object_store(name).require("open sidecar")?;
                let request = sc.clear().require("clear sidecar")?;
                CbFuture::new(&request, &["success"], "error").await.require("await sidecar clear")?;
                for (_, row) in rows.iter().filter(|(table, _)| table == name) {
                    let request = sc.put(row).require("put sidecar row")?;
                    CbFuture::new(&request, &["success"], "error").await.require("await sidecar put")?;
                }
            }
            CbFuture::new(&tx, &["complete"], "error").await.require("complete sidecar transaction")?;
        }
        Ok(())
    }
}

pub(crate) fn sidecar_row(key: &str, refpk: &JsValue, data: Option<&str>) -> JsValue {
    let row = js_sys::Object::new();
    let _ = js_sys::Reflect::set(&row, &JsValue::from_str(SIDE_KEY_PROPERTY), &JsValue::from_str(key));
    let _ = js_sys::Reflect::set(&row, &JsValue::from_str(SIDE_REFPK_PROPERTY), refpk);
    if let Some(data) = data {
        let _ = js_sys::Reflect::set(&row, &JsValue::from_str(DATA_PROPERTY), &JsValue::from_str(data));
    }
    row.into()
}

/// Reconcile the persisted layout with the declared schema inside the native
/// upgrade event. Returns whether derived record state must be rewritten.
fn upgrade(event: &IdbVersionChangeEvent, schema: &Schema, caps: &IdbCapabilities) -> Result<bool, StorageError> {
    let request: IdbOpenDbRequest = event.target().require("get event target")?.unchecked_into();
    let tx = request.transaction().require("get upgrade transaction")?;
    let db: IdbDatabase = tx.db();

    let old_version = event.old_version() as u32;
    let wipe_stores = schema.last_usable_version.is_some_and(|last| old_version > 0 && old_version < last);

    let required = required_store_names(schema, caps);
    for name in string_list(&db.object_store_names()) {
        if wipe_stores || !required.contains(&name) {
            debug!("deleting object store {}", name);
            db.delete_object_store(&name).require("delete object store")?;
        }
    }

    let mut rewrite = false;
    for store in &schema.stores {
        let fresh = !db.object_store_names().contains(&store.name);
        if fresh {
            let params = IdbObjectStoreParameters::new();
            let key_path = if emulated_pk(store, caps) {
                JsValue::from_str(PK_PROPERTY)
            } else {
                data_key_path_js(&store.primary_key_path)
            };
            params.set_key_path(&key_path);
            db.create_object_store_with_optional_parameters(&store.name, &params).require("create object store")?;
        }
        let os = tx.object_store(&store.name).require("open store during upgrade")?;

        // Native indexes: delete stale ones by deep-comparing key paths, then
        // create what is missing.
        let mut declared_names = HashSet::new();
        let native: Vec<&shale_core::IndexSchema> =
            store.indexes.iter().filter(|i| !uses_sidecar(i, caps)).collect();
        for index in &native {
            declared_names.insert(index.name.clone());
        }
        for name in string_list(&os.index_names()) {
            if !declared_names.contains(&name) {
                os.delete_index(&name).require("delete stale index")?;
            }
        }
        for index in native {
            let key_path = if index.full_text {
                JsValue::from_str(&token_property(&index.name))
            } else {
                data_key_path_js(&index.key_path)
            };
            let multi_entry = index.multi_entry || index.full_text;
            let matches = match os.index(&index.name) {
                Ok(existing) => {
                    let existing_path = existing.key_path().require("read index key path")?;
                    if key_paths_equal(&existing_path, &key_path) && existing.multi_entry() == multi_entry {
                        true
                    } else {
                        os.delete_index(&index.name).require("delete drifted index")?;
                        false
                    }
                }
                Err(_) => false,
            };
            if !matches {
                let params = IdbIndexParameters::new();
                params.set_unique(index.unique);
                params.set_multi_entry(multi_entry);
                if js_sys::Array::is_array(&key_path) {
                    os.create_index_with_str_sequence_and_optional_parameters(&index.name, &key_path, &params)
                        .require("create compound index")?;
                } else {
                    os.create_index_with_str_and_optional_parameters(
                        &index.name,
                        &key_path.as_string().unwrap_or_default(),
                        &params,
                    )
                    .require("create index")?;
                }
                // Full-text entries come from a derived token property, which
                // pre-existing records do not carry for a new key path.
                if index.full_text && !fresh {
                    rewrite = true;
                }
            }
        }

        // Sidecar stores for indexes the engine cannot express.
        for index in store.indexes.iter().filter(|i| uses_sidecar(i, caps)) {
            let name = sidecar_name(&store.name, &index.name);
            if !db.object_store_names().contains(&name) {
                let params = IdbObjectStoreParameters::new();
                let key_path = js_sys::Array::new();
                key_path.push(&JsValue::from_str(SIDE_KEY_PROPERTY));
                key_path.push(&JsValue::from_str(SIDE_REFPK_PROPERTY));
                params.set_key_path(&key_path.into());
                let sc = db.create_object_store_with_optional_parameters(&name, &params).require("create sidecar")?;
                let key_params = IdbIndexParameters::new();
                key_params.set_unique(index.unique);
                sc.create_index_with_str_and_optional_parameters("key", SIDE_KEY_PROPERTY, &key_params)
                    .require("create sidecar key index")?;
                sc.create_index_with_str("refpk", SIDE_REFPK_PROPERTY).require("create sidecar refpk index")?;
                if !fresh {
                    rewrite = true;
                }
            }
        }

        // Any upgrade over a store with derived state may have invalidated
        // it; re-deriving is cheap relative to a migration and idempotent.
        if !fresh && store.indexes.iter().any(|i| i.full_text || uses_sidecar(i, caps)) {
            rewrite = true;
        }
    }
    Ok(rewrite)
}
