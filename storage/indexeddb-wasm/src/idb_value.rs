//! Conversions between JSON items and the structured-clone records and keys
//! IndexedDB works with.
//!
//! Key constraints: booleans are not valid IndexedDB keys and encode as 0/1;
//! numbers round-trip through f64, so integers outside ±2^53 lose precision.
//! A stored record nests the item under its `nsp_data` property, with the
//! synthetic key properties (`nsp_pk`, `nsp_i_*`) beside it; the item's own
//! field namespace is never touched, so any JSON object round-trips.

use serde_json::Value;
use shale_core::keypath::{self, serialize_key, serialize_key_from_item};
use shale_core::schema::KeyPath;
use shale_core::tokenize::tokenize;
use shale_core::{IndexSchema, StorageError, StoreSchema};
use wasm_bindgen::{JsCast, JsValue};

use crate::database::IdbCapabilities;

pub const PK_PROPERTY: &str = "nsp_pk";
/// Holds the item itself on base records and the serialized item copy on
/// sidecar rows of `include_data_in_index` indexes.
pub const DATA_PROPERTY: &str = "nsp_data";
pub const SIDE_KEY_PROPERTY: &str = "nsp_key";
pub const SIDE_REFPK_PROPERTY: &str = "nsp_refpk";

pub fn token_property(index_name: &str) -> String { format!("nsp_i_{}", index_name) }

pub fn sidecar_name(store_name: &str, index_name: &str) -> String { format!("{}_{}", store_name, index_name) }

/// Whether an index needs a sidecar object store instead of a native index.
pub fn uses_sidecar(index: &IndexSchema, caps: &IdbCapabilities) -> bool {
    !caps.supports_compound_keys && (index.multi_entry || index.full_text || index.key_path.is_compound())
}

/// Whether the store's primary key is emulated through a `nsp_pk` property.
pub fn emulated_pk(store: &StoreSchema, caps: &IdbCapabilities) -> bool {
    store.primary_key_path.is_compound() && !caps.supports_compound_keys
}

pub fn json_to_js(value: &Value) -> JsValue {
    match value {
        Value::Null => JsValue::NULL,
        Value::Bool(b) => JsValue::from_bool(*b),
        Value::Number(n) => JsValue::from_f64(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => JsValue::from_str(s),
        Value::Array(items) => {
            let array = js_sys::Array::new();
            for item in items {
                array.push(&json_to_js(item));
            }
            array.into()
        }
        Value::Object(fields) => {
            let object = js_sys::Object::new();
            for (key, value) in fields {
                let _ = js_sys::Reflect::set(&object, &JsValue::from_str(key), &json_to_js(value));
            }
            object.into()
        }
    }
}

pub fn js_to_json(value: &JsValue) -> Result<Value, StorageError> {
    if value.is_null() || value.is_undefined() {
        return Ok(Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Some(n) = value.as_f64() {
        // Integral values round-trip as integers so items compare equal.
        if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0 {
            return Ok(Value::Number((n as i64).into()));
        }
        return serde_json::Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| StorageError::invalid_argument("non-finite number in record"));
    }
    if let Some(s) = value.as_string() {
        return Ok(Value::String(s));
    }
    if js_sys::Array::is_array(value) {
        let array = js_sys::Array::from(value);
        let mut items = Vec::with_capacity(array.length() as usize);
        for item in array.iter() {
            items.push(js_to_json(&item)?);
        }
        return Ok(Value::Array(items));
    }
    if value.is_object() {
        let mut fields = serde_json::Map::new();
        let keys = js_sys::Object::keys(value.unchecked_ref::<js_sys::Object>());
        for key in keys.iter() {
            let name = key.as_string().unwrap_or_default();
            let field = js_sys::Reflect::get(value, &key).unwrap_or(JsValue::UNDEFINED);
            fields.insert(name, js_to_json(&field)?);
        }
        return Ok(Value::Object(fields));
    }
    Err(StorageError::invalid_argument("record holds a value JSON cannot represent"))
}

/// Encode a JSON key value as a native IndexedDB key. Booleans become 0/1;
/// arrays (compound keys) map component-wise.
pub fn native_key(key: &Value) -> Result<JsValue, StorageError> {
    match key {
        Value::Number(n) => Ok(JsValue::from_f64(
            n.as_f64().ok_or_else(|| StorageError::invalid_key("non-finite number key"))?,
        )),
        Value::String(s) => Ok(JsValue::from_str(s)),
        Value::Bool(b) => Ok(JsValue::from_f64(if *b { 1.0 } else { 0.0 })),
        Value::Array(parts) => {
            let array = js_sys::Array::new();
            for part in parts {
                array.push(&native_key(part)?);
            }
            Ok(array.into())
        }
        other => Err(StorageError::invalid_key(format!("value {} cannot be used as a key", other))),
    }
}

/// Encode a caller-supplied primary key for lookups on a store.
pub fn primary_query_key(key: &Value, store: &StoreSchema, caps: &IdbCapabilities) -> Result<JsValue, StorageError> {
    if emulated_pk(store, caps) {
        Ok(JsValue::from_str(&serialize_key(key, &store.primary_key_path)?))
    } else {
        // Validate arity/type through the codec even when the engine takes
        // the key natively.
        serialize_key(key, &store.primary_key_path)?;
        native_key(key)
    }
}

/// Encode a caller-supplied index key for lookups on a native index or a
/// sidecar's key index.
pub fn index_query_key(
    key: &Value,
    index: &IndexSchema,
    caps: &IdbCapabilities,
) -> Result<JsValue, StorageError> {
    if uses_sidecar(index, caps) {
        Ok(JsValue::from_str(&serialize_key(key, &index.key_path)?))
    } else {
        serialize_key(key, &index.key_path)?;
        native_key(key)
    }
}

/// The primary key of an item as the engine stores it: the serialized string
/// when the key is emulated, the native key value otherwise.
pub fn record_pk_js(item: &Value, store: &StoreSchema, caps: &IdbCapabilities) -> Result<JsValue, StorageError> {
    if emulated_pk(store, caps) {
        return Ok(JsValue::from_str(&serialize_key_from_item(item, &store.primary_key_path)?));
    }
    let components = store.primary_key_path.components();
    let extract_component = |path: &String| {
        keypath::extract(item, path)
            .ok_or_else(|| StorageError::invalid_key(format!("item has no value at key path {:?}", path)))
    };
    if components.len() == 1 {
        native_key(extract_component(&components[0])?)
    } else {
        let array = js_sys::Array::new();
        for path in components {
            array.push(&native_key(extract_component(path)?)?);
        }
        Ok(array.into())
    }
}

/// Normalize a single-key or key-array argument into individual key values.
pub fn normalize_keys(keys: &Value, key_path: &KeyPath) -> Vec<Value> {
    match (key_path, keys) {
        (KeyPath::Single(_), Value::Array(many)) => many.clone(),
        (KeyPath::Single(_), one) => vec![one.clone()],
        (KeyPath::Compound(_), Value::Array(elems)) if elems.iter().all(|e| e.is_array()) => elems.clone(),
        (KeyPath::Compound(_), one) => vec![one.clone()],
    }
}

/// Sidecar keys an item contributes to an emulated index: the serialized
/// compound key, one serialized element per multi-entry value, or one
/// serialized token per full-text term.
pub fn sidecar_keys(item: &Value, index: &IndexSchema) -> Vec<String> {
    if index.full_text {
        let path = &index.key_path.components()[0];
        let Some(text) = keypath::extract(item, path).and_then(|v| v.as_str()) else {
            return Vec::new();
        };
        return tokenize(text).iter().filter_map(|t| keypath::serialize_scalar(&Value::String(t.clone())).ok()).collect();
    }
    if index.multi_entry {
        let path = &index.key_path.components()[0];
        return match keypath::extract(item, path) {
            Some(Value::Array(values)) => {
                let mut seen = std::collections::HashSet::new();
                values
                    .iter()
                    .filter_map(|v| keypath::serialize_scalar(v).ok())
                    .filter(|k| seen.insert(k.clone()))
                    .collect()
            }
            Some(value) => keypath::serialize_scalar(value).ok().into_iter().collect(),
            None => Vec::new(),
        };
    }
    keypath::index_key_from_item(item, &index.key_path).into_iter().collect()
}

/// Build the structured-clone record for an item: the item nested under the
/// payload property, plus the synthetic properties the configured
/// capabilities require beside it.
pub fn record_from_item(item: &Value, store: &StoreSchema, caps: &IdbCapabilities) -> Result<JsValue, StorageError> {
    if !item.is_object() {
        return Err(StorageError::invalid_argument("items must be JSON objects"));
    }
    let record: JsValue = js_sys::Object::new().into();
    js_sys::Reflect::set(&record, &JsValue::from_str(DATA_PROPERTY), &json_to_js(item))
        .map_err(|_| StorageError::invalid_argument("failed to set payload property"))?;
    if emulated_pk(store, caps) {
        let pk = serialize_key_from_item(item, &store.primary_key_path)?;
        js_sys::Reflect::set(&record, &JsValue::from_str(PK_PROPERTY), &JsValue::from_str(&pk))
            .map_err(|_| StorageError::invalid_argument("failed to set primary key property"))?;
    } else {
        // Surfaces InvalidKey before the engine sees the record.
        serialize_key_from_item(item, &store.primary_key_path)?;
    }
    for index in &store.indexes {
        if index.full_text && !uses_sidecar(index, caps) {
            let path = &index.key_path.components()[0];
            let tokens = js_sys::Array::new();
            if let Some(text) = keypath::extract(item, path).and_then(|v| v.as_str()) {
                for term in tokenize(text) {
                    tokens.push(&JsValue::from_str(&term));
                }
            }
            js_sys::Reflect::set(&record, &JsValue::from_str(&token_property(&index.name)), &tokens)
                .map_err(|_| StorageError::invalid_argument("failed to set token property"))?;
        }
    }
    Ok(record)
}

/// Recover the item from a stored record's payload property.
pub fn item_from_record(record: &JsValue) -> Result<Value, StorageError> {
    let data = js_sys::Reflect::get(record, &JsValue::from_str(DATA_PROPERTY))
        .map_err(|_| StorageError::invalid_argument("record has no payload property"))?;
    if data.is_null() || data.is_undefined() {
        return Err(StorageError::invalid_argument("record has no payload property"));
    }
    js_to_json(&data)
}
