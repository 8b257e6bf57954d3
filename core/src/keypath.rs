//! Key-path extraction and total-order-preserving key serialization.
//!
//! Every key a backend persists (primary or index) goes through this codec,
//! so lexicographic ordering of the serialized strings must match the
//! component-wise ordering of the original values. Numbers use the
//! order-preserving bit transform of the underlying f64 (sign bit flipped for
//! non-negative values, all bits inverted for negative ones) rendered as
//! fixed-width hex; strings are passed through. A type-tag prefix keeps
//! numbers ordered before strings. The serialization is stable: changing it
//! invalidates every persisted database.

use serde_json::Value;

use crate::error::StorageError;
use crate::schema::KeyPath;

/// Joins compound key components. Sorts below every serialized component
/// byte, so component-wise ordering carries over to the joined string.
pub const COMPOUND_KEY_SEPARATOR: char = '\u{0001}';

const TAG_NUMBER: char = '0';
const TAG_STRING: char = '1';

/// Walk a dotted path through nested JSON objects. `None` when any
/// intermediate segment is missing or not an object.
pub fn extract<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = item;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn orderable_bits(f: f64) -> u64 {
    // Canonicalize -0.0 so both zeros serialize identically.
    let f = if f == 0.0 { 0.0 } else { f };
    let bits = f.to_bits();
    if f >= 0.0 {
        bits ^ (1 << 63)
    } else {
        !bits
    }
}

/// Serialize one key component: a string, a number (dates are numbers), or a
/// boolean (encoded as 0/1).
pub fn serialize_scalar(value: &Value) -> Result<String, StorageError> {
    match value {
        Value::String(s) => Ok(format!("{}{}", TAG_STRING, s)),
        Value::Number(n) => {
            let f = n.as_f64().ok_or_else(|| StorageError::invalid_key(format!("non-finite number {}", n)))?;
            if f.is_nan() {
                return Err(StorageError::invalid_key("NaN is not a valid key"));
            }
            Ok(format!("{}{:016x}", TAG_NUMBER, orderable_bits(f)))
        }
        Value::Bool(b) => Ok(format!("{}{:016x}", TAG_NUMBER, orderable_bits(if *b { 1.0 } else { 0.0 }))),
        other => Err(StorageError::invalid_key(format!("value {} cannot be used as a key", other))),
    }
}

/// Serialize a caller-supplied key value against a key path. Compound paths
/// expect an array with one element per component.
pub fn serialize_key(key: &Value, key_path: &KeyPath) -> Result<String, StorageError> {
    match key_path {
        KeyPath::Single(_) => serialize_scalar(key),
        KeyPath::Compound(paths) => {
            let parts = key
                .as_array()
                .ok_or_else(|| StorageError::invalid_key(format!("compound key path expects an array, got {}", key)))?;
            if parts.len() != paths.len() {
                return Err(StorageError::invalid_key(format!(
                    "compound key has {} components, key path has {}",
                    parts.len(),
                    paths.len()
                )));
            }
            serialize_components(parts.iter())
        }
    }
}

fn serialize_components<'a>(parts: impl Iterator<Item = &'a Value>) -> Result<String, StorageError> {
    let mut out = String::new();
    for (i, part) in parts.enumerate() {
        if i > 0 {
            out.push(COMPOUND_KEY_SEPARATOR);
        }
        out.push_str(&serialize_scalar(part)?);
    }
    Ok(out)
}

/// Serialize an item's key at a key path, failing with `InvalidKey` when any
/// component is missing. Used for primary keys, which every item must carry.
pub fn serialize_key_from_item(item: &Value, key_path: &KeyPath) -> Result<String, StorageError> {
    let mut parts = Vec::with_capacity(key_path.components().len());
    for path in key_path.components() {
        let value =
            extract(item, path).ok_or_else(|| StorageError::invalid_key(format!("item has no value at key path {:?}", path)))?;
        parts.push(value);
    }
    serialize_components(parts.into_iter())
}

/// Like [`serialize_key_from_item`], but items missing a component (or
/// carrying an unserializable value there) are simply absent from the index.
pub fn index_key_from_item(item: &Value, key_path: &KeyPath) -> Option<String> {
    let mut parts = Vec::with_capacity(key_path.components().len());
    for path in key_path.components() {
        parts.push(extract(item, path)?);
    }
    serialize_components(parts.into_iter()).ok()
}

/// Normalize a single-key or key-array argument into serialized strings.
///
/// For a single key path, an array argument is a list of keys. For a compound
/// key path, an array of arrays is a list of keys and a flat array is one
/// compound key.
pub fn list_of_keys(keys: &Value, key_path: &KeyPath) -> Result<Vec<String>, StorageError> {
    match (key_path, keys) {
        (KeyPath::Single(_), Value::Array(many)) => many.iter().map(serialize_scalar).collect(),
        (KeyPath::Single(_), one) => Ok(vec![serialize_scalar(one)?]),
        (KeyPath::Compound(_), Value::Array(elems)) if elems.iter().all(|e| e.is_array()) => {
            elems.iter().map(|k| serialize_key(k, key_path)).collect()
        }
        (KeyPath::Compound(_), one) => Ok(vec![serialize_key(one, key_path)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_nested() {
        let item = json!({"a": {"b": {"c": 3}}});
        assert_eq!(extract(&item, "a.b.c"), Some(&json!(3)));
        assert_eq!(extract(&item, "a.b"), Some(&json!({"c": 3})));
        assert_eq!(extract(&item, "a.x.c"), None);
        assert_eq!(extract(&item, "a.b.c.d"), None);
    }

    #[test]
    fn test_number_ordering_preserved() {
        let values = [-1e9, -2.5, -1.0, 0.0, 0.5, 1.0, 42.0, 1e12];
        let serialized: Vec<String> = values.iter().map(|f| serialize_scalar(&json!(f)).unwrap()).collect();
        let mut sorted = serialized.clone();
        sorted.sort();
        assert_eq!(serialized, sorted);
    }

    #[test]
    fn test_negative_zero_canonical() {
        assert_eq!(serialize_scalar(&json!(-0.0)).unwrap(), serialize_scalar(&json!(0.0)).unwrap());
    }

    #[test]
    fn test_numbers_sort_before_strings() {
        let num = serialize_scalar(&json!(1e300)).unwrap();
        let text = serialize_scalar(&json!("")).unwrap();
        assert!(num < text);
    }

    #[test]
    fn test_compound_ordering() {
        let path = KeyPath::compound(["a", "b"]);
        let k12 = serialize_key(&json!([1, 2]), &path).unwrap();
        let k13 = serialize_key(&json!([1, 3]), &path).unwrap();
        let k21 = serialize_key(&json!([2, 1]), &path).unwrap();
        assert!(k12 < k13);
        assert!(k13 < k21);
    }

    #[test]
    fn test_item_and_key_serialization_agree() {
        let path = KeyPath::compound(["a", "b"]);
        let item = json!({"a": 1, "b": 2, "v": "ab"});
        assert_eq!(serialize_key_from_item(&item, &path).unwrap(), serialize_key(&json!([1, 2]), &path).unwrap());
    }

    #[test]
    fn test_missing_primary_key_is_invalid() {
        let item = json!({"a": 1});
        assert!(matches!(serialize_key_from_item(&item, &"id".into()), Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn test_index_key_missing_is_none() {
        let item = json!({"a": 1});
        assert_eq!(index_key_from_item(&item, &"name".into()), None);
        assert!(index_key_from_item(&item, &"a".into()).is_some());
    }

    #[test]
    fn test_list_of_keys_forms() {
        let single: KeyPath = "id".into();
        assert_eq!(list_of_keys(&json!("a"), &single).unwrap().len(), 1);
        assert_eq!(list_of_keys(&json!(["a", "b"]), &single).unwrap().len(), 2);

        let compound = KeyPath::compound(["a", "b"]);
        assert_eq!(list_of_keys(&json!([1, 2]), &compound).unwrap().len(), 1);
        assert_eq!(list_of_keys(&json!([[1, 2], [3, 4]]), &compound).unwrap().len(), 2);
    }

    #[test]
    fn test_object_key_rejected() {
        assert!(matches!(serialize_scalar(&json!({"no": 1})), Err(StorageError::InvalidKey(_))));
        assert!(matches!(serialize_scalar(&Value::Null), Err(StorageError::InvalidKey(_))));
    }
}
