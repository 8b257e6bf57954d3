use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A key path: a single dotted path into an item, or an ordered sequence of
/// paths forming a compound key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    Single(String),
    Compound(Vec<String>),
}

impl KeyPath {
    pub fn single(path: impl Into<String>) -> Self { KeyPath::Single(path.into()) }

    pub fn compound<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPath::Compound(paths.into_iter().map(|p| p.into()).collect())
    }

    pub fn is_compound(&self) -> bool { matches!(self, KeyPath::Compound(_)) }

    /// The ordered component paths. A single path is a one-element slice.
    pub fn components(&self) -> &[String] {
        match self {
            KeyPath::Single(p) => std::slice::from_ref(p),
            KeyPath::Compound(ps) => ps,
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self { KeyPath::Single(path.to_string()) }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self { KeyPath::compound(paths) }
}

/// Declared shape of a secondary index.
///
/// Serialization of this struct is part of the persisted format: it is stored
/// verbatim inside [`IndexMetadata`] rows and deep-compared across opens to
/// detect schema drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSchema {
    pub name: String,
    pub key_path: KeyPath,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub multi_entry: bool,
    #[serde(default)]
    pub full_text: bool,
    #[serde(default)]
    pub include_data_in_index: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<KeyPath>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
            full_text: false,
            include_data_in_index: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    pub fn full_text(mut self) -> Self {
        self.full_text = true;
        self
    }

    pub fn include_data(mut self) -> Self {
        self.include_data_in_index = true;
        self
    }
}

/// Declared shape of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSchema {
    pub name: String,
    pub primary_key_path: KeyPath,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

impl StoreSchema {
    pub fn new(name: impl Into<String>, primary_key_path: impl Into<KeyPath>) -> Self {
        Self { name: name.into(), primary_key_path: primary_key_path.into(), indexes: Vec::new() }
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> { self.indexes.iter().find(|i| i.name == name) }
}

/// The schema declared by the caller at open time. Immutable per open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub version: u32,
    #[serde(default)]
    pub last_usable_version: Option<u32>,
    pub stores: Vec<StoreSchema>,
}

impl Schema {
    pub fn new(version: u32, stores: Vec<StoreSchema>) -> Self { Self { version, last_usable_version: None, stores } }

    pub fn with_last_usable_version(mut self, version: u32) -> Self {
        self.last_usable_version = Some(version);
        self
    }

    pub fn store(&self, name: &str) -> Option<&StoreSchema> { self.stores.iter().find(|s| s.name == name) }

    /// Check the declared invariants before anything touches disk.
    pub fn validate(&self) -> Result<(), StorageError> {
        for (i, store) in self.stores.iter().enumerate() {
            if !sane_name(&store.name) {
                return Err(StorageError::invalid_argument(format!("store name {:?} is not table-safe", store.name)));
            }
            if self.stores[..i].iter().any(|s| s.name == store.name) {
                return Err(StorageError::invalid_argument(format!("duplicate store name {:?}", store.name)));
            }
            for (j, index) in store.indexes.iter().enumerate() {
                if !sane_name(&index.name) {
                    return Err(StorageError::invalid_argument(format!("index name {:?} is not table-safe", index.name)));
                }
                if store.indexes[..j].iter().any(|x| x.name == index.name) {
                    return Err(StorageError::invalid_argument(format!(
                        "duplicate index name {:?} in store {:?}",
                        index.name, store.name
                    )));
                }
                if index.multi_entry && index.key_path.is_compound() {
                    return Err(StorageError::invalid_argument(format!(
                        "index {:?} is multi-entry with a compound key path",
                        index.name
                    )));
                }
                if index.full_text && index.multi_entry {
                    return Err(StorageError::invalid_argument(format!(
                        "index {:?} cannot be both full-text and multi-entry",
                        index.name
                    )));
                }
                if index.full_text && index.key_path.is_compound() {
                    return Err(StorageError::invalid_argument(format!(
                        "full-text index {:?} requires a single key path",
                        index.name
                    )));
                }
            }
        }

        // Side tables, sidecar stores, and metadata rows are all named by the
        // `<store>_<index>` join, which is not injective: ("a_b", "c") and
        // ("a", "b_c") both derive "a_b_c". Derived names share one physical
        // namespace with the base tables and the metadata table, so every
        // name must be distinct up front.
        let mut physical = HashSet::new();
        physical.insert("metadata".to_string());
        for store in &self.stores {
            if !physical.insert(store.name.clone()) {
                return Err(StorageError::invalid_argument(format!(
                    "store name {:?} collides with a reserved table name",
                    store.name
                )));
            }
        }
        for store in &self.stores {
            for index in &store.indexes {
                let derived = IndexMetadata::key_for(&store.name, &index.name);
                if !physical.insert(derived.clone()) {
                    return Err(StorageError::invalid_argument(format!(
                        "index {:?} of store {:?} derives the name {:?}, which collides with another store or index",
                        index.name, store.name, derived
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Persisted description of an index, used to detect drift across opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    pub key: String,
    pub store_name: String,
    pub index: IndexSchema,
}

impl IndexMetadata {
    pub fn new(store_name: &str, index: &IndexSchema) -> Self {
        Self { key: Self::key_for(store_name, &index.name), store_name: store_name.to_string(), index: index.clone() }
    }

    /// Metadata rows are keyed `<storeName>_<indexName>`.
    pub fn key_for(store_name: &str, index_name: &str) -> String { format!("{}_{}", store_name, index_name) }
}

/// Names become table and column fragments, so only a conservative character
/// set is allowed.
pub fn sane_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}
