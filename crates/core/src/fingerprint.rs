//! Fingerprints: partial-record query descriptors
//!
//! A fingerprint is built from a partial record such as
//! `{"email": "jack@example.com"}` or `{"author": {"_id": "a1"}}`. Nested
//! objects are flattened into dot-path keys (`author._id`), which is the form
//! storage drivers filter on.
//!
//! A fingerprint is *unique* when its filled-in keys cover every field of at
//! least one declared unique index (`_id` is always one). Only unique
//! fingerprints can be used for single-record lookups. The flag is computed
//! lazily, at most once.

use crate::index::IndexSpec;
use crate::json::JsonValue;
use crate::types::ID_FIELD;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;

/// Immutable partial-record query descriptor
#[derive(Debug, Clone)]
pub struct Fingerprint {
    fields: BTreeMap<String, JsonValue>,
    unique_indexes: Vec<Vec<String>>,
    unique: OnceCell<bool>,
}

impl Fingerprint {
    /// Build a fingerprint from a partial record
    ///
    /// Only the unique indexes among `indexes` are kept.
    pub fn new(partial: &JsonValue, indexes: &[IndexSpec]) -> Self {
        let mut fields = BTreeMap::new();
        flatten_into(partial.as_inner(), String::new(), &mut fields);
        Self {
            fields,
            unique_indexes: indexes
                .iter()
                .filter(|idx| idx.unique)
                .map(|idx| idx.fields.clone())
                .collect(),
            unique: OnceCell::new(),
        }
    }

    /// Whether the fingerprint identifies at most one record
    pub fn is_unique(&self) -> bool {
        *self.unique.get_or_init(|| {
            self.fields.contains_key(ID_FIELD)
                || self
                    .unique_indexes
                    .iter()
                    .any(|fields| fields.iter().all(|f| self.fields.contains_key(f)))
        })
    }

    /// Flattened dot-path fields
    pub fn fields(&self) -> &BTreeMap<String, JsonValue> {
        &self.fields
    }

    /// Value of one dot-path field
    pub fn get(&self, dot_path: &str) -> Option<&JsonValue> {
        self.fields.get(dot_path)
    }

    /// Whether the fingerprint has no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Flat equality query, `{"dot.path": value, ...}`
    pub fn to_query(&self) -> JsonValue {
        let obj: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.as_inner().clone()))
            .collect();
        JsonValue::from_value(serde_json::Value::Object(obj))
    }
}

fn flatten_into(
    value: &serde_json::Value,
    prefix: String,
    out: &mut BTreeMap<String, JsonValue>,
) {
    match value {
        serde_json::Value::Object(obj) if !obj.is_empty() => {
            for (key, child) in obj {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(child, path, out);
            }
        }
        _ if prefix.is_empty() => {}
        other => {
            out.insert(prefix, JsonValue::from_value(other.clone()));
        }
    }
}
