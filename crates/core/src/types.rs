//! Core identity types
//!
//! This module defines the foundational types:
//! - DocId: Collection-unique document identifier
//! - DocRef: Typed form of the raw link shapes `{_id}` and `{_id, _collection}`
//! - LockId: Holder id of a pessimistic lock
//! - Reserved field names managed by this layer

use crate::json::JsonValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity field of every raw record
pub const ID_FIELD: &str = "_id";
/// Target collection of a polymorphic link
pub const COLLECTION_FIELD: &str = "_collection";
/// Active version number of a versioned record
pub const VERSION_FIELD: &str = "_version";
/// Last modification time (milliseconds since the Unix epoch)
pub const LAST_MODIFIED_FIELD: &str = "_lastModified";
/// Back-reference from a version record to its active record
pub const ACTIVE_VERSION_FIELD: &str = "_activeVersion";
/// Lock holder id
pub const LOCKED_BY_FIELD: &str = "_lockedBy";
/// Lock acquisition time (milliseconds since the Unix epoch)
pub const LOCKED_AT_FIELD: &str = "_lockedAt";
/// Freeze flag
pub const FROZEN_FIELD: &str = "_frozen";

/// Fields owned by the concurrency controller
///
/// They are never part of change tracking and survive full overwrites.
pub const LOCK_FIELDS: [&str; 2] = [LOCKED_BY_FIELD, LOCKED_AT_FIELD];

/// Unique identifier of a document within its collection
///
/// Generated ids are UUID v4 in simple (hyphenless) form, but any string an
/// upstream record carries is accepted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    /// Create a DocId from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random DocId
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the `_id` field of a raw record
    pub fn of_record(raw: &JsonValue) -> Option<Self> {
        raw.field(ID_FIELD)
            .and_then(|v| v.as_str())
            .map(|s| Self(s.to_string()))
    }

    /// Render as a JSON string value
    pub fn to_json(&self) -> JsonValue {
        JsonValue::from(self.0.as_str())
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Holder id of a pessimistic lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(Uuid);

impl LockId {
    /// Create a new random LockId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a persisted holder id
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Persisted JSON form
    pub fn to_json(&self) -> JsonValue {
        JsonValue::from(self.0.to_string())
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reference to a document, as stored inside a link field
///
/// `collection` is only present for polymorphic links, whose target
/// collection is not fixed by the schema.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocRef {
    /// Target document id
    pub id: DocId,
    /// Target collection for polymorphic links
    pub collection: Option<String>,
}

impl DocRef {
    /// Reference with a schema-fixed target collection
    pub fn new(id: DocId) -> Self {
        Self {
            id,
            collection: None,
        }
    }

    /// Polymorphic reference naming its target collection
    pub fn with_collection(id: DocId, collection: impl Into<String>) -> Self {
        Self {
            id,
            collection: Some(collection.into()),
        }
    }

    /// Parse a raw link shape
    ///
    /// Accepts `{"_id": "..."}` and `{"_id": "...", "_collection": "..."}`;
    /// anything else (including null) is not a link.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let obj = value.as_object()?;
        let id = obj.get(ID_FIELD)?.as_str()?;
        let collection = obj
            .get(COLLECTION_FIELD)
            .and_then(|c| c.as_str())
            .map(str::to_string);
        Some(Self {
            id: DocId::new(id),
            collection,
        })
    }

    /// Render the canonical raw link shape
    pub fn to_json(&self) -> JsonValue {
        let mut obj = serde_json::Map::new();
        obj.insert(ID_FIELD.to_string(), self.id.to_json().into_inner());
        if let Some(collection) = &self.collection {
            obj.insert(
                COLLECTION_FIELD.to_string(),
                serde_json::Value::String(collection.clone()),
            );
        }
        JsonValue::from_value(serde_json::Value::Object(obj))
    }

    /// The target collection: the reference's own, else the schema's
    pub fn target<'a>(&'a self, fixed: Option<&'a str>) -> Option<&'a str> {
        self.collection.as_deref().or(fixed)
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.collection {
            Some(c) => write!(f, "{}/{}", c, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}
