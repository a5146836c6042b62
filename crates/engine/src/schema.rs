//! Collection schemas and the validator contract
//!
//! A [`Schema`] describes the fields of a collection's records. Besides the
//! plain JSON kinds it declares the three reference kinds the population
//! engine understands:
//!
//! | Kind | Raw shape | Meaning |
//! |------|-----------|---------|
//! | `Link` | `{"_id": ..}` or `{"_id": .., "_collection": ..}` | one foreign record; polymorphic when no collection is fixed |
//! | `MultiLink` | array of link shapes | ordered, deduplicated foreign records |
//! | `BackLink` | not stored | every record of `collection` whose `path` links back here |
//!
//! Validation goes through the [`Validator`] trait so a different rule engine
//! can be plugged in per collection. [`SchemaValidator`] is the built-in one.

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use trellis_core::{
    JsonPath, JsonValue, PathSegment, ACTIVE_VERSION_FIELD, COLLECTION_FIELD, FROZEN_FIELD,
    ID_FIELD, LAST_MODIFIED_FIELD, LOCKED_AT_FIELD, LOCKED_BY_FIELD, VERSION_FIELD,
};

/// Top-level fields managed by this layer; always accepted by validation
pub const RESERVED_FIELDS: [&str; 7] = [
    ID_FIELD,
    VERSION_FIELD,
    LAST_MODIFIED_FIELD,
    ACTIVE_VERSION_FIELD,
    LOCKED_BY_FIELD,
    LOCKED_AT_FIELD,
    FROZEN_FIELD,
];

/// Whether a top-level field name is reserved
pub fn is_reserved(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}

/// Type of one schema field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Any JSON value
    Any,
    /// String
    String,
    /// Any number
    Number,
    /// Integral number
    Integer,
    /// Boolean
    Boolean,
    /// Nested object with its own schema
    Object(Schema),
    /// Array of one element kind
    Array(Box<FieldKind>),
    /// Single foreign reference
    Link {
        /// Fixed target collection; `None` for polymorphic links
        collection: Option<String>,
    },
    /// Ordered foreign references
    MultiLink {
        /// Fixed target collection; `None` for polymorphic links
        collection: Option<String>,
    },
    /// Derived inverse reference
    BackLink {
        /// Collection holding the forward links
        collection: String,
        /// Dot path of the forward link field in that collection
        path: String,
    },
}

/// One field declaration
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Field type
    pub kind: FieldKind,
    /// Value applied when the field is absent or null
    pub default: Option<JsonValue>,
    /// Whether the field may be absent or null
    pub optional: bool,
}

impl FieldSpec {
    /// Required field of the given kind
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            default: None,
            optional: false,
        }
    }

    /// Allow the field to be absent or null
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Default value for an absent or null field
    pub fn with_default(mut self, value: impl Into<JsonValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Any JSON value
    pub fn any() -> Self {
        Self::new(FieldKind::Any)
    }

    /// String field
    pub fn string() -> Self {
        Self::new(FieldKind::String)
    }

    /// Number field
    pub fn number() -> Self {
        Self::new(FieldKind::Number)
    }

    /// Integer field
    pub fn integer() -> Self {
        Self::new(FieldKind::Integer)
    }

    /// Boolean field
    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    /// Nested object field
    pub fn object(schema: Schema) -> Self {
        Self::new(FieldKind::Object(schema))
    }

    /// Array field
    pub fn array(element: FieldKind) -> Self {
        Self::new(FieldKind::Array(Box::new(element)))
    }

    /// Link into a fixed collection
    pub fn link(collection: impl Into<String>) -> Self {
        Self::new(FieldKind::Link {
            collection: Some(collection.into()),
        })
    }

    /// Polymorphic link; each reference names its collection
    pub fn dynamic_link() -> Self {
        Self::new(FieldKind::Link { collection: None })
    }

    /// Multi-link into a fixed collection
    pub fn multi_link(collection: impl Into<String>) -> Self {
        Self::new(FieldKind::MultiLink {
            collection: Some(collection.into()),
        })
    }

    /// Polymorphic multi-link
    pub fn dynamic_multi_link() -> Self {
        Self::new(FieldKind::MultiLink { collection: None })
    }

    /// Back-link: records of `collection` whose `path` links here
    pub fn back_link(collection: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(FieldKind::BackLink {
            collection: collection.into(),
            path: path.into(),
        })
    }
}

/// Field declarations of a record or nested object
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    /// Declared fields
    pub fields: BTreeMap<String, FieldSpec>,
    /// Whether undeclared fields are accepted
    pub extra_properties: bool,
}

/// Reference kind resolved for a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkDescriptor {
    /// Single reference (also each element of a multi-link)
    Link {
        /// Fixed target collection
        collection: Option<String>,
    },
    /// Ordered references
    MultiLink {
        /// Fixed target collection
        collection: Option<String>,
    },
    /// Derived inverse reference
    BackLink {
        /// Collection holding the forward links
        collection: String,
        /// Dot path of the forward link field
        path: String,
    },
}

impl LinkDescriptor {
    /// Human-readable kind name
    pub fn kind_name(&self) -> &'static str {
        match self {
            LinkDescriptor::Link { .. } => "link",
            LinkDescriptor::MultiLink { .. } => "multi-link",
            LinkDescriptor::BackLink { .. } => "back-link",
        }
    }
}

impl Schema {
    /// Empty schema rejecting undeclared fields
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema accepting any record
    pub fn any() -> Self {
        Self {
            fields: BTreeMap::new(),
            extra_properties: true,
        }
    }

    /// Declare a field
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Accept or reject undeclared fields
    pub fn extra_properties(mut self, allowed: bool) -> Self {
        self.extra_properties = allowed;
        self
    }

    /// Kind declared at a path
    ///
    /// Array indices and wildcards step into array element kinds.
    pub fn kind_at(&self, path: &JsonPath) -> Option<&FieldKind> {
        let (first, rest) = path.segments().split_first()?;
        let PathSegment::Key(name) = first else {
            return None;
        };
        let mut kind = &self.fields.get(name)?.kind;
        for segment in rest {
            kind = match (kind, segment) {
                (FieldKind::Object(schema), PathSegment::Key(k)) => &schema.fields.get(k)?.kind,
                (FieldKind::Array(element), PathSegment::Index(_) | PathSegment::Wildcard) => {
                    element.as_ref()
                }
                _ => return None,
            };
        }
        Some(kind)
    }

    /// Reference kind of a path, if it names a link field
    ///
    /// One index or wildcard after a multi-link field names its elements,
    /// which resolve as single links.
    pub fn link_descriptor(&self, path: &JsonPath) -> Option<LinkDescriptor> {
        if let (Some(parent), Some(PathSegment::Index(_) | PathSegment::Wildcard)) =
            (path.parent(), path.last_segment())
        {
            if let Some(FieldKind::MultiLink { collection }) = self.kind_at(&parent) {
                return Some(LinkDescriptor::Link {
                    collection: collection.clone(),
                });
            }
        }
        match self.kind_at(path)? {
            FieldKind::Link { collection } => Some(LinkDescriptor::Link {
                collection: collection.clone(),
            }),
            FieldKind::MultiLink { collection } => Some(LinkDescriptor::MultiLink {
                collection: collection.clone(),
            }),
            FieldKind::BackLink { collection, path } => Some(LinkDescriptor::BackLink {
                collection: collection.clone(),
                path: path.clone(),
            }),
            _ => None,
        }
    }

    /// Every fixed collection a link field of this schema points at
    pub fn linked_collections(&self) -> Vec<String> {
        fn walk(kind: &FieldKind, out: &mut Vec<String>) {
            match kind {
                FieldKind::Link {
                    collection: Some(c),
                }
                | FieldKind::MultiLink {
                    collection: Some(c),
                }
                | FieldKind::BackLink { collection: c, .. } => out.push(c.clone()),
                FieldKind::Object(schema) => {
                    for spec in schema.fields.values() {
                        walk(&spec.kind, out);
                    }
                }
                FieldKind::Array(element) => walk(element, out),
                _ => {}
            }
        }
        let mut out = Vec::new();
        for spec in self.fields.values() {
            walk(&spec.kind, &mut out);
        }
        out.sort();
        out.dedup();
        out
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Record validation contract
///
/// `validate` returns the sanitized record (defaults applied, link shapes
/// canonicalized) or the reason it was rejected.
pub trait Validator: Send + Sync {
    /// Validate and sanitize a whole record
    fn validate(&self, schema: &Schema, raw: &JsonValue) -> std::result::Result<JsonValue, String>;

    /// Kind declared at a path
    fn sub_schema<'a>(&self, schema: &'a Schema, path: &JsonPath) -> Option<&'a FieldKind> {
        schema.kind_at(path)
    }
}

/// Built-in validator driven by [`Schema`]
///
/// - applies defaults to absent or null fields
/// - type-checks every declared field, recursively
/// - canonicalizes links to `{_id}` (`{_id, _collection}` when polymorphic);
///   a bare string id is accepted for fixed-collection links
/// - deduplicates multi-links by reference, keeping the first occurrence
/// - drops back-link fields, which are never stored
/// - rejects undeclared fields unless `extra_properties` is set; reserved
///   top-level fields are always accepted
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl Validator for SchemaValidator {
    fn validate(&self, schema: &Schema, raw: &JsonValue) -> std::result::Result<JsonValue, String> {
        let mut out = raw.clone();
        let obj = out
            .as_object_mut()
            .ok_or_else(|| "record must be an object".to_string())?;
        if let Some(id) = obj.get(ID_FIELD) {
            if !id.is_string() {
                return Err(format!("field '{}' must be a string", ID_FIELD));
            }
        }
        validate_object(schema, obj, "", true)?;
        Ok(out)
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn accepts_null(spec: &FieldSpec) -> bool {
    spec.optional || matches!(spec.kind, FieldKind::Any | FieldKind::Link { .. })
}

fn validate_object(
    schema: &Schema,
    obj: &mut Map<String, Value>,
    prefix: &str,
    top_level: bool,
) -> std::result::Result<(), String> {
    for (name, spec) in &schema.fields {
        let path = join(prefix, name);
        if matches!(spec.kind, FieldKind::BackLink { .. }) {
            obj.remove(name);
            continue;
        }

        let is_null = obj.get(name).map(Value::is_null).unwrap_or(true);
        if is_null {
            if let Some(default) = &spec.default {
                obj.insert(name.clone(), default.as_inner().clone());
            } else if matches!(spec.kind, FieldKind::MultiLink { .. }) && !obj.contains_key(name) {
                obj.insert(name.clone(), Value::Array(Vec::new()));
            } else if !accepts_null(spec) {
                return Err(format!("missing required field '{}'", path));
            }
        }

        if let Some(value) = obj.get_mut(name) {
            if !value.is_null() {
                check_value(&spec.kind, value, &path)?;
            }
        }
    }

    if !schema.extra_properties {
        let unknown = obj
            .keys()
            .find(|k| !schema.fields.contains_key(*k) && !(top_level && is_reserved(k)));
        if let Some(key) = unknown {
            return Err(format!("unknown field '{}'", join(prefix, key)));
        }
    }
    Ok(())
}

fn type_error(path: &str, expected: &str, found: &Value) -> String {
    format!(
        "field '{}' must be {}, got {}",
        path,
        expected,
        trellis_core::json::value_type_name(found)
    )
}

fn check_value(kind: &FieldKind, value: &mut Value, path: &str) -> std::result::Result<(), String> {
    match kind {
        FieldKind::Any => Ok(()),
        FieldKind::String if value.is_string() => Ok(()),
        FieldKind::String => Err(type_error(path, "a string", value)),
        FieldKind::Number if value.is_number() => Ok(()),
        FieldKind::Number => Err(type_error(path, "a number", value)),
        FieldKind::Integer if value.is_i64() || value.is_u64() => Ok(()),
        FieldKind::Integer => Err(type_error(path, "an integer", value)),
        FieldKind::Boolean if value.is_boolean() => Ok(()),
        FieldKind::Boolean => Err(type_error(path, "a boolean", value)),
        FieldKind::Object(schema) => match value {
            Value::Object(obj) => validate_object(schema, obj, path, false),
            other => Err(type_error(path, "an object", other)),
        },
        FieldKind::Array(element) => match value {
            Value::Array(items) => {
                for (i, item) in items.iter_mut().enumerate() {
                    let item_path = format!("{}.{}", path, i);
                    if item.is_null() && **element != FieldKind::Any {
                        return Err(format!("field '{}' must not be null", item_path));
                    }
                    check_value(element, item, &item_path)?;
                }
                Ok(())
            }
            other => Err(type_error(path, "an array", other)),
        },
        FieldKind::Link { collection } => {
            *value = canonical_link(value, collection.as_deref(), path)?;
            Ok(())
        }
        FieldKind::MultiLink { collection } => match value {
            Value::Array(items) => {
                let mut seen = HashSet::new();
                let mut canonical = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let link = canonical_link(item, collection.as_deref(), &format!("{}.{}", path, i))?;
                    if seen.insert(link.to_string()) {
                        canonical.push(link);
                    }
                }
                *items = canonical;
                Ok(())
            }
            other => Err(type_error(path, "an array of links", other)),
        },
        FieldKind::BackLink { .. } => Err(format!("back-link field '{}' cannot be stored", path)),
    }
}

fn canonical_link(
    value: &Value,
    fixed: Option<&str>,
    path: &str,
) -> std::result::Result<Value, String> {
    let (id, named) = match value {
        Value::String(id) => (id.as_str(), None),
        Value::Object(obj) => match obj.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) => (id, obj.get(COLLECTION_FIELD).and_then(Value::as_str)),
            None => return Err(format!("link '{}' must carry a string '{}'", path, ID_FIELD)),
        },
        other => return Err(type_error(path, "a link", other)),
    };

    let mut link = Map::new();
    link.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
    match (fixed, named) {
        (Some(_), _) => {}
        (None, Some(collection)) => {
            link.insert(
                COLLECTION_FIELD.to_string(),
                Value::String(collection.to_string()),
            );
        }
        (None, None) => {
            return Err(format!(
                "polymorphic link '{}' must name its '{}'",
                path, COLLECTION_FIELD
            ))
        }
    }
    Ok(Value::Object(link))
}
