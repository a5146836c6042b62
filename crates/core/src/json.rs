//! JSON types for raw records
//!
//! This module defines the value and path model every other layer works with:
//! - JsonValue: Newtype wrapper around serde_json::Value
//! - JsonPath: Path into a record (e.g., `user.name`, `items[0]`, `items[*].ref`)
//! - PathSegment: Individual path component (Key, Index or Wildcard)
//!
//! # Limits
//!
//! | Limit | Value | Constant |
//! |-------|-------|----------|
//! | Max nesting depth | 100 levels | [`MAX_NESTING_DEPTH`] |
//! | Max path length | 256 segments | [`MAX_PATH_LENGTH`] |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use thiserror::Error;

// =============================================================================
// Limits
// =============================================================================

/// Maximum nesting depth in a record (100 levels)
///
/// Prevents stack overflow during recursive operations like validation,
/// flattening and path traversal.
pub const MAX_NESTING_DEPTH: usize = 100;

/// Maximum path length in segments (256 segments)
pub const MAX_PATH_LENGTH: usize = 256;

/// Error type for limit violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// Record nesting exceeds maximum depth
    #[error("record nesting depth {depth} exceeds maximum of {max} levels")]
    NestingTooDeep {
        /// Actual nesting depth
        depth: usize,
        /// Maximum allowed depth
        max: usize,
    },

    /// Path exceeds maximum length
    #[error("path length {length} exceeds maximum of {max} segments")]
    PathTooLong {
        /// Actual path length
        length: usize,
        /// Maximum allowed length
        max: usize,
    },
}

/// JSON value wrapper
///
/// Newtype around serde_json::Value providing:
/// - Direct access to underlying serde_json::Value via Deref/DerefMut
/// - Easy construction from common types
/// - Serialization/deserialization support
///
/// # Examples
///
/// ```
/// use trellis_core::JsonValue;
///
/// let obj = JsonValue::object();
/// let s = JsonValue::from("hello");
/// assert!(obj.is_object());
/// assert_eq!(s.as_str(), Some("hello"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct JsonValue(serde_json::Value);

impl JsonValue {
    /// Create a null JSON value
    pub fn null() -> Self {
        JsonValue(serde_json::Value::Null)
    }

    /// Create an empty JSON object
    pub fn object() -> Self {
        JsonValue(serde_json::Value::Object(serde_json::Map::new()))
    }

    /// Create an empty JSON array
    pub fn array() -> Self {
        JsonValue(serde_json::Value::Array(Vec::new()))
    }

    /// Create from a serde_json::Value
    pub fn from_value(value: serde_json::Value) -> Self {
        JsonValue(value)
    }

    /// Get the underlying serde_json::Value
    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }

    /// Get a reference to the underlying serde_json::Value
    pub fn as_inner(&self) -> &serde_json::Value {
        &self.0
    }

    pub(crate) fn as_inner_mut(&mut self) -> &mut serde_json::Value {
        &mut self.0
    }

    /// Calculate the maximum nesting depth of this JSON value
    ///
    /// Returns 0 for primitives (null, bool, number, string),
    /// and counts nested objects/arrays.
    pub fn nesting_depth(&self) -> usize {
        fn depth_of(value: &serde_json::Value) -> usize {
            match value {
                serde_json::Value::Null
                | serde_json::Value::Bool(_)
                | serde_json::Value::Number(_)
                | serde_json::Value::String(_) => 0,
                serde_json::Value::Array(arr) => 1 + arr.iter().map(depth_of).max().unwrap_or(0),
                serde_json::Value::Object(obj) => 1 + obj.values().map(depth_of).max().unwrap_or(0),
            }
        }
        depth_of(&self.0)
    }

    /// Validate nesting depth limit
    ///
    /// Returns an error if the value exceeds [`MAX_NESTING_DEPTH`].
    pub fn validate_depth(&self) -> Result<(), LimitError> {
        let depth = self.nesting_depth();
        if depth > MAX_NESTING_DEPTH {
            Err(LimitError::NestingTooDeep {
                depth,
                max: MAX_NESTING_DEPTH,
            })
        } else {
            Ok(())
        }
    }

    /// Get a top-level field of an object value
    pub fn field(&self, key: &str) -> Option<&JsonValue> {
        get_at_path(self, &JsonPath::root().key(key))
    }
}

impl FromStr for JsonValue {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).map(JsonValue)
    }
}

impl Deref for JsonValue {
    type Target = serde_json::Value;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for JsonValue {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for JsonValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for JsonValue {
    fn default() -> Self {
        Self::null()
    }
}

impl From<serde_json::Value> for JsonValue {
    fn from(v: serde_json::Value) -> Self {
        JsonValue(v)
    }
}

impl From<JsonValue> for serde_json::Value {
    fn from(v: JsonValue) -> Self {
        v.0
    }
}

impl From<bool> for JsonValue {
    fn from(v: bool) -> Self {
        JsonValue(serde_json::Value::Bool(v))
    }
}

impl From<i64> for JsonValue {
    fn from(v: i64) -> Self {
        JsonValue(serde_json::Value::Number(v.into()))
    }
}

impl From<i32> for JsonValue {
    fn from(v: i32) -> Self {
        JsonValue(serde_json::Value::Number(v.into()))
    }
}

impl From<u64> for JsonValue {
    fn from(v: u64) -> Self {
        JsonValue(serde_json::Value::Number(v.into()))
    }
}

impl From<f64> for JsonValue {
    fn from(v: f64) -> Self {
        JsonValue(
            serde_json::Number::from_f64(v)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
        )
    }
}

impl From<&str> for JsonValue {
    fn from(v: &str) -> Self {
        JsonValue(serde_json::Value::String(v.to_string()))
    }
}

impl From<String> for JsonValue {
    fn from(v: String) -> Self {
        JsonValue(serde_json::Value::String(v))
    }
}

impl<T: Into<JsonValue>> From<Vec<T>> for JsonValue {
    fn from(v: Vec<T>) -> Self {
        JsonValue(serde_json::Value::Array(
            v.into_iter().map(|x| x.into().0).collect(),
        ))
    }
}

impl<T: Into<JsonValue>> From<Option<T>> for JsonValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => JsonValue::null(),
        }
    }
}

// =============================================================================
// JsonPath and PathSegment
// =============================================================================

/// Error type for JSON path parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathParseError {
    /// Empty key in path
    #[error("empty key in path at position {0}")]
    EmptyKey(usize),
    /// Unclosed bracket
    #[error("unclosed bracket starting at position {0}")]
    UnclosedBracket(usize),
    /// Invalid array index
    #[error("invalid array index at position {0}: {1}")]
    InvalidIndex(usize, String),
    /// Unexpected character
    #[error("unexpected character '{0}' at position {1}")]
    UnexpectedChar(char, usize),
}

/// A segment in a JSON path
///
/// Segments are ordered `Key < Index < Wildcard`, keys and indices by value,
/// so paths can key ordered collections.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    /// Object key: `.foo`
    Key(String),
    /// Array index: `[0]`
    Index(usize),
    /// Any array element or object member: `[*]` or `.*`
    Wildcard,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, ".{}", k),
            PathSegment::Index(i) => write!(f, "[{}]", i),
            PathSegment::Wildcard => write!(f, "[*]"),
        }
    }
}

/// A path into a raw record
///
/// | Syntax | Meaning | Example |
/// |--------|---------|---------|
/// | `key` | Object property | `user` |
/// | `[n]` | Array index | `[0]` |
/// | `key1.key2` | Nested property | `user.name` |
/// | `key[n]` | Property then index | `items[0]` |
/// | `key[*]` / `key.*` | Every element | `friends[*]` |
/// | (empty) | Root | `` |
///
/// # Examples
///
/// ```
/// use trellis_core::json::JsonPath;
///
/// let user_name = JsonPath::root().key("user").key("name");
/// let path: JsonPath = "user.name".parse().unwrap();
/// assert_eq!(path, user_name);
///
/// assert_eq!(user_name.parent(), Some(JsonPath::root().key("user")));
/// ```
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct JsonPath {
    segments: Vec<PathSegment>,
}

impl JsonPath {
    /// Create the root path (empty path)
    pub fn root() -> Self {
        JsonPath {
            segments: Vec::new(),
        }
    }

    /// Create a path from a vector of segments
    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        JsonPath { segments }
    }

    /// Get the path segments
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Get the number of segments in the path
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Check if this is the root path (empty)
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Check if this is the root path
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append a key segment (builder pattern)
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.segments.push(PathSegment::Key(key.into()));
        self
    }

    /// Append an index segment (builder pattern)
    pub fn index(mut self, idx: usize) -> Self {
        self.segments.push(PathSegment::Index(idx));
        self
    }

    /// Append a wildcard segment (builder pattern)
    pub fn wildcard(mut self) -> Self {
        self.segments.push(PathSegment::Wildcard);
        self
    }

    /// Append another path's segments (builder pattern)
    pub fn join(mut self, other: &JsonPath) -> Self {
        self.segments.extend(other.segments.iter().cloned());
        self
    }

    /// Get the parent path (None if root)
    pub fn parent(&self) -> Option<JsonPath> {
        if self.segments.is_empty() {
            None
        } else {
            let mut parent = self.clone();
            parent.segments.pop();
            Some(parent)
        }
    }

    /// Get the last segment (None if root)
    pub fn last_segment(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    /// Whether any segment is a wildcard
    pub fn has_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, PathSegment::Wildcard))
    }

    /// The path with every index replaced by a wildcard
    ///
    /// Two concrete paths into the same schema field share the same shape.
    pub fn shape(&self) -> JsonPath {
        JsonPath::from_segments(
            self.segments
                .iter()
                .map(|s| match s {
                    PathSegment::Index(_) => PathSegment::Wildcard,
                    other => other.clone(),
                })
                .collect(),
        )
    }

    /// Validate path length limit
    pub fn validate(&self) -> Result<(), LimitError> {
        let length = self.segments.len();
        if length > MAX_PATH_LENGTH {
            Err(LimitError::PathTooLong {
                length,
                max: MAX_PATH_LENGTH,
            })
        } else {
            Ok(())
        }
    }

    /// Convert to a string representation (`a.b[0].c`)
    pub fn to_path_string(&self) -> String {
        let mut result = String::new();
        for seg in &self.segments {
            match seg {
                PathSegment::Key(k) => {
                    if !result.is_empty() {
                        result.push('.');
                    }
                    result.push_str(k);
                }
                PathSegment::Index(i) => {
                    result.push('[');
                    result.push_str(&i.to_string());
                    result.push(']');
                }
                PathSegment::Wildcard => result.push_str("[*]"),
            }
        }
        result
    }

    /// Convert to a storage dot-path (`a.b.0.c`)
    ///
    /// This is the form query filters use, where array positions are
    /// plain numeric keys.
    pub fn to_dot_path(&self) -> String {
        self.segments
            .iter()
            .map(|seg| match seg {
                PathSegment::Key(k) => k.clone(),
                PathSegment::Index(i) => i.to_string(),
                PathSegment::Wildcard => "*".to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn is_key_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '$'
}

impl FromStr for JsonPath {
    type Err = PathParseError;

    /// Parse a path from a string
    ///
    /// Supported syntax:
    /// - `foo` or `.foo` - object key
    /// - `[0]` - array index
    /// - `[*]` or `.*` - wildcard
    /// - `foo.bar`, `foo[0]`, `foo[0].bar` - mixed
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(JsonPath::root());
        }

        let mut segments = Vec::new();
        let chars: Vec<char> = s.chars().collect();
        let mut i = 0;

        if chars[i] == '.' {
            i += 1;
        }

        while i < chars.len() {
            if chars[i] == '.' {
                i += 1;
                if i >= chars.len() {
                    return Err(PathParseError::EmptyKey(i));
                }
            }

            if chars[i] == '[' {
                let start = i;
                i += 1;
                let idx_start = i;

                while i < chars.len() && chars[i] != ']' {
                    i += 1;
                }

                if i >= chars.len() {
                    return Err(PathParseError::UnclosedBracket(start));
                }

                let idx_str: String = chars[idx_start..i].iter().collect();
                if idx_str == "*" {
                    segments.push(PathSegment::Wildcard);
                } else {
                    let idx = idx_str
                        .parse::<usize>()
                        .map_err(|_| PathParseError::InvalidIndex(idx_start, idx_str))?;
                    segments.push(PathSegment::Index(idx));
                }
                i += 1;
            } else if chars[i] == '*' {
                segments.push(PathSegment::Wildcard);
                i += 1;
            } else if is_key_char(chars[i]) {
                let key_start = i;
                while i < chars.len() && is_key_char(chars[i]) {
                    i += 1;
                }
                let key: String = chars[key_start..i].iter().collect();
                segments.push(PathSegment::Key(key));
            } else if chars[i] == '.' {
                return Err(PathParseError::EmptyKey(i));
            } else {
                return Err(PathParseError::UnexpectedChar(chars[i], i));
            }
        }

        Ok(JsonPath { segments })
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path_string())
    }
}

// =============================================================================
// Path Operations Error
// =============================================================================

/// Error type for path operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JsonPathError {
    /// Type mismatch during path traversal
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected type
        expected: &'static str,
        /// Actual type found
        found: &'static str,
    },

    /// Array index out of bounds
    #[error("index out of bounds: {index} >= {len}")]
    IndexOutOfBounds {
        /// The requested index
        index: usize,
        /// The array length
        len: usize,
    },

    /// Wildcard segment used where a concrete path is required
    #[error("wildcard not allowed in a concrete path")]
    Wildcard,

    /// Path not found
    #[error("path not found")]
    NotFound,
}

// =============================================================================
// Path Operations
// =============================================================================

/// Get value at path within a record
///
/// Returns `None` if the path doesn't exist, traverses a type mismatch, or
/// contains a wildcard.
///
/// ```
/// use trellis_core::json::{JsonValue, JsonPath, get_at_path};
///
/// let json: JsonValue = serde_json::json!({"user": {"scores": [100, 95]}}).into();
/// let path: JsonPath = "user.scores[1]".parse().unwrap();
/// assert_eq!(get_at_path(&json, &path).unwrap().as_i64(), Some(95));
/// ```
pub fn get_at_path<'a>(value: &'a JsonValue, path: &JsonPath) -> Option<&'a JsonValue> {
    if path.is_root() {
        return Some(value);
    }

    let mut current: &serde_json::Value = value.as_inner();

    for segment in path.segments() {
        match (segment, current) {
            (PathSegment::Key(key), serde_json::Value::Object(obj)) => {
                current = obj.get(key)?;
            }
            (PathSegment::Index(idx), serde_json::Value::Array(arr)) => {
                current = arr.get(*idx)?;
            }
            _ => return None,
        }
    }

    // SAFETY: JsonValue is #[repr(transparent)] over serde_json::Value, so the
    // layouts are identical and the lifetime stays tied to the input reference.
    Some(unsafe { &*(current as *const serde_json::Value as *const JsonValue) })
}

/// Get mutable reference to value at path within a record
pub fn get_at_path_mut<'a>(value: &'a mut JsonValue, path: &JsonPath) -> Option<&'a mut JsonValue> {
    if path.is_root() {
        return Some(value);
    }

    let mut current: &mut serde_json::Value = value.as_inner_mut();

    for segment in path.segments() {
        current = match (segment, current) {
            (PathSegment::Key(key), serde_json::Value::Object(obj)) => obj.get_mut(key)?,
            (PathSegment::Index(idx), serde_json::Value::Array(arr)) => arr.get_mut(*idx)?,
            _ => return None,
        };
    }

    // SAFETY: see get_at_path.
    Some(unsafe { &mut *(current as *mut serde_json::Value as *mut JsonValue) })
}

/// Set value at path within a record
///
/// Creates intermediate objects and arrays as needed when the path doesn't
/// exist. The type of intermediate container (object vs array) is determined
/// by the next segment in the path. A `null` intermediate is replaced.
///
/// ```
/// use trellis_core::json::{JsonValue, JsonPath, set_at_path, get_at_path};
///
/// let mut json = JsonValue::object();
/// let path: JsonPath = "user.profile.name".parse().unwrap();
/// set_at_path(&mut json, &path, JsonValue::from("Alice")).unwrap();
/// assert_eq!(get_at_path(&json, &path).unwrap().as_str(), Some("Alice"));
/// ```
pub fn set_at_path(
    root: &mut JsonValue,
    path: &JsonPath,
    value: JsonValue,
) -> Result<(), JsonPathError> {
    if path.has_wildcard() {
        return Err(JsonPathError::Wildcard);
    }
    let segments = path.segments();
    if segments.is_empty() {
        *root = value;
        return Ok(());
    }

    let (parent_segments, last_segment) = segments.split_at(segments.len() - 1);
    let last_segment = &last_segment[0];

    let mut current = root.as_inner_mut();

    for (i, segment) in parent_segments.iter().enumerate() {
        let next_segment = &segments[i + 1];
        let new_container = || match next_segment {
            PathSegment::Index(_) => serde_json::Value::Array(Vec::new()),
            _ => serde_json::Value::Object(serde_json::Map::new()),
        };

        match segment {
            PathSegment::Key(key) => {
                if current.is_null() {
                    *current = serde_json::Value::Object(serde_json::Map::new());
                }
                let found = value_type_name(current);
                let obj = current.as_object_mut().ok_or(JsonPathError::TypeMismatch {
                    expected: "object",
                    found,
                })?;
                let slot = obj.entry(key.clone()).or_insert_with(new_container);
                if slot.is_null() {
                    *slot = new_container();
                }
                current = slot;
            }
            PathSegment::Index(idx) => {
                let found = value_type_name(current);
                let arr = current.as_array_mut().ok_or(JsonPathError::TypeMismatch {
                    expected: "array",
                    found,
                })?;
                let len = arr.len();
                current = arr.get_mut(*idx).ok_or(JsonPathError::IndexOutOfBounds {
                    index: *idx,
                    len,
                })?;
            }
            PathSegment::Wildcard => return Err(JsonPathError::Wildcard),
        }
    }

    match last_segment {
        PathSegment::Key(key) => {
            if current.is_null() {
                *current = serde_json::Value::Object(serde_json::Map::new());
            }
            let found = value_type_name(current);
            let obj = current.as_object_mut().ok_or(JsonPathError::TypeMismatch {
                expected: "object",
                found,
            })?;
            obj.insert(key.clone(), value.into_inner());
            Ok(())
        }
        PathSegment::Index(idx) => {
            let found = value_type_name(current);
            let arr = current.as_array_mut().ok_or(JsonPathError::TypeMismatch {
                expected: "array",
                found,
            })?;
            if *idx < arr.len() {
                arr[*idx] = value.into_inner();
                Ok(())
            } else if *idx == arr.len() {
                arr.push(value.into_inner());
                Ok(())
            } else {
                Err(JsonPathError::IndexOutOfBounds {
                    index: *idx,
                    len: arr.len(),
                })
            }
        }
        PathSegment::Wildcard => Err(JsonPathError::Wildcard),
    }
}

/// Helper to get type name for error messages
pub fn value_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Delete value at path within a record
///
/// For objects, this removes the key. For arrays, this removes the element
/// and shifts subsequent elements. Deleting the root replaces the value with
/// null.
///
/// # Returns
///
/// * `Ok(Some(value))` - The deleted value
/// * `Ok(None)` - The path didn't exist
/// * `Err(JsonPathError)` - Type mismatch during traversal
pub fn delete_at_path(
    root: &mut JsonValue,
    path: &JsonPath,
) -> Result<Option<JsonValue>, JsonPathError> {
    if path.has_wildcard() {
        return Err(JsonPathError::Wildcard);
    }
    let (parent_path, last_segment) = match (path.parent(), path.last_segment()) {
        (Some(parent), Some(last)) => (parent, last),
        _ => return Ok(Some(std::mem::take(root))),
    };

    let parent = match get_at_path_mut(root, &parent_path) {
        Some(parent) => parent.as_inner_mut(),
        None => return Ok(None),
    };

    match last_segment {
        PathSegment::Key(key) => match parent {
            serde_json::Value::Object(obj) => Ok(obj.remove(key).map(JsonValue::from_value)),
            other => Err(JsonPathError::TypeMismatch {
                expected: "object",
                found: value_type_name(other),
            }),
        },
        PathSegment::Index(idx) => match parent {
            serde_json::Value::Array(arr) if *idx < arr.len() => {
                Ok(Some(JsonValue::from_value(arr.remove(*idx))))
            }
            serde_json::Value::Array(_) => Ok(None),
            other => Err(JsonPathError::TypeMismatch {
                expected: "array",
                found: value_type_name(other),
            }),
        },
        PathSegment::Wildcard => Err(JsonPathError::Wildcard),
    }
}

/// Expand every wildcard of `pattern` against the value's actual content
///
/// A wildcard matches each index of an array, or each key of an object.
/// Concrete segments are kept as they are, even when absent from the value,
/// so a path without wildcards expands to itself.
///
/// ```
/// use trellis_core::json::{JsonValue, JsonPath, expand_wildcards};
///
/// let json: JsonValue = serde_json::json!({"friends": [{"ref": 1}, {"ref": 2}]}).into();
/// let paths = expand_wildcards(&json, &"friends[*].ref".parse().unwrap());
/// assert_eq!(paths.len(), 2);
/// assert_eq!(paths[1].to_path_string(), "friends[1].ref");
/// ```
pub fn expand_wildcards(value: &JsonValue, pattern: &JsonPath) -> Vec<JsonPath> {
    fn walk(
        current: Option<&serde_json::Value>,
        rest: &[PathSegment],
        prefix: JsonPath,
        out: &mut Vec<JsonPath>,
    ) {
        let Some((head, tail)) = rest.split_first() else {
            out.push(prefix);
            return;
        };
        match head {
            PathSegment::Wildcard => match current {
                Some(serde_json::Value::Array(arr)) => {
                    for (i, item) in arr.iter().enumerate() {
                        walk(Some(item), tail, prefix.clone().index(i), out);
                    }
                }
                Some(serde_json::Value::Object(obj)) => {
                    for (k, item) in obj {
                        walk(Some(item), tail, prefix.clone().key(k.clone()), out);
                    }
                }
                _ => {}
            },
            PathSegment::Key(k) => {
                let next = current.and_then(|c| c.as_object()).and_then(|o| o.get(k));
                walk(next, tail, prefix.key(k.clone()), out);
            }
            PathSegment::Index(i) => {
                let next = current.and_then(|c| c.as_array()).and_then(|a| a.get(*i));
                walk(next, tail, prefix.index(*i), out);
            }
        }
    }

    let mut out = Vec::new();
    walk(
        Some(value.as_inner()),
        pattern.segments(),
        JsonPath::root(),
        &mut out,
    );
    out
}
