//! Core types and traits for Trellis
//!
//! This crate defines the foundational types used throughout the system:
//! - JSON types: JsonValue, JsonPath, path operations and wildcard expansion
//! - Identity: DocId, DocRef (link shapes), LockId, reserved field names
//! - Patch: minimal set/unset persistence payload
//! - Fingerprint and IndexSpec: partial-record lookups and unique indexes
//! - Error: error taxonomy shared by every layer
//! - StorageDriver: the contract every backing store implements

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fingerprint;
pub mod index;
pub mod json;
pub mod patch;
pub mod timestamp;
pub mod traits;
pub mod types;

pub use error::{ConflictKind, Error, ErrorCode, Result};
pub use fingerprint::Fingerprint;
pub use index::IndexSpec;
pub use json::{
    delete_at_path, expand_wildcards, get_at_path, get_at_path_mut, set_at_path, JsonPath,
    JsonPathError, JsonValue, LimitError, PathParseError, PathSegment, MAX_NESTING_DEPTH,
    MAX_PATH_LENGTH,
};
pub use patch::Patch;
pub use timestamp::Timestamp;
pub use traits::{LockClaim, StorageDriver};
pub use types::{
    DocId, DocRef, LockId, ACTIVE_VERSION_FIELD, COLLECTION_FIELD, FROZEN_FIELD, ID_FIELD,
    LAST_MODIFIED_FIELD, LOCKED_AT_FIELD, LOCKED_BY_FIELD, LOCK_FIELDS, VERSION_FIELD,
};
