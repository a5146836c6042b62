//! Error types for Trellis
//!
//! One error enum covers the whole data-access layer. We use `thiserror` for
//! automatic `Display` and `Error` trait implementations.
//!
//! ## Taxonomy
//!
//! | Variant | Raised for |
//! |---------|------------|
//! | `Validation` | schema violation on create/save/commit |
//! | `NotFound` | missing id or fingerprint target |
//! | `BadRequest` | non-unique fingerprint, accessor/link kind mismatch, undeclared collection, deleted or frozen document |
//! | `Conflict` | duplicate key (with the offending index fields) or an exhausted version-archive retry |
//! | `Internal` | schema declares a link without a resolvable target collection |
//! | `Storage` | any other driver failure |

use crate::json::{JsonPathError, LimitError, PathParseError};
use thiserror::Error;

/// Result type alias for Trellis operations
pub type Result<T> = std::result::Result<T, Error>;

/// Sub-kind of a [`Error::Conflict`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// A unique index rejected the write
    DuplicateKey,
    /// Version archival kept colliding with concurrent writers
    VersionArchiveRace,
}

/// Discriminant of an [`Error`], used to exclude an expected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// [`Error::Validation`]
    Validation,
    /// [`Error::NotFound`]
    NotFound,
    /// [`Error::BadRequest`]
    BadRequest,
    /// [`Error::Conflict`] with [`ConflictKind::DuplicateKey`]
    DuplicateKey,
    /// [`Error::Conflict`] with [`ConflictKind::VersionArchiveRace`]
    VersionArchiveRace,
    /// [`Error::Internal`]
    Internal,
    /// [`Error::Storage`]
    Storage,
    /// [`Error::Serialization`]
    Serialization,
    /// [`Error::Path`]
    Path,
    /// [`Error::Config`]
    Config,
}

/// Error types for the data-access layer
#[derive(Debug, Error)]
pub enum Error {
    /// Schema violation
    #[error("{message}")]
    Validation {
        /// Collection the record was validated against
        collection: Option<String>,
        /// Decorated message naming the collection
        message: String,
        /// Original validator message
        validator_message: String,
    },

    /// Missing document
    #[error("not found: {message}")]
    NotFound {
        /// Collection that was searched
        collection: Option<String>,
        /// What was not found
        message: String,
    },

    /// Malformed or unsupported request
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Write rejected by a uniqueness constraint
    #[error("conflict in collection '{}' on index [{}]: {message}", .collection.as_deref().unwrap_or("?"), .index.join(", "))]
    Conflict {
        /// Collection whose index rejected the write
        collection: Option<String>,
        /// Conflict sub-kind
        kind: ConflictKind,
        /// Fields of the offending index
        index: Vec<String>,
        /// Driver message
        message: String,
    },

    /// Inconsistent schema or internal state
    #[error("internal error: {0}")]
    Internal(String),

    /// Storage driver failure
    #[error("storage error in collection '{}': {message}", .collection.as_deref().unwrap_or("?"))]
    Storage {
        /// Collection the driver serves
        collection: Option<String>,
        /// Driver message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid path or path operation
    #[error("path error: {0}")]
    Path(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Schema violation with the validator's own message
    pub fn validation(collection: &str, validator_message: impl Into<String>) -> Self {
        let validator_message = validator_message.into();
        Error::Validation {
            collection: Some(collection.to_string()),
            message: format!(
                "validation failed for collection '{}': {}",
                collection, validator_message
            ),
            validator_message,
        }
    }

    /// Missing document
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            collection: None,
            message: message.into(),
        }
    }

    /// Malformed request
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest(message.into())
    }

    /// Duplicate key on the given index fields
    pub fn duplicate_key(index: Vec<String>, message: impl Into<String>) -> Self {
        Error::Conflict {
            collection: None,
            kind: ConflictKind::DuplicateKey,
            index,
            message: message.into(),
        }
    }

    /// Internal inconsistency
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Driver failure
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            collection: None,
            message: message.into(),
        }
    }

    /// The error's discriminant
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation { .. } => ErrorCode::Validation,
            Error::NotFound { .. } => ErrorCode::NotFound,
            Error::BadRequest(_) => ErrorCode::BadRequest,
            Error::Conflict {
                kind: ConflictKind::DuplicateKey,
                ..
            } => ErrorCode::DuplicateKey,
            Error::Conflict {
                kind: ConflictKind::VersionArchiveRace,
                ..
            } => ErrorCode::VersionArchiveRace,
            Error::Internal(_) => ErrorCode::Internal,
            Error::Storage { .. } => ErrorCode::Storage,
            Error::Serialization(_) => ErrorCode::Serialization,
            Error::Path(_) => ErrorCode::Path,
            Error::Config(_) => ErrorCode::Config,
        }
    }

    /// Annotate a driver error with the collection it came from
    ///
    /// Only fills the collection when the error does not name one yet.
    pub fn with_collection(mut self, name: &str) -> Self {
        match &mut self {
            Error::NotFound { collection, .. }
            | Error::Conflict { collection, .. }
            | Error::Storage { collection, .. }
                if collection.is_none() =>
            {
                *collection = Some(name.to_string());
            }
            _ => {}
        }
        self
    }

    /// Collection the error is attributed to, if any
    pub fn collection(&self) -> Option<&str> {
        match self {
            Error::Validation { collection, .. }
            | Error::NotFound { collection, .. }
            | Error::Conflict { collection, .. }
            | Error::Storage { collection, .. } => collection.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<JsonPathError> for Error {
    fn from(e: JsonPathError) -> Self {
        Error::Path(e.to_string())
    }
}

impl From<PathParseError> for Error {
    fn from(e: PathParseError) -> Self {
        Error::Path(e.to_string())
    }
}

impl From<LimitError> for Error {
    fn from(e: LimitError) -> Self {
        Error::BadRequest(e.to_string())
    }
}
