//! Index declarations
//!
//! Indexes are declared per collection and handed to the storage driver.
//! Unique indexes also drive [`Fingerprint`](crate::Fingerprint) uniqueness.

use serde::{Deserialize, Serialize};

/// A declared index over one or more dot-path fields
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name, derived from the fields unless given
    pub name: String,
    /// Indexed dot-path fields, in order
    pub fields: Vec<String>,
    /// Whether the combination of fields must be unique
    pub unique: bool,
}

impl IndexSpec {
    /// Non-unique index
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        Self {
            name: fields.join("_"),
            fields,
            unique: false,
        }
    }

    /// Unique index
    pub fn unique<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            unique: true,
            ..Self::new(fields)
        }
    }

    /// Override the derived name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
