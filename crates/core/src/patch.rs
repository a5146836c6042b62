//! Minimal persistence patch
//!
//! A `Patch` is what a commit sends to the storage driver: the leaf paths
//! whose new value must be written (`set`) and the leaf paths that no longer
//! exist (`unset`). Paths never overlap within one patch; the dirty-path tree
//! that produces them collapses descendants into their written ancestor.

use crate::json::{delete_at_path, set_at_path, JsonPath, JsonPathError, JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Set/unset payload applied to one stored record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    /// New values keyed by path
    pub set: BTreeMap<JsonPath, JsonValue>,
    /// Paths to remove
    pub unset: BTreeSet<JsonPath>,
}

impl Patch {
    /// Create an empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value to write
    pub fn set(mut self, path: JsonPath, value: JsonValue) -> Self {
        self.unset.remove(&path);
        self.set.insert(path, value);
        self
    }

    /// Record a path to remove
    pub fn unset(mut self, path: JsonPath) -> Self {
        self.set.remove(&path);
        self.unset.insert(path);
        self
    }

    /// Whether the patch writes nothing
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// Number of touched paths
    pub fn len(&self) -> usize {
        self.set.len() + self.unset.len()
    }

    /// Every touched path, sets first
    pub fn paths(&self) -> impl Iterator<Item = &JsonPath> {
        self.set.keys().chain(self.unset.iter())
    }

    /// Apply the patch to a stored record
    ///
    /// Unsets are applied in reverse path order so that removing several
    /// elements of one array does not shift the indices still to remove.
    pub fn apply_to(&self, record: &mut JsonValue) -> Result<(), JsonPathError> {
        for (path, value) in &self.set {
            set_at_path(record, path, value.clone())?;
        }
        for path in self.unset.iter().rev() {
            delete_at_path(record, path)?;
        }
        Ok(())
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<String> = self.set.keys().map(|p| p.to_dot_path()).collect();
        let unset: Vec<String> = self.unset.iter().map(|p| p.to_dot_path()).collect();
        write!(f, "set=[{}] unset=[{}]", set.join(", "), unset.join(", "))
    }
}
