//! Identity map for one population session
//!
//! Every document a session touches is registered under `(collection, id)`,
//! so each stored record maps to exactly one in-memory [`Document`]. The first
//! registration wins; later ones get the existing instance back.
//!
//! Clones share the same map, so a cache can be handed to several reads.

use crate::document::Document;
use dashmap::DashMap;
use std::sync::Arc;
use trellis_core::DocId;

type CacheKey = (String, DocId);

/// Shared `(collection, id) -> Document` map
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<CacheKey, Document>>,
}

impl MemoryCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached instance of a record
    pub fn get(&self, collection: &str, id: &DocId) -> Option<Document> {
        self.entries
            .get(&(collection.to_string(), id.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Whether a record is cached
    pub fn contains(&self, collection: &str, id: &DocId) -> bool {
        self.entries
            .contains_key(&(collection.to_string(), id.clone()))
    }

    /// Register a document; returns the instance now cached for its key
    pub fn add(&self, document: Document) -> Document {
        let key = (document.collection_name().to_string(), document.id().clone());
        self.entries.entry(key).or_insert(document).value().clone()
    }

    /// Cached instance, or the one built by `make` registered in its place
    pub fn get_or_insert_with(
        &self,
        collection: &str,
        id: &DocId,
        make: impl FnOnce() -> Document,
    ) -> Document {
        self.entries
            .entry((collection.to_string(), id.clone()))
            .or_insert_with(make)
            .value()
            .clone()
    }

    /// Number of cached documents
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.len())
            .finish()
    }
}
