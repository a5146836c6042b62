//! Ordered document lists
//!
//! A [`Batch`] is what multi-record reads return and what multi-links and
//! back-links resolve to. A batch produced by
//! [`Collection::lock_retrieve_release`](crate::Collection::lock_retrieve_release)
//! also carries the handle releasing its locks.

use crate::document::Document;
use crate::populate::{self, PopulateOptions, PopulationStats};
use std::sync::Arc;
use trellis_concurrency::LockRelease;
use trellis_core::{DocId, JsonValue, Result};

/// Ordered list of documents
#[derive(Debug, Clone, Default)]
pub struct Batch {
    documents: Vec<Document>,
    release: Option<Arc<LockRelease>>,
    stats: Option<PopulationStats>,
}

impl Batch {
    /// Batch over the given documents
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            release: None,
            stats: None,
        }
    }

    pub(crate) fn with_release(mut self, release: LockRelease) -> Self {
        self.release = Some(Arc::new(release));
        self
    }

    pub(crate) fn with_stats(mut self, stats: PopulationStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Number of documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Document at a position
    pub fn get(&self, index: usize) -> Option<&Document> {
        self.documents.get(index)
    }

    /// First document
    pub fn first(&self) -> Option<&Document> {
        self.documents.first()
    }

    /// Iterate in order
    pub fn iter(&self) -> std::slice::Iter<'_, Document> {
        self.documents.iter()
    }

    /// Documents as a slice
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Append a document
    pub fn push(&mut self, document: Document) {
        self.documents.push(document);
    }

    /// Ids in order
    pub fn ids(&self) -> Vec<DocId> {
        self.documents.iter().map(|d| d.id().clone()).collect()
    }

    /// Statistics of the population run by the read that built this batch
    pub fn population_stats(&self) -> Option<PopulationStats> {
        self.stats
    }

    /// Save every document, stopping at the first error
    pub fn save_all(&self) -> Result<()> {
        self.documents.iter().try_for_each(Document::save)
    }

    /// Commit every document, stopping at the first error
    pub fn commit_all(&self) -> Result<()> {
        self.documents.iter().try_for_each(Document::commit)
    }

    /// Release the locks held on these documents; returns how many were
    /// released
    ///
    /// Uses the lock-retrieve-release handle when the batch has one, and each
    /// document's own lock otherwise. Calling it twice releases nothing more.
    pub fn release_locks(&self) -> Result<usize> {
        let released = match &self.release {
            Some(release) => {
                let released = release.release()?;
                for doc in &self.documents {
                    doc.forget_lock();
                }
                released
            }
            None => {
                let mut released = 0;
                for doc in &self.documents {
                    if doc.unlock()? {
                        released += 1;
                    }
                }
                released
            }
        };
        Ok(released)
    }

    /// Resolve link fields across every document, batching fetches
    pub fn populate(&self, paths: &[&str], options: &PopulateOptions) -> Result<PopulationStats> {
        populate::populate(&self.documents, paths, options)
    }

    /// Raw records as a JSON array
    pub fn to_json(&self) -> JsonValue {
        JsonValue::from_value(serde_json::Value::Array(
            self.documents
                .iter()
                .map(|d| d.to_json().into_inner())
                .collect(),
        ))
    }
}

impl From<Vec<Document>> for Batch {
    fn from(documents: Vec<Document>) -> Self {
        Self::new(documents)
    }
}

impl IntoIterator for Batch {
    type Item = Document;
    type IntoIter = std::vec::IntoIter<Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents.into_iter()
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Document;
    type IntoIter = std::slice::Iter<'a, Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents.iter()
    }
}
