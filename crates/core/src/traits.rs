//! Storage driver contract
//!
//! A storage driver owns one backing-store collection and exposes CRUD
//! primitives over raw records. The data-access layer never interprets query
//! filters itself: `find` receives the filter verbatim.
//!
//! Drivers are synchronous and must be `Send + Sync`: the caller's flow blocks
//! only on the call it waits for, and writes to different documents may run
//! on different threads. Every write that touches a unique index must be atomic
//! with respect to the uniqueness check, and `lock`/`unlock` must be
//! conditional updates.

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::index::IndexSpec;
use crate::json::JsonValue;
use crate::patch::Patch;
use crate::timestamp::Timestamp;
use crate::types::{DocId, LockId};
use std::time::Duration;

/// Lock reserved by a document before its first write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockClaim {
    /// Holder id to store in `_lockedBy`
    pub holder: LockId,
    /// Acquisition time to store in `_lockedAt`
    pub acquired_at: Timestamp,
}

/// CRUD primitives over one backing-store collection
pub trait StorageDriver: Send + Sync {
    /// Name of the backing-store collection
    fn collection_name(&self) -> &str;

    /// Fetch one record by id
    fn get(&self, id: &DocId) -> Result<Option<JsonValue>>;

    /// Fetch the record a unique fingerprint identifies
    fn get_unique(&self, fingerprint: &Fingerprint) -> Result<Option<JsonValue>>;

    /// Fetch several records by id in one request
    ///
    /// Missing ids are skipped; order follows `ids`.
    fn multi_get(&self, ids: &[DocId]) -> Result<Vec<JsonValue>>;

    /// Fetch every record matching a fingerprint
    fn collect(&self, fingerprint: &Fingerprint) -> Result<Vec<JsonValue>>;

    /// Fetch every record matching a driver-specific filter
    fn find(&self, query: &JsonValue) -> Result<Vec<JsonValue>>;

    /// Insert a new record, optionally with a reserved lock
    fn create(&self, raw: &JsonValue, lock: Option<&LockClaim>) -> Result<()>;

    /// Overwrite a record entirely, keeping its lock fields
    fn update(&self, id: &DocId, raw: &JsonValue) -> Result<()>;

    /// Apply a set/unset patch to a record
    fn patch(&self, id: &DocId, patch: &Patch) -> Result<()>;

    /// Delete a record; returns whether it existed
    fn delete(&self, id: &DocId) -> Result<bool>;

    /// Acquire the record's lock if it is free or expired
    ///
    /// Returns `false` when another live lock is held.
    fn lock(&self, id: &DocId, holder: &LockId, timeout: Duration) -> Result<bool>;

    /// Release the record's lock if `holder` holds it
    fn unlock(&self, id: &DocId, holder: &LockId) -> Result<bool>;

    /// Lock every free record matching `query` and return the locked records
    fn lock_matching(
        &self,
        query: &JsonValue,
        holder: &LockId,
        timeout: Duration,
    ) -> Result<Vec<JsonValue>>;

    /// Release every lock held by `holder`; returns how many were released
    fn unlock_all(&self, holder: &LockId) -> Result<usize>;

    /// Declared indexes
    fn get_indexes(&self) -> Result<Vec<IndexSpec>>;

    /// Build (or rebuild) an index
    fn build_index(&self, index: &IndexSpec) -> Result<()>;

    /// Drop an index by name; returns whether it existed
    fn drop_index(&self, name: &str) -> Result<bool>;

    /// Remove every record
    fn clear(&self) -> Result<()>;
}
