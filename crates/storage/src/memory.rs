//! In-memory storage driver
//!
//! Backs `memory://` collections. Records live in a `DashMap` keyed by id, so
//! reads never block each other. Every write goes through a single write gate
//! (`parking_lot::Mutex`), which makes the unique-index check and the write one
//! atomic step, and turns `lock`/`unlock` into true conditional updates.
//!
//! # Ordering
//!
//! Each record carries an insertion sequence number. Multi-record reads return
//! records in insertion order, which keeps `find`/`collect` results stable.
//!
//! # Lock fields
//!
//! `_lockedBy` / `_lockedAt` belong to the driver. `update` keeps the stored
//! pair whatever the incoming record says.

use crate::matcher::Query;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;
use trellis_core::{
    DocId, Error, Fingerprint, IndexSpec, JsonValue, LockClaim, LockId, Patch, Result,
    StorageDriver, Timestamp, ID_FIELD, LOCKED_AT_FIELD, LOCKED_BY_FIELD, LOCK_FIELDS,
};

#[derive(Debug, Clone)]
struct StoredRecord {
    seq: u64,
    raw: JsonValue,
}

/// In-memory storage driver for one collection
#[derive(Debug)]
pub struct MemoryDriver {
    name: String,
    records: DashMap<DocId, StoredRecord>,
    indexes: RwLock<Vec<IndexSpec>>,
    write_gate: Mutex<()>,
    next_seq: AtomicU64,
    queries: AtomicU64,
}

impl MemoryDriver {
    /// Create an empty collection
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: DashMap::new(),
            indexes: RwLock::new(Vec::new()),
            write_gate: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        }
    }

    /// Number of read requests served so far
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Reset the read request counter
    pub fn reset_query_count(&self) {
        self.queries.store(0, Ordering::Relaxed);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the collection is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn count_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    fn not_found(&self, id: &DocId) -> Error {
        Error::not_found(format!("record '{}'", id)).with_collection(&self.name)
    }

    /// Records matching `query`, in insertion order
    fn scan(&self, query: &Query) -> Vec<StoredRecord> {
        let mut matched: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|entry| query.matches(&entry.value().raw))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by_key(|r| r.seq);
        matched
    }

    /// Reject `raw` if it collides with another record on a unique index
    ///
    /// Must be called with the write gate held.
    fn check_unique(&self, id: &DocId, raw: &JsonValue) -> Result<()> {
        let indexes = self.indexes.read();
        for index in indexes.iter().filter(|idx| idx.unique) {
            let Some(key) = index_key(index, raw) else {
                continue;
            };
            let clash = self.records.iter().any(|entry| {
                entry.key() != id && index_key(index, &entry.value().raw).as_ref() == Some(&key)
            });
            if clash {
                return Err(Error::duplicate_key(
                    index.fields.clone(),
                    format!("duplicate value for unique index '{}'", index.name),
                )
                .with_collection(&self.name));
            }
        }
        Ok(())
    }

    fn store(&self, id: DocId, raw: JsonValue, seq: Option<u64>) {
        let seq = seq.unwrap_or_else(|| self.next_seq.fetch_add(1, Ordering::Relaxed));
        self.records.insert(id, StoredRecord { seq, raw });
    }
}

/// Values of the index fields, or `None` when any of them is absent
fn index_key(index: &IndexSpec, raw: &JsonValue) -> Option<Vec<serde_json::Value>> {
    index
        .fields
        .iter()
        .map(|field| {
            field
                .split('.')
                .try_fold(raw.as_inner(), |cur, key| cur.as_object()?.get(key))
                .cloned()
        })
        .collect()
}

fn lock_is_live(raw: &JsonValue, now: Timestamp, timeout: Duration) -> bool {
    let holder = raw.field(LOCKED_BY_FIELD).map(|v| !v.is_null()).unwrap_or(false);
    if !holder {
        return false;
    }
    match raw.field(LOCKED_AT_FIELD).and_then(Timestamp::from_json) {
        Some(at) => now
            .duration_since(at)
            .map(|elapsed| elapsed < timeout)
            .unwrap_or(true),
        None => false,
    }
}

fn write_lock(raw: &mut JsonValue, holder: &LockId, at: Timestamp) {
    if let Some(obj) = raw.as_object_mut() {
        obj.insert(LOCKED_BY_FIELD.to_string(), holder.to_json().into_inner());
        obj.insert(LOCKED_AT_FIELD.to_string(), at.to_json().into_inner());
    }
}

fn clear_lock(raw: &mut JsonValue) {
    if let Some(obj) = raw.as_object_mut() {
        for field in LOCK_FIELDS {
            obj.remove(field);
        }
    }
}

fn held_by(raw: &JsonValue, holder: &LockId) -> bool {
    raw.field(LOCKED_BY_FIELD)
        .and_then(|v| v.as_str())
        .and_then(LockId::parse)
        .map(|stored| stored == *holder)
        .unwrap_or(false)
}

impl StorageDriver for MemoryDriver {
    fn collection_name(&self) -> &str {
        &self.name
    }

    fn get(&self, id: &DocId) -> Result<Option<JsonValue>> {
        self.count_query();
        Ok(self.records.get(id).map(|r| r.raw.clone()))
    }

    fn get_unique(&self, fingerprint: &Fingerprint) -> Result<Option<JsonValue>> {
        if !fingerprint.is_unique() {
            return Err(Error::bad_request(format!(
                "fingerprint does not cover a unique index of '{}'",
                self.name
            )));
        }
        self.count_query();
        let query = Query::parse(&fingerprint.to_query())?;
        Ok(self.scan(&query).into_iter().next().map(|r| r.raw))
    }

    fn multi_get(&self, ids: &[DocId]) -> Result<Vec<JsonValue>> {
        self.count_query();
        Ok(ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|r| r.raw.clone()))
            .collect())
    }

    fn collect(&self, fingerprint: &Fingerprint) -> Result<Vec<JsonValue>> {
        self.count_query();
        let query = Query::parse(&fingerprint.to_query())?;
        Ok(self.scan(&query).into_iter().map(|r| r.raw).collect())
    }

    fn find(&self, query: &JsonValue) -> Result<Vec<JsonValue>> {
        self.count_query();
        let query = Query::parse(query)?;
        Ok(self.scan(&query).into_iter().map(|r| r.raw).collect())
    }

    fn create(&self, raw: &JsonValue, lock: Option<&LockClaim>) -> Result<()> {
        let id = DocId::of_record(raw)
            .ok_or_else(|| Error::bad_request(format!("record in '{}' has no _id", self.name)))?;
        let mut raw = raw.clone();
        clear_lock(&mut raw);
        if let Some(claim) = lock {
            write_lock(&mut raw, &claim.holder, claim.acquired_at);
        }

        let _gate = self.write_gate.lock();
        if self.records.contains_key(&id) {
            return Err(Error::duplicate_key(
                vec![ID_FIELD.to_string()],
                format!("record '{}' already exists", id),
            )
            .with_collection(&self.name));
        }
        self.check_unique(&id, &raw)?;
        debug!(collection = %self.name, id = %id, "create");
        self.store(id, raw, None);
        Ok(())
    }

    fn update(&self, id: &DocId, raw: &JsonValue) -> Result<()> {
        let _gate = self.write_gate.lock();
        let current = self.records.get(id).map(|r| r.value().clone());
        let Some(current) = current else {
            return Err(self.not_found(id));
        };

        let mut next = raw.clone();
        clear_lock(&mut next);
        if let (Some(obj), Some(stored)) = (next.as_object_mut(), current.raw.as_object()) {
            obj.insert(ID_FIELD.to_string(), id.to_json().into_inner());
            for field in LOCK_FIELDS {
                if let Some(v) = stored.get(field) {
                    obj.insert(field.to_string(), v.clone());
                }
            }
        }
        self.check_unique(id, &next)?;
        debug!(collection = %self.name, id = %id, "update");
        self.store(id.clone(), next, Some(current.seq));
        Ok(())
    }

    fn patch(&self, id: &DocId, patch: &Patch) -> Result<()> {
        let _gate = self.write_gate.lock();
        let current = self.records.get(id).map(|r| r.value().clone());
        let Some(current) = current else {
            return Err(self.not_found(id));
        };

        let mut next = current.raw;
        patch.apply_to(&mut next)?;
        self.check_unique(id, &next)?;
        debug!(collection = %self.name, id = %id, patch = %patch, "patch");
        self.store(id.clone(), next, Some(current.seq));
        Ok(())
    }

    fn delete(&self, id: &DocId) -> Result<bool> {
        let _gate = self.write_gate.lock();
        let existed = self.records.remove(id).is_some();
        debug!(collection = %self.name, id = %id, existed, "delete");
        Ok(existed)
    }

    fn lock(&self, id: &DocId, holder: &LockId, timeout: Duration) -> Result<bool> {
        let _gate = self.write_gate.lock();
        let mut entry = self.records.get_mut(id).ok_or_else(|| self.not_found(id))?;
        let now = Timestamp::now();
        if lock_is_live(&entry.raw, now, timeout) {
            return Ok(false);
        }
        write_lock(&mut entry.raw, holder, now);
        debug!(collection = %self.name, id = %id, holder = %holder, "lock");
        Ok(true)
    }

    fn unlock(&self, id: &DocId, holder: &LockId) -> Result<bool> {
        let _gate = self.write_gate.lock();
        let Some(mut entry) = self.records.get_mut(id) else {
            return Ok(false);
        };
        if !held_by(&entry.raw, holder) {
            return Ok(false);
        }
        clear_lock(&mut entry.raw);
        debug!(collection = %self.name, id = %id, holder = %holder, "unlock");
        Ok(true)
    }

    fn lock_matching(
        &self,
        query: &JsonValue,
        holder: &LockId,
        timeout: Duration,
    ) -> Result<Vec<JsonValue>> {
        let query = Query::parse(query)?;
        self.count_query();
        let _gate = self.write_gate.lock();
        let now = Timestamp::now();
        let mut locked = Vec::new();
        for candidate in self.scan(&query) {
            if lock_is_live(&candidate.raw, now, timeout) {
                continue;
            }
            let Some(id) = DocId::of_record(&candidate.raw) else {
                continue;
            };
            let mut raw = candidate.raw;
            write_lock(&mut raw, holder, now);
            self.store(id, raw.clone(), Some(candidate.seq));
            locked.push(raw);
        }
        debug!(collection = %self.name, holder = %holder, count = locked.len(), "lock matching");
        Ok(locked)
    }

    fn unlock_all(&self, holder: &LockId) -> Result<usize> {
        let _gate = self.write_gate.lock();
        let mut released = 0;
        for mut entry in self.records.iter_mut() {
            if held_by(&entry.raw, holder) {
                clear_lock(&mut entry.raw);
                released += 1;
            }
        }
        debug!(collection = %self.name, holder = %holder, released, "unlock all");
        Ok(released)
    }

    fn get_indexes(&self) -> Result<Vec<IndexSpec>> {
        Ok(self.indexes.read().clone())
    }

    fn build_index(&self, index: &IndexSpec) -> Result<()> {
        let _gate = self.write_gate.lock();
        if index.unique {
            let mut seen = std::collections::HashSet::new();
            for entry in self.records.iter() {
                if let Some(key) = index_key(index, &entry.value().raw) {
                    if !seen.insert(serde_json::Value::Array(key).to_string()) {
                        return Err(Error::duplicate_key(
                            index.fields.clone(),
                            format!("existing records violate unique index '{}'", index.name),
                        )
                        .with_collection(&self.name));
                    }
                }
            }
        }
        let mut indexes = self.indexes.write();
        indexes.retain(|idx| idx.name != index.name);
        indexes.push(index.clone());
        debug!(collection = %self.name, index = %index.name, unique = index.unique, "build index");
        Ok(())
    }

    fn drop_index(&self, name: &str) -> Result<bool> {
        let mut indexes = self.indexes.write();
        let before = indexes.len();
        indexes.retain(|idx| idx.name != name);
        Ok(indexes.len() != before)
    }

    fn clear(&self) -> Result<()> {
        let _gate = self.write_gate.lock();
        self.records.clear();
        debug!(collection = %self.name, "clear");
        Ok(())
    }
}
