//! Pessimistic locking
//!
//! A lock is the `(_lockedBy, _lockedAt)` pair on a stored record. It is valid
//! until `_lockedAt + timeout`; after that any caller may take it over. The
//! driver performs acquisition and release as conditional updates, so these
//! helpers never read-then-write.
//!
//! `lock_retrieve_release` locks every free record matching a query in one
//! driver call and hands back a [`LockRelease`] that clears them again.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use trellis_core::{
    DocId, JsonValue, LockClaim, LockId, Result, StorageDriver, Timestamp, LOCKED_AT_FIELD,
    LOCKED_BY_FIELD,
};

/// Lock state of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No holder
    Unlocked,
    /// Held (possibly expired)
    Held {
        /// Holder id
        holder: LockId,
        /// Acquisition time
        acquired_at: Timestamp,
    },
}

impl LockState {
    /// Read the lock pair of a raw record
    ///
    /// A holder that is not a lock id, or a missing timestamp, reads as
    /// unlocked.
    pub fn of_record(raw: &JsonValue) -> Self {
        let holder = raw
            .field(LOCKED_BY_FIELD)
            .and_then(|v| v.as_str())
            .and_then(LockId::parse);
        let acquired_at = raw.field(LOCKED_AT_FIELD).and_then(Timestamp::from_json);
        match (holder, acquired_at) {
            (Some(holder), Some(acquired_at)) => LockState::Held {
                holder,
                acquired_at,
            },
            _ => LockState::Unlocked,
        }
    }

    /// Whether the lock has run past `timeout` (unlocked counts as expired)
    pub fn is_expired(&self, now: Timestamp, timeout: Duration) -> bool {
        match self {
            LockState::Unlocked => true,
            LockState::Held { acquired_at, .. } => now
                .duration_since(*acquired_at)
                .map(|elapsed| elapsed >= timeout)
                .unwrap_or(false),
        }
    }

    /// Whether `holder` holds the lock
    pub fn is_held_by(&self, holder: &LockId) -> bool {
        matches!(self, LockState::Held { holder: h, .. } if h == holder)
    }
}

/// Result of a lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was taken; the id is needed to release it
    Acquired(LockId),
    /// Another live lock is held
    NotAcquired,
}

impl LockOutcome {
    /// Whether the lock was taken
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }

    /// Holder id, when acquired
    pub fn holder(&self) -> Option<LockId> {
        match self {
            LockOutcome::Acquired(id) => Some(*id),
            LockOutcome::NotAcquired => None,
        }
    }
}

/// Take the lock on a stored record
pub fn lock(driver: &dyn StorageDriver, id: &DocId, timeout: Duration) -> Result<LockOutcome> {
    let holder = LockId::new();
    let acquired = driver
        .lock(id, &holder, timeout)
        .map_err(|e| e.with_collection(driver.collection_name()))?;
    debug!(collection = driver.collection_name(), id = %id, acquired, "lock");
    Ok(if acquired {
        LockOutcome::Acquired(holder)
    } else {
        LockOutcome::NotAcquired
    })
}

/// Release a lock; `false` when `holder` does not hold it
pub fn unlock(driver: &dyn StorageDriver, id: &DocId, holder: &LockId) -> Result<bool> {
    driver
        .unlock(id, holder)
        .map_err(|e| e.with_collection(driver.collection_name()))
}

/// Reserve a lock for a record that does not exist upstream yet
///
/// The claim is written together with the record by `create`.
pub fn reserve_lock() -> LockClaim {
    LockClaim {
        holder: LockId::new(),
        acquired_at: Timestamp::now(),
    }
}

/// Lock every free record matching `query` and return them with a release
/// handle
pub fn lock_retrieve_release(
    driver: Arc<dyn StorageDriver>,
    query: &JsonValue,
    timeout: Duration,
) -> Result<(Vec<JsonValue>, LockRelease)> {
    let holder = LockId::new();
    let records = driver
        .lock_matching(query, &holder, timeout)
        .map_err(|e| e.with_collection(driver.collection_name()))?;
    let ids = records.iter().filter_map(DocId::of_record).collect();
    Ok((records, LockRelease::new(driver, holder, ids)))
}

/// Releases the locks taken by one `lock_retrieve_release`
///
/// `release` is idempotent. Dropping an unreleased handle logs a warning; the
/// locks then stay until they expire.
pub struct LockRelease {
    driver: Arc<dyn StorageDriver>,
    holder: LockId,
    pending: Mutex<Vec<DocId>>,
}

impl LockRelease {
    fn new(driver: Arc<dyn StorageDriver>, holder: LockId, ids: Vec<DocId>) -> Self {
        Self {
            driver,
            holder,
            pending: Mutex::new(ids),
        }
    }

    /// Holder id written on every locked record
    pub fn holder(&self) -> LockId {
        self.holder
    }

    /// Ids still locked by this handle
    pub fn pending(&self) -> Vec<DocId> {
        self.pending.lock().clone()
    }

    /// Whether every lock has been released
    pub fn is_released(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Release every lock still held; returns how many were cleared
    ///
    /// On a driver error the remaining ids stay pending so the call can be
    /// repeated.
    pub fn release(&self) -> Result<usize> {
        let mut pending = self.pending.lock();
        let mut released = 0;
        while let Some(id) = pending.last() {
            if self
                .driver
                .unlock(id, &self.holder)
                .map_err(|e| e.with_collection(self.driver.collection_name()))?
            {
                released += 1;
            }
            pending.pop();
        }
        debug!(
            collection = self.driver.collection_name(),
            holder = %self.holder,
            released,
            "released locks"
        );
        Ok(released)
    }
}

impl Drop for LockRelease {
    fn drop(&mut self) {
        let pending = self.pending.get_mut();
        if !pending.is_empty() {
            warn!(
                collection = self.driver.collection_name(),
                holder = %self.holder,
                count = pending.len(),
                "lock release dropped without releasing; locks stay until they expire"
            );
        }
    }
}

impl fmt::Debug for LockRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRelease")
            .field("collection", &self.driver.collection_name())
            .field("holder", &self.holder)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
