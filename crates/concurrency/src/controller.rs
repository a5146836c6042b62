//! Concurrency controller
//!
//! The controller is the single entry point the document layer uses to guard
//! writes. It owns the configuration shared by every collection of a registry
//! and delegates to:
//!
//! | Concern | Module |
//! |---------|--------|
//! | Version archival before overwrites | [`versioning`](crate::versioning) |
//! | Record locks with soft expiry | [`locking`](crate::locking) |
//! | Freeze flag | [`freeze`](crate::freeze) |

use crate::freeze;
use crate::locking::{self, LockOutcome, LockRelease};
use crate::versioning;
use std::sync::Arc;
use std::time::Duration;
use trellis_core::{DocId, JsonValue, LockClaim, LockId, Result, StorageDriver};

/// Default lock validity window
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default bound on version-archive retries
pub const DEFAULT_MAX_ARCHIVE_RETRIES: u32 = 64;

/// Controller configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    /// Lock validity window for collections without their own timeout
    pub lock_timeout: Duration,
    /// Bound on version-archive retries (`None` = unbounded)
    pub max_archive_retries: Option<u32>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_archive_retries: Some(DEFAULT_MAX_ARCHIVE_RETRIES),
        }
    }
}

impl ConcurrencyConfig {
    /// Set the default lock timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the archive retry bound
    pub fn with_max_archive_retries(mut self, max: Option<u32>) -> Self {
        self.max_archive_retries = max;
        self
    }
}

/// Guards document writes with versioning and locking
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyController {
    config: ConcurrencyConfig,
}

impl ConcurrencyController {
    /// Create a controller
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Effective lock timeout: the collection's own, else the default
    pub fn lock_timeout(&self, collection_timeout: Option<Duration>) -> Duration {
        collection_timeout.unwrap_or(self.config.lock_timeout)
    }

    /// Archive a pre-mutation snapshot; returns the archived version number
    ///
    /// The caller then stamps the active record with `archived + 1`.
    pub fn archive(
        &self,
        versions: &dyn StorageDriver,
        collection: &str,
        snapshot: &JsonValue,
    ) -> Result<u64> {
        versioning::archive(
            versions,
            collection,
            snapshot,
            versioning::version_of(snapshot),
            self.config.max_archive_retries,
        )
    }

    /// Archived versions of a record, oldest first
    pub fn history(
        &self,
        versions: &dyn StorageDriver,
        collection: &str,
        id: &DocId,
    ) -> Result<Vec<JsonValue>> {
        versioning::history(versions, collection, id)
    }

    /// Take a record lock
    pub fn lock(
        &self,
        driver: &dyn StorageDriver,
        id: &DocId,
        timeout: Duration,
    ) -> Result<LockOutcome> {
        locking::lock(driver, id, timeout)
    }

    /// Release a record lock
    pub fn unlock(&self, driver: &dyn StorageDriver, id: &DocId, holder: &LockId) -> Result<bool> {
        locking::unlock(driver, id, holder)
    }

    /// Reserve a lock for a record not written yet
    pub fn reserve_lock(&self) -> LockClaim {
        locking::reserve_lock()
    }

    /// Lock the free records matching `query`
    pub fn lock_retrieve_release(
        &self,
        driver: Arc<dyn StorageDriver>,
        query: &JsonValue,
        timeout: Duration,
    ) -> Result<(Vec<JsonValue>, LockRelease)> {
        locking::lock_retrieve_release(driver, query, timeout)
    }

    /// Best-effort freeze flag update; `false` if the remote patch failed
    pub fn set_frozen(&self, driver: &dyn StorageDriver, id: &DocId, frozen: bool) -> bool {
        freeze::set_frozen(driver, id, frozen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_storage::MemoryDriver;

    #[test]
    fn test_default_config() {
        let config = ConcurrencyConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_millis(1000));
        assert_eq!(config.max_archive_retries, Some(64));
    }

    #[test]
    fn test_collection_timeout_wins() {
        let controller = ConcurrencyController::new(
            ConcurrencyConfig::default().with_lock_timeout(Duration::from_secs(5)),
        );
        assert_eq!(controller.lock_timeout(None), Duration::from_secs(5));
        assert_eq!(
            controller.lock_timeout(Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_archive_uses_snapshot_version() {
        let versions = MemoryDriver::new("versions");
        versions.build_index(&versioning::version_index()).unwrap();
        let controller = ConcurrencyController::default();
        let snapshot = JsonValue::from(json!({"_id": "a", "_version": 4}));
        assert_eq!(controller.archive(&versions, "c", &snapshot).unwrap(), 4);
        assert_eq!(controller.archive(&versions, "c", &snapshot).unwrap(), 5);
        assert_eq!(
            controller
                .history(&versions, "c", &DocId::new("a"))
                .unwrap()
                .len(),
            2
        );
    }
}
