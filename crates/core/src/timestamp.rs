//! Millisecond-precision timestamp type
//!
//! Timestamps are stored as milliseconds since Unix epoch
//! (1970-01-01 00:00:00 UTC), the unit persisted in `_lastModified` and
//! `_lockedAt`.
//!
//! ```
//! use trellis_core::Timestamp;
//! use std::time::Duration;
//!
//! let t = Timestamp::from_millis(1_000);
//! assert_eq!(t.saturating_add(Duration::from_millis(500)).as_millis(), 1_500);
//! ```

use crate::json::JsonValue;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Millisecond-precision timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Unix epoch (1970-01-01 00:00:00 UTC)
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Create a timestamp for the current moment
    ///
    /// Returns epoch if the system clock is before Unix epoch.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as u64)
    }

    /// Create a timestamp from milliseconds since epoch
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    /// Get milliseconds since Unix epoch
    #[inline]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Read a timestamp persisted as a JSON number
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        value.as_u64().map(Timestamp)
    }

    /// Persisted JSON form
    pub fn to_json(&self) -> JsonValue {
        JsonValue::from(self.0)
    }

    /// Compute duration since an earlier timestamp
    ///
    /// Returns `None` if `earlier` is actually later than `self`.
    pub fn duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        self.0.checked_sub(earlier.0).map(Duration::from_millis)
    }

    /// Add a duration to this timestamp, saturating on overflow
    pub fn saturating_add(&self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.as_millis() as u64))
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::EPOCH
    }
}
