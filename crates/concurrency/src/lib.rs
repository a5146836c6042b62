//! Concurrency layer for Trellis
//!
//! This crate guards document writes with:
//! - Optimistic versioning: pre-mutation snapshots archived into a version
//!   collection, with a bounded retry on version-number races
//! - Pessimistic locking: per-record locks with soft expiry, and
//!   lock-retrieve-release over a query's matching set
//! - Freeze flag: best-effort single-patch freeze/unfreeze

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
pub mod freeze;
pub mod locking;
pub mod versioning;

pub use controller::{
    ConcurrencyConfig, ConcurrencyController, DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_ARCHIVE_RETRIES,
};
pub use freeze::{freeze_patch, is_frozen};
pub use locking::{LockOutcome, LockRelease, LockState};
pub use versioning::{version_index, version_of, INITIAL_VERSION};
