//! Storage layer for Trellis
//!
//! This crate implements the reference storage backend with:
//! - MemoryDriver: DashMap-backed driver with unique indexes and record locks
//! - Query: dot-path query matcher (`$in`, `$ne`, `$exists`, array fan-out)
//! - DriverRegistry: URL-scheme driver selection (`memory://` built in)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod matcher;
pub mod memory;
pub mod registry;

pub use matcher::Query;
pub use memory::MemoryDriver;
pub use registry::{DriverFactory, DriverRegistry, DriverUrl, MemoryFactory};
