//! Document engine for Trellis
//!
//! This crate ties the lower layers together into the user-facing API:
//! - Registry: declared collections, driver factories, configuration
//! - Collection: schema, indexes, hooks, reads and lock-retrieve-release
//! - Document: change-tracked record with link accessors and lifecycle
//! - Batch: ordered document lists returned by multi-record reads
//! - Population: batched, cycle-safe resolution of links and back-links
//!
//! The engine is the only component that knows about:
//! - Schemas and link declarations
//! - Dirty tracking and minimal patches
//! - Identity maps across one population run

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod cache;
pub mod collection;
pub mod config;
pub mod dirty;
pub mod document;
pub mod populate;
pub mod registry;
pub mod schema;

pub use batch::Batch;
pub use cache::MemoryCache;
pub use collection::{
    AfterCreateHook, BeforeCreateHook, Collection, CollectionOptions, CreateOptions, Hooks,
    ReadOptions,
};
pub use config::{TrellisConfig, CONFIG_FILE_NAME};
pub use dirty::DirtyTree;
pub use document::{Document, FieldInput, FieldValue, Lifecycle, ToPath, WriteOptions};
pub use populate::{populate, PopulateOptions, PopulationStats};
pub use registry::Registry;
pub use schema::{
    is_reserved, FieldKind, FieldSpec, LinkDescriptor, Schema, SchemaValidator, Validator,
    RESERVED_FIELDS,
};
