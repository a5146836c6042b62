//! Trellis - document-store data-access layer
//!
//! Trellis sits between application code and a document store. It provides
//! change-tracked documents that persist as minimal patches, batched and
//! cycle-safe link population, and per-document concurrency control
//! (version archives, pessimistic locks, freezing).
//!
//! # Quick Start
//!
//! ```
//! use serde_json::json;
//! use trellis::{CollectionOptions, FieldSpec, PopulateOptions, ReadOptions, Registry, Schema};
//!
//! let registry = Registry::default();
//! let authors = registry
//!     .create_collection(CollectionOptions::new(
//!         "authors",
//!         Schema::new().field("name", FieldSpec::string()),
//!     ))
//!     .unwrap();
//! let books = registry
//!     .create_collection(CollectionOptions::new(
//!         "books",
//!         Schema::new()
//!             .field("title", FieldSpec::string())
//!             .field("author", FieldSpec::link("authors")),
//!     ))
//!     .unwrap();
//!
//! let ada = authors.create_document(json!({"name": "Ada"})).unwrap();
//! ada.save().unwrap();
//! let book = books.create_document(json!({"title": "Notes"})).unwrap();
//! book.set("author", &ada).unwrap();
//! book.save().unwrap();
//!
//! let loaded = books
//!     .get(book.id().clone(), &ReadOptions::new().populate(["author"]))
//!     .unwrap()
//!     .unwrap();
//! let author = loaded.get_link("author").unwrap().unwrap();
//! assert_eq!(author.id(), ada.id());
//! # let _ = PopulateOptions::new();
//! ```
//!
//! # Architecture
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `trellis-core` | JSON paths, ids, patches, fingerprints, errors, the driver trait |
//! | `trellis-storage` | in-memory driver, query matcher, driver registry |
//! | `trellis-concurrency` | version archive, locks, freeze flag |
//! | `trellis-engine` | registry, collections, documents, population |

pub use trellis_concurrency::{ConcurrencyConfig, ConcurrencyController};
pub use trellis_core::{
    DocId, DocRef, Error, ErrorCode, Fingerprint, IndexSpec, JsonPath, JsonValue, LockId, Patch,
    Result, StorageDriver,
};
pub use trellis_engine::*;
pub use trellis_storage::{DriverFactory, DriverRegistry, DriverUrl, MemoryDriver};
