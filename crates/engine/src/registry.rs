//! Collection registry
//!
//! The [`Registry`] is the entry point: it owns the configuration, the driver
//! factories, the concurrency controller and every declared collection.
//! Several registries can coexist in one process; nothing is global.
//!
//! The version collection shared by every versioned collection is opened,
//! with its unique `active_version` index, when the first versioned
//! collection is declared.

use crate::collection::{Collection, CollectionOptions};
use crate::config::{TrellisConfig, CONFIG_FILE_NAME};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use trellis_concurrency::{version_index, ConcurrencyController};
use trellis_core::{Error, Result, StorageDriver};
use trellis_storage::{DriverFactory, DriverRegistry, MemoryDriver};

pub(crate) struct RegistryInner {
    config: TrellisConfig,
    drivers: RwLock<DriverRegistry>,
    controller: ConcurrencyController,
    collections: RwLock<BTreeMap<String, Arc<Collection>>>,
    versions: Mutex<Option<Arc<dyn StorageDriver>>>,
}

/// Declared collections and their shared services
///
/// Cheap to clone; clones share the same collections.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Registry with the given configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn new(config: TrellisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// Registry configured from `trellis.toml` in `dir`
    ///
    /// The directory and a default config file are created when missing.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::Config(format!("failed to create '{}': {}", dir.display(), e))
        })?;
        let config_path = dir.join(CONFIG_FILE_NAME);
        TrellisConfig::write_default_if_missing(&config_path)?;
        Self::new(TrellisConfig::from_file(&config_path)?)
    }

    fn build(config: TrellisConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                controller: ConcurrencyController::new(config.concurrency()),
                config,
                drivers: RwLock::new(DriverRegistry::new()),
                collections: RwLock::new(BTreeMap::new()),
                versions: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    /// Active configuration
    pub fn config(&self) -> &TrellisConfig {
        &self.inner.config
    }

    /// Shared concurrency controller
    pub fn controller(&self) -> &ConcurrencyController {
        &self.inner.controller
    }

    /// Register a driver factory for a URL scheme
    pub fn register_driver(&self, scheme: impl Into<String>, factory: Arc<dyn DriverFactory>) {
        self.inner.drivers.write().register(scheme, factory);
    }

    /// In-memory store opened for `memory://<location>` and a collection
    pub fn memory_store(&self, location: &str, collection: &str) -> Option<Arc<MemoryDriver>> {
        self.inner.drivers.read().memory().store(location, collection)
    }

    fn open_driver(&self, url: &str, collection: &str) -> Result<Arc<dyn StorageDriver>> {
        self.inner.drivers.read().open(url, collection)
    }

    fn ensure_versions(&self) -> Result<Arc<dyn StorageDriver>> {
        let mut versions = self.inner.versions.lock();
        if let Some(driver) = versions.as_ref() {
            return Ok(Arc::clone(driver));
        }
        let name = &self.inner.config.versions_collection;
        let driver = self.open_driver(&self.inner.config.default_url, name)?;
        driver
            .build_index(&version_index())
            .map_err(|e| e.with_collection(name))?;
        info!(target: "trellis::registry", collection = %name, "Opened version collection");
        *versions = Some(Arc::clone(&driver));
        Ok(driver)
    }

    /// Declare a collection
    ///
    /// Opens its driver (unless one is supplied) and builds its declared
    /// indexes.
    ///
    /// # Errors
    ///
    /// `BadRequest` for an empty, reserved or already declared name, or an
    /// unknown driver scheme; driver errors from index creation.
    pub fn create_collection(&self, options: CollectionOptions) -> Result<Arc<Collection>> {
        let name = options.name.clone();
        if name.is_empty() {
            return Err(Error::bad_request("collection name must not be empty"));
        }
        if name == self.inner.config.versions_collection {
            return Err(Error::bad_request(format!(
                "'{}' is reserved for version history",
                name
            )));
        }

        let mut collections = self.inner.collections.write();
        if collections.contains_key(&name) {
            return Err(Error::bad_request(format!(
                "collection '{}' is already declared",
                name
            )));
        }

        let driver = match options.driver.clone() {
            Some(driver) => driver,
            None => {
                let url = options
                    .url
                    .clone()
                    .unwrap_or_else(|| self.inner.config.default_url.clone());
                self.open_driver(&url, &name)?
            }
        };
        let versions = if options.versioning {
            Some(self.ensure_versions()?)
        } else {
            None
        };
        for index in &options.indexes {
            driver
                .build_index(index)
                .map_err(|e| e.with_collection(&name))?;
        }

        let collection = Arc::new(Collection::new(
            options,
            driver,
            versions,
            self.inner.controller.clone(),
            Arc::downgrade(&self.inner),
        ));
        collections.insert(name.clone(), Arc::clone(&collection));
        info!(
            target: "trellis::registry",
            collection = %name,
            versioned = collection.is_versioned(),
            lockable = collection.is_lockable(),
            "Declared collection"
        );
        Ok(collection)
    }

    /// Declared collection by name
    ///
    /// # Errors
    ///
    /// `BadRequest` if no such collection was declared.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.inner
            .collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::bad_request(format!("collection '{}' is not declared", name)))
    }

    /// Whether a collection is declared
    pub fn has_collection(&self, name: &str) -> bool {
        self.inner.collections.read().contains_key(name)
    }

    /// Every declared collection, by name
    pub fn collections(&self) -> Vec<Arc<Collection>> {
        self.inner.collections.read().values().cloned().collect()
    }

    /// Shared version collection, once a versioned collection exists
    pub fn versions_driver(&self) -> Option<Arc<dyn StorageDriver>> {
        self.inner.versions.lock().clone()
    }

    /// Forget every collection
    ///
    /// Documents already handed out keep their collection alive but can no
    /// longer populate links.
    pub fn teardown(&self) {
        let dropped = {
            let mut collections = self.inner.collections.write();
            let count = collections.len();
            collections.clear();
            count
        };
        self.inner.versions.lock().take();
        info!(target: "trellis::registry", collections = dropped, "Registry torn down");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::build(TrellisConfig::default())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.inner.config)
            .field(
                "collections",
                &self.inner.collections.read().keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use tempfile::TempDir;
    use trellis_core::{ErrorCode, IndexSpec};
    use trellis_storage::DriverUrl;

    #[test]
    fn test_create_and_lookup() {
        let registry = Registry::default();
        registry
            .create_collection(CollectionOptions::new("books", Schema::any()))
            .unwrap();
        assert!(registry.has_collection("books"));
        assert_eq!(registry.collection("books").unwrap().name(), "books");
        assert_eq!(registry.collections().len(), 1);
    }

    #[test]
    fn test_undeclared_collection_is_bad_request() {
        let registry = Registry::default();
        let err = registry.collection("nope").unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[test]
    fn test_duplicate_and_reserved_names() {
        let registry = Registry::default();
        registry
            .create_collection(CollectionOptions::new("books", Schema::any()))
            .unwrap();
        for name in ["books", "versions", ""] {
            let err = registry
                .create_collection(CollectionOptions::new(name, Schema::any()))
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::BadRequest, "{:?}", name);
        }
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = Registry::default();
        let err = registry
            .create_collection(CollectionOptions::new("books", Schema::any()).url("pg://db"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[test]
    fn test_memory_url_location_is_shared() {
        let registry = Registry::default();
        let books = registry
            .create_collection(
                CollectionOptions::new("books", Schema::any()).url("memory://shelf"),
            )
            .unwrap();
        books
            .create_document(serde_json::json!({"_id": "b1"}))
            .unwrap()
            .save()
            .unwrap();
        let store = registry.memory_store("shelf", "books").unwrap();
        assert_eq!(store.len(), 1);
        assert!(registry.memory_store("other", "books").is_none());
    }

    #[test]
    fn test_version_collection_created_lazily() {
        let registry = Registry::default();
        registry
            .create_collection(CollectionOptions::new("plain", Schema::any()))
            .unwrap();
        assert!(registry.versions_driver().is_none());

        registry
            .create_collection(CollectionOptions::new("books", Schema::any()).versioned())
            .unwrap();
        let versions = registry.versions_driver().unwrap();
        assert_eq!(versions.collection_name(), "versions");
        let indexes = versions.get_indexes().unwrap();
        assert!(indexes.iter().any(|i| i.name == "active_version" && i.unique));
    }

    #[test]
    fn test_index_build_failure_is_annotated() {
        let registry = Registry::default();
        let driver = Arc::new(MemoryDriver::new("books"));
        for id in ["a", "b"] {
            driver
                .create(
                    &serde_json::json!({"_id": id, "isbn": "same"}).into(),
                    None,
                )
                .unwrap();
        }
        let err = registry
            .create_collection(
                CollectionOptions::new("books", Schema::any())
                    .index(IndexSpec::unique(["isbn"]))
                    .driver(driver),
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateKey);
        assert_eq!(err.collection(), Some("books"));
        assert!(!registry.has_collection("books"));
    }

    #[test]
    fn test_custom_driver_factory() {
        struct Fixed(Arc<MemoryDriver>);
        impl DriverFactory for Fixed {
            fn open(&self, _url: &DriverUrl, _collection: &str) -> Result<Arc<dyn StorageDriver>> {
                Ok(self.0.clone())
            }
        }

        let registry = Registry::default();
        let store = Arc::new(MemoryDriver::new("books"));
        registry.register_driver("fixed", Arc::new(Fixed(store.clone())));
        let books = registry
            .create_collection(CollectionOptions::new("books", Schema::any()).url("fixed://x"))
            .unwrap();
        books
            .create_document(serde_json::json!({}))
            .unwrap()
            .save()
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_teardown() {
        let registry = Registry::default();
        let books = registry
            .create_collection(CollectionOptions::new("books", Schema::any()).versioned())
            .unwrap();
        registry.teardown();
        assert!(registry.collections().is_empty());
        assert!(registry.versions_driver().is_none());
        assert_eq!(books.name(), "books");
    }

    #[test]
    fn test_open_writes_default_config() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path().join("data")).unwrap();
        assert_eq!(registry.config(), &TrellisConfig::default());
        assert!(dir.path().join("data").join(CONFIG_FILE_NAME).exists());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TrellisConfig {
            lock_timeout_ms: 0,
            ..TrellisConfig::default()
        };
        assert_eq!(
            Registry::new(config).unwrap_err().code(),
            ErrorCode::Config
        );
    }
}
