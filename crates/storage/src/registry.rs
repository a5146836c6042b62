//! Driver registry: storage drivers selected by URL scheme
//!
//! A collection names its backing store with a URL such as `memory://` or
//! `memory://tenant-a`. The registry maps the URL scheme to a factory, which
//! opens one driver per (URL, collection).
//!
//! ## Usage
//!
//! ```
//! use trellis_core::StorageDriver;
//! use trellis_storage::DriverRegistry;
//!
//! let registry = DriverRegistry::new();
//! let users = registry.open("memory://", "users").unwrap();
//! assert_eq!(users.collection_name(), "users");
//!
//! assert!(registry.open("nosuch://", "users").is_err());
//! ```

use crate::memory::MemoryDriver;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use trellis_core::{Error, Result, StorageDriver};

/// Parsed `scheme://location` driver URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverUrl {
    /// Scheme selecting the factory
    pub scheme: String,
    /// Everything after `://`; may be empty
    pub location: String,
}

impl DriverUrl {
    /// Parse a driver URL
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, location) = url
            .split_once("://")
            .ok_or_else(|| Error::bad_request(format!("invalid driver url '{}'", url)))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(Error::bad_request(format!(
                "invalid scheme in driver url '{}'",
                url
            )));
        }
        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            location: location.to_string(),
        })
    }
}

impl fmt::Display for DriverUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.location)
    }
}

/// Builds drivers for one URL scheme
pub trait DriverFactory: Send + Sync {
    /// Open the driver serving `collection` at `url`
    fn open(&self, url: &DriverUrl, collection: &str) -> Result<Arc<dyn StorageDriver>>;
}

/// Factory for `memory://` URLs
///
/// Opening the same (location, collection) twice returns the same store, so
/// the location acts as a namespace.
#[derive(Debug, Default)]
pub struct MemoryFactory {
    stores: DashMap<(String, String), Arc<MemoryDriver>>,
}

impl MemoryFactory {
    /// Create a factory with no stores
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete store for (location, collection), if opened
    pub fn store(&self, location: &str, collection: &str) -> Option<Arc<MemoryDriver>> {
        self.stores
            .get(&(location.to_string(), collection.to_string()))
            .map(|s| Arc::clone(s.value()))
    }
}

impl DriverFactory for MemoryFactory {
    fn open(&self, url: &DriverUrl, collection: &str) -> Result<Arc<dyn StorageDriver>> {
        let store: Arc<MemoryDriver> = self
            .stores
            .entry((url.location.clone(), collection.to_string()))
            .or_insert_with(|| Arc::new(MemoryDriver::new(collection)))
            .clone();
        Ok(store as Arc<dyn StorageDriver>)
    }
}

/// Registry of driver factories keyed by URL scheme
pub struct DriverRegistry {
    factories: HashMap<String, Arc<dyn DriverFactory>>,
    memory: Arc<MemoryFactory>,
}

impl DriverRegistry {
    /// Create a registry with the `memory` scheme registered
    pub fn new() -> Self {
        let memory = Arc::new(MemoryFactory::new());
        let mut factories: HashMap<String, Arc<dyn DriverFactory>> = HashMap::new();
        factories.insert("memory".to_string(), memory.clone());
        Self { factories, memory }
    }

    /// Register (or replace) the factory for a scheme
    pub fn register(&mut self, scheme: impl Into<String>, factory: Arc<dyn DriverFactory>) {
        self.factories
            .insert(scheme.into().to_ascii_lowercase(), factory);
    }

    /// Remove the factory for a scheme
    pub fn unregister(&mut self, scheme: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories.remove(scheme)
    }

    /// Whether a scheme has a factory
    pub fn is_registered(&self, scheme: &str) -> bool {
        self.factories.contains_key(scheme)
    }

    /// Registered schemes, sorted
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// The built-in memory factory
    pub fn memory(&self) -> &Arc<MemoryFactory> {
        &self.memory
    }

    /// Parse `url` and open the driver for `collection`
    pub fn open(&self, url: &str, collection: &str) -> Result<Arc<dyn StorageDriver>> {
        let parsed = DriverUrl::parse(url)?;
        let factory = self.factories.get(&parsed.scheme).ok_or_else(|| {
            Error::bad_request(format!("no storage driver for scheme '{}'", parsed.scheme))
        })?;
        debug!(url = %parsed, collection, "open driver");
        factory.open(&parsed, collection)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{DocId, JsonValue};

    struct FailingFactory;

    impl DriverFactory for FailingFactory {
        fn open(&self, url: &DriverUrl, _collection: &str) -> Result<Arc<dyn StorageDriver>> {
            Err(Error::storage(format!("cannot reach {}", url)))
        }
    }

    #[test]
    fn test_parse_url() {
        let url = DriverUrl::parse("Memory://tenant").unwrap();
        assert_eq!(url.scheme, "memory");
        assert_eq!(url.location, "tenant");
        assert!(DriverUrl::parse("no-scheme").is_err());
        assert!(DriverUrl::parse("://x").is_err());
    }

    #[test]
    fn test_memory_is_registered_by_default() {
        let registry = DriverRegistry::new();
        assert_eq!(registry.schemes(), vec!["memory".to_string()]);
    }

    #[test]
    fn test_unknown_scheme_is_bad_request() {
        let registry = DriverRegistry::new();
        let err = registry.open("mongodb://localhost", "users").err().unwrap();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn test_same_location_shares_store() {
        let registry = DriverRegistry::new();
        let a = registry.open("memory://ns", "users").unwrap();
        a.create(&JsonValue::from(serde_json::json!({"_id": "u1"})), None)
            .unwrap();
        let b = registry.open("memory://ns", "users").unwrap();
        assert!(b.get(&DocId::new("u1")).unwrap().is_some());

        let other = registry.open("memory://other", "users").unwrap();
        assert!(other.get(&DocId::new("u1")).unwrap().is_none());
        assert!(registry.memory().store("ns", "users").is_some());
    }

    #[test]
    fn test_custom_factory() {
        let mut registry = DriverRegistry::new();
        registry.register("broken", Arc::new(FailingFactory));
        assert!(registry.is_registered("broken"));
        let err = registry.open("broken://host", "users").err().unwrap();
        assert!(matches!(err, Error::Storage { .. }));
        assert!(registry.unregister("broken").is_some());
        assert!(!registry.is_registered("broken"));
    }
}
