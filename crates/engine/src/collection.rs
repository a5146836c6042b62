//! Collections
//!
//! A [`Collection`] binds a schema, its unique indexes, optional hooks and
//! the concurrency settings to one storage driver. It creates documents and
//! performs the reads that return them:
//!
//! | Read | Driver call | Returns |
//! |------|-------------|---------|
//! | [`get`](Collection::get) | `get` | `Option<Document>` |
//! | [`get_unique`](Collection::get_unique) | `get_unique` | `Option<Document>` |
//! | [`multi_get`](Collection::multi_get) | `multi_get` | [`Batch`] |
//! | [`collect`](Collection::collect) | `collect` | [`Batch`] |
//! | [`find`](Collection::find) | `find` | [`Batch`] |
//! | [`lock_retrieve_release`](Collection::lock_retrieve_release) | `lock_matching` | [`Batch`] holding the locks |
//!
//! Every read accepts [`ReadOptions`]: link paths to populate after the
//! fetch, a shared identity map, and an error code to swallow.

use crate::batch::Batch;
use crate::cache::MemoryCache;
use crate::document::{Document, Lifecycle};
use crate::populate::{self, PopulateOptions};
use crate::registry::{Registry, RegistryInner};
use crate::schema::{FieldKind, LinkDescriptor, Schema, SchemaValidator, Validator};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;
use trellis_concurrency::ConcurrencyController;
use trellis_core::{
    DocId, Error, ErrorCode, Fingerprint, IndexSpec, JsonPath, JsonValue, Result, StorageDriver,
    ID_FIELD,
};

// =============================================================================
// Options
// =============================================================================

/// Runs on the raw record before a document is created
pub type BeforeCreateHook = Arc<dyn Fn(&mut JsonValue) + Send + Sync>;

/// Runs on every newly created document; may mutate it
pub type AfterCreateHook = Arc<dyn Fn(&Document) -> Result<()> + Send + Sync>;

/// Document creation hooks
#[derive(Clone, Default)]
pub struct Hooks {
    /// Called with the raw record before validation
    pub before_create_document: Option<BeforeCreateHook>,
    /// Called with the created document
    pub after_create_document: Option<AfterCreateHook>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_create_document", &self.before_create_document.is_some())
            .field("after_create_document", &self.after_create_document.is_some())
            .finish()
    }
}

/// Declaration of a collection
#[derive(Clone)]
pub struct CollectionOptions {
    /// Collection name
    pub name: String,
    /// Driver URL; the registry's default when `None`
    pub url: Option<String>,
    /// Record schema
    pub schema: Schema,
    /// Declared indexes
    pub indexes: Vec<IndexSpec>,
    /// Creation hooks
    pub hooks: Hooks,
    /// Archive a version before every overwrite
    pub versioning: bool,
    /// Allow record locks
    pub lockable: bool,
    /// Lock validity window; the registry's when `None`
    pub lock_timeout: Option<Duration>,
    /// Validator; [`SchemaValidator`] when `None`
    pub validator: Option<Arc<dyn Validator>>,
    /// Pre-built driver, used instead of opening `url`
    pub driver: Option<Arc<dyn StorageDriver>>,
}

impl CollectionOptions {
    /// Plain collection with the given schema
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            url: None,
            schema,
            indexes: Vec::new(),
            hooks: Hooks::default(),
            versioning: false,
            lockable: false,
            lock_timeout: None,
            validator: None,
            driver: None,
        }
    }

    /// Driver URL
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Declare an index
    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    /// Enable versioning
    pub fn versioned(mut self) -> Self {
        self.versioning = true;
        self
    }

    /// Enable record locks
    pub fn lockable(mut self) -> Self {
        self.lockable = true;
        self
    }

    /// Collection-specific lock timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Custom validator
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Use this driver instead of opening one
    pub fn driver(mut self, driver: Arc<dyn StorageDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Hook run before validation of new records
    pub fn before_create(mut self, hook: impl Fn(&mut JsonValue) + Send + Sync + 'static) -> Self {
        self.hooks.before_create_document = Some(Arc::new(hook));
        self
    }

    /// Hook run on every created document
    pub fn after_create(
        mut self,
        hook: impl Fn(&Document) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.after_create_document = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for CollectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionOptions")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("indexes", &self.indexes)
            .field("hooks", &self.hooks)
            .field("versioning", &self.versioning)
            .field("lockable", &self.lockable)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

/// Options for [`Collection::create_document_with`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Skip the validator
    pub skip_validation: bool,
    /// The record already exists in storage
    pub from_upstream: bool,
}

/// Options shared by every read
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Link paths to populate on the returned documents
    pub populate: Vec<String>,
    /// Deep paths and identity map for the population
    pub populate_options: PopulateOptions,
    /// Error code swallowed instead of returned
    pub ignore: Option<ErrorCode>,
}

impl ReadOptions {
    /// No population, nothing ignored
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate these link paths
    pub fn populate<S: Into<String>>(mut self, paths: impl IntoIterator<Item = S>) -> Self {
        self.populate.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Deep-populate documents of `collection`
    pub fn deep<S: Into<String>>(
        mut self,
        collection: impl Into<String>,
        paths: impl IntoIterator<Item = S>,
    ) -> Self {
        self.populate_options = self.populate_options.deep(collection, paths);
        self
    }

    /// Share an identity map
    pub fn cache(mut self, cache: MemoryCache) -> Self {
        self.populate_options = self.populate_options.cache(cache);
        self
    }

    /// Swallow errors with this code
    pub fn ignore(mut self, code: ErrorCode) -> Self {
        self.ignore = Some(code);
        self
    }

    fn paths(&self) -> Vec<&str> {
        self.populate.iter().map(String::as_str).collect()
    }

    fn swallow<T>(&self, result: Result<T>, fallback: impl FnOnce() -> T) -> Result<T> {
        match result {
            Err(e) if Some(e.code()) == self.ignore => {
                debug!(target: "trellis::collection", error = %e, "ignored read error");
                Ok(fallback())
            }
            other => other,
        }
    }
}

// =============================================================================
// Collection
// =============================================================================

/// A declared collection
pub struct Collection {
    name: String,
    schema: Schema,
    indexes: Vec<IndexSpec>,
    hooks: Hooks,
    versioning: bool,
    lockable: bool,
    lock_timeout: Duration,
    validator: Arc<dyn Validator>,
    driver: Arc<dyn StorageDriver>,
    versions: Option<Arc<dyn StorageDriver>>,
    controller: ConcurrencyController,
    registry: Weak<RegistryInner>,
}

impl Collection {
    pub(crate) fn new(
        options: CollectionOptions,
        driver: Arc<dyn StorageDriver>,
        versions: Option<Arc<dyn StorageDriver>>,
        controller: ConcurrencyController,
        registry: Weak<RegistryInner>,
    ) -> Self {
        Self {
            lock_timeout: controller.lock_timeout(options.lock_timeout),
            validator: options
                .validator
                .unwrap_or_else(|| Arc::new(SchemaValidator)),
            name: options.name,
            schema: options.schema,
            indexes: options.indexes,
            hooks: options.hooks,
            versioning: options.versioning,
            lockable: options.lockable,
            driver,
            versions,
            controller,
            registry,
        }
    }

    /// Collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record schema
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Declared indexes
    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Whether overwrites archive a version
    pub fn is_versioned(&self) -> bool {
        self.versioning
    }

    /// Whether records can be locked
    pub fn is_lockable(&self) -> bool {
        self.lockable
    }

    /// Effective lock validity window
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Storage driver
    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    pub(crate) fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    /// Owning registry
    pub fn registry(&self) -> Result<Registry> {
        self.registry
            .upgrade()
            .map(Registry::from_inner)
            .ok_or_else(|| {
                Error::internal(format!(
                    "registry of collection '{}' was dropped",
                    self.name
                ))
            })
    }

    /// Validate and sanitize a record
    pub fn validate(&self, raw: &JsonValue) -> Result<JsonValue> {
        self.validator
            .validate(&self.schema, raw)
            .map_err(|message| Error::validation(&self.name, message))
    }

    /// Link kind of a path
    pub fn link_descriptor(&self, path: &JsonPath) -> Option<LinkDescriptor> {
        self.schema.link_descriptor(path)
    }

    /// Field kind declared at a path
    pub fn field_kind(&self, path: &JsonPath) -> Option<&FieldKind> {
        self.validator.sub_schema(&self.schema, path)
    }

    /// Fingerprint of a partial record against this collection's indexes
    pub fn fingerprint(&self, partial: impl Into<JsonValue>) -> Fingerprint {
        Fingerprint::new(&partial.into(), &self.indexes)
    }

    pub(crate) fn archive(&self, snapshot: &JsonValue) -> Result<u64> {
        let versions = self.versions.as_ref().ok_or_else(|| {
            Error::internal(format!(
                "collection '{}' has no version collection",
                self.name
            ))
        })?;
        self.controller
            .archive(versions.as_ref(), &self.name, snapshot)
            .map_err(|e| e.with_collection(&self.name))
    }

    fn annotate(&self, error: Error) -> Error {
        error.with_collection(&self.name)
    }

    // -------------------------------------------------------------------------
    // Creation
    // -------------------------------------------------------------------------

    /// New, never-saved document
    pub fn create_document(self: &Arc<Self>, raw: impl Into<JsonValue>) -> Result<Document> {
        self.create_document_with(raw, &CreateOptions::default())
    }

    /// Document from a raw record
    ///
    /// Runs the before-create hook, assigns an id when missing, validates
    /// (unless skipped), then runs the after-create hook.
    pub fn create_document_with(
        self: &Arc<Self>,
        raw: impl Into<JsonValue>,
        options: &CreateOptions,
    ) -> Result<Document> {
        let mut raw = raw.into();
        if !raw.is_object() {
            return Err(Error::bad_request(format!(
                "a document of '{}' must be an object",
                self.name
            )));
        }
        if let Some(hook) = &self.hooks.before_create_document {
            hook(&mut raw);
        }
        if !options.from_upstream {
            raw.validate_depth()?;
        }
        if let Some(obj) = raw.as_object_mut() {
            obj.entry(ID_FIELD)
                .or_insert_with(|| DocId::generate().to_json().into_inner());
        }
        let raw = if options.skip_validation {
            raw
        } else {
            self.validate(&raw)?
        };
        let id = DocId::of_record(&raw).ok_or_else(|| {
            Error::validation(&self.name, format!("field '{}' must be a string", ID_FIELD))
        })?;

        let lifecycle = if options.from_upstream {
            Lifecycle::Loaded
        } else {
            Lifecycle::Detached
        };
        let document = Document::with_id(Arc::clone(self), id, raw, lifecycle);
        if let Some(hook) = &self.hooks.after_create_document {
            hook(&document)?;
        }
        Ok(document)
    }

    fn wrap(self: &Arc<Self>, raw: JsonValue, cache: Option<&MemoryCache>) -> Result<Document> {
        match cache {
            Some(cache) => {
                let id = DocId::of_record(&raw).ok_or_else(|| {
                    Error::internal(format!("record without '{}' in '{}'", ID_FIELD, self.name))
                })?;
                let make_id = id.clone();
                Ok(cache.get_or_insert_with(&self.name, &id, || {
                    Document::with_id(Arc::clone(self), make_id, raw, Lifecycle::Loaded)
                }))
            }
            None => Document::from_record(Arc::clone(self), raw),
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn check_populate(&self, options: &ReadOptions) -> Result<()> {
        if options.populate.is_empty() {
            return Ok(());
        }
        populate::check(self, &options.paths(), &options.populate_options)
    }

    fn read_one(
        self: &Arc<Self>,
        fetched: Result<Option<JsonValue>>,
        options: &ReadOptions,
    ) -> Result<Option<Document>> {
        let result = fetched.map_err(|e| self.annotate(e)).and_then(|raw| {
            let Some(raw) = raw else {
                return Ok(None);
            };
            let document = self.wrap(raw, options.populate_options.cache.as_ref())?;
            if !options.populate.is_empty() {
                document.populate(&options.paths(), &options.populate_options)?;
            }
            Ok(Some(document))
        });
        options.swallow(result, || None)
    }

    fn read_many(
        self: &Arc<Self>,
        fetched: Result<Vec<JsonValue>>,
        options: &ReadOptions,
        finish: impl FnOnce(&Batch),
    ) -> Result<Batch> {
        let result = fetched.map_err(|e| self.annotate(e)).and_then(|records| {
            let documents = records
                .into_iter()
                .map(|raw| self.wrap(raw, options.populate_options.cache.as_ref()))
                .collect::<Result<Vec<_>>>()?;
            let mut batch = Batch::new(documents);
            finish(&batch);
            if !options.populate.is_empty() {
                let stats = batch.populate(&options.paths(), &options.populate_options)?;
                batch = batch.with_stats(stats);
            }
            Ok(batch)
        });
        options.swallow(result, Batch::default)
    }

    /// Record by id
    pub fn get(self: &Arc<Self>, id: impl Into<DocId>, options: &ReadOptions) -> Result<Option<Document>> {
        self.check_populate(options)?;
        let id = id.into();
        self.read_one(self.driver.get(&id), options)
    }

    /// Record matching a fingerprint that covers a unique index
    pub fn get_unique(
        self: &Arc<Self>,
        fingerprint: &Fingerprint,
        options: &ReadOptions,
    ) -> Result<Option<Document>> {
        if !fingerprint.is_unique() {
            return Err(Error::bad_request(format!(
                "fingerprint does not cover a unique index of '{}'",
                self.name
            )));
        }
        self.check_populate(options)?;
        self.read_one(self.driver.get_unique(fingerprint), options)
    }

    /// Records by id; missing ids are skipped
    pub fn multi_get(self: &Arc<Self>, ids: &[DocId], options: &ReadOptions) -> Result<Batch> {
        self.check_populate(options)?;
        self.read_many(self.driver.multi_get(ids), options, |_| {})
    }

    /// Records matching a fingerprint
    pub fn collect(self: &Arc<Self>, fingerprint: &Fingerprint, options: &ReadOptions) -> Result<Batch> {
        self.check_populate(options)?;
        self.read_many(self.driver.collect(fingerprint), options, |_| {})
    }

    /// Records matching a query
    pub fn find(self: &Arc<Self>, query: impl Into<JsonValue>, options: &ReadOptions) -> Result<Batch> {
        self.check_populate(options)?;
        let query = query.into();
        self.read_many(self.driver.find(&query), options, |_| {})
    }

    /// Lock every free record matching `query` and return them
    ///
    /// The batch releases the locks through [`Batch::release_locks`].
    pub fn lock_retrieve_release(
        self: &Arc<Self>,
        query: impl Into<JsonValue>,
        options: &ReadOptions,
    ) -> Result<Batch> {
        if !self.lockable {
            return Err(Error::bad_request(format!(
                "collection '{}' is not lockable",
                self.name
            )));
        }
        self.check_populate(options)?;
        let query = query.into();
        let (records, release) = self
            .controller
            .lock_retrieve_release(Arc::clone(&self.driver), &query, self.lock_timeout)
            .map_err(|e| self.annotate(e))?;
        let holder = release.holder();
        let read = self.read_many(Ok(records), options, |batch| {
            for document in batch {
                document.adopt_lock(holder);
            }
        });
        match read {
            Ok(batch) => Ok(batch.with_release(release)),
            Err(e) => {
                if let Err(release_error) = release.release() {
                    debug!(target: "trellis::collection", error = %release_error, "release after failed read");
                }
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Build every declared index
    pub fn build_indexes(&self) -> Result<()> {
        for index in &self.indexes {
            self.driver
                .build_index(index)
                .map_err(|e| self.annotate(e))?;
        }
        debug!(
            target: "trellis::collection",
            collection = %self.name,
            indexes = self.indexes.len(),
            "Built indexes"
        );
        Ok(())
    }

    /// Archived versions of a record, oldest first
    pub fn versions(&self, id: &DocId) -> Result<Vec<JsonValue>> {
        let versions = match (&self.versions, self.versioning) {
            (Some(versions), true) => versions,
            _ => {
                return Err(Error::bad_request(format!(
                    "collection '{}' is not versioned",
                    self.name
                )))
            }
        };
        self.controller
            .history(versions.as_ref(), &self.name, id)
            .map_err(|e| self.annotate(e))
    }

    /// Remove every record
    pub fn clear(&self) -> Result<()> {
        self.driver.clear().map_err(|e| self.annotate(e))
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("indexes", &self.indexes)
            .field("versioning", &self.versioning)
            .field("lockable", &self.lockable)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}
