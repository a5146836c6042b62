//! Change-tracked documents
//!
//! A [`Document`] is a shared handle over one record of a collection. Clones
//! point at the same instance, which is what the population engine relies on
//! for its identity guarantee: one stored record, one in-memory instance per
//! session.
//!
//! ## Change tracking
//!
//! Every write goes through [`Document::set`] or [`Document::unset`], which
//! record the touched path in a [`DirtyTree`]. [`Document::commit`] sends
//! exactly those paths as a [`Patch`]; [`Document::save`] replaces the whole
//! record. Unsetting an array element marks the whole array, since removal
//! shifts the following elements.
//!
//! ## Lifecycle
//!
//! ```text
//! Detached --save/commit--> Saved --set/unset--> Saved (dirty) --commit--> Saved
//! Loaded   --save---------> Saved
//! Loaded   --commit-------> Saved   (dirty)
//! Loaded   --commit-------> Loaded  (clean; no write)
//! any      --delete-------> Deleted (terminal)
//! ```
//!
//! In a versioned collection the first write after load keeps a snapshot of
//! the stored record; persisting archives it and stamps the record with the
//! next version number.
//!
//! ## Links
//!
//! Link fields store `{_id}` references. Assigning a [`Document`] to a link
//! stores its reference and remembers the instance, so reading the field back
//! yields the same document without a fetch. Population fills the same map.

use crate::batch::Batch;
use crate::collection::Collection;
use crate::dirty::DirtyTree;
use crate::populate::{self, PopulateOptions, PopulationStats};
use crate::schema::{is_reserved, LinkDescriptor};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use trellis_concurrency::versioning::stamp_version;
use trellis_concurrency::{freeze_patch, is_frozen, version_of, LockOutcome, LockState};
use trellis_core::{
    delete_at_path, expand_wildcards, get_at_path, set_at_path, DocId, DocRef, Error, ErrorCode,
    JsonPath, JsonValue, LimitError, LockClaim, LockId, Patch, PathSegment, Result, Timestamp,
    COLLECTION_FIELD, ID_FIELD, LAST_MODIFIED_FIELD, MAX_NESTING_DEPTH, VERSION_FIELD,
};

// =============================================================================
// Paths
// =============================================================================

/// Anything usable as a document path
pub trait ToPath {
    /// Parse into a validated path
    fn to_path(&self) -> Result<JsonPath>;
}

impl ToPath for str {
    fn to_path(&self) -> Result<JsonPath> {
        let path: JsonPath = self.parse()?;
        path.validate()?;
        Ok(path)
    }
}

impl ToPath for String {
    fn to_path(&self) -> Result<JsonPath> {
        self.as_str().to_path()
    }
}

impl ToPath for JsonPath {
    fn to_path(&self) -> Result<JsonPath> {
        self.validate()?;
        Ok(self.clone())
    }
}

// =============================================================================
// Public value types
// =============================================================================

/// Where a document stands relative to its stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Never persisted
    Detached,
    /// Read from storage, or asserted to exist there
    Loaded,
    /// Persisted by this instance
    Saved,
    /// Deleted; every further operation is rejected
    Deleted,
}

/// Result of reading a field
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Nothing at the path
    Missing,
    /// Plain value, or an unresolved link reference
    Value(JsonValue),
    /// Resolved link
    Link(Document),
    /// Resolved multi-link or back-link
    Links(Batch),
}

impl FieldValue {
    /// Whether nothing is stored at the path
    pub fn is_missing(&self) -> bool {
        matches!(self, FieldValue::Missing)
    }

    /// Plain value, if any
    pub fn as_value(&self) -> Option<&JsonValue> {
        match self {
            FieldValue::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Resolved link, if any
    pub fn into_link(self) -> Option<Document> {
        match self {
            FieldValue::Link(doc) => Some(doc),
            _ => None,
        }
    }

    /// Resolved documents, if any
    pub fn into_links(self) -> Option<Batch> {
        match self {
            FieldValue::Links(batch) => Some(batch),
            _ => None,
        }
    }
}

/// Value written by [`Document::set`]
#[derive(Debug, Clone)]
pub enum FieldInput {
    /// Plain JSON
    Value(JsonValue),
    /// Link target
    Document(Document),
    /// Multi-link targets, in order
    Documents(Vec<Document>),
}

impl From<JsonValue> for FieldInput {
    fn from(value: JsonValue) -> Self {
        FieldInput::Value(value)
    }
}

impl From<serde_json::Value> for FieldInput {
    fn from(value: serde_json::Value) -> Self {
        FieldInput::Value(value.into())
    }
}

impl From<&str> for FieldInput {
    fn from(value: &str) -> Self {
        FieldInput::Value(value.into())
    }
}

impl From<String> for FieldInput {
    fn from(value: String) -> Self {
        FieldInput::Value(value.into())
    }
}

impl From<bool> for FieldInput {
    fn from(value: bool) -> Self {
        FieldInput::Value(value.into())
    }
}

impl From<i64> for FieldInput {
    fn from(value: i64) -> Self {
        FieldInput::Value(value.into())
    }
}

impl From<i32> for FieldInput {
    fn from(value: i32) -> Self {
        FieldInput::Value(value.into())
    }
}

impl From<f64> for FieldInput {
    fn from(value: f64) -> Self {
        FieldInput::Value(value.into())
    }
}

impl From<Document> for FieldInput {
    fn from(doc: Document) -> Self {
        FieldInput::Document(doc)
    }
}

impl From<&Document> for FieldInput {
    fn from(doc: &Document) -> Self {
        FieldInput::Document(doc.clone())
    }
}

impl From<Vec<Document>> for FieldInput {
    fn from(docs: Vec<Document>) -> Self {
        FieldInput::Documents(docs)
    }
}

impl From<&Batch> for FieldInput {
    fn from(batch: &Batch) -> Self {
        FieldInput::Documents(batch.documents().to_vec())
    }
}

/// Options for [`Document::save_with`] and [`Document::commit_with`]
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Error code swallowed instead of returned
    pub ignore: Option<ErrorCode>,
}

impl WriteOptions {
    /// Swallow errors with this code
    pub fn ignore(code: ErrorCode) -> Self {
        Self { ignore: Some(code) }
    }

    pub(crate) fn filter(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if Some(e.code()) == self.ignore => {
                debug!(target: "trellis::document", error = %e, "ignored write error");
                Ok(())
            }
            other => other,
        }
    }
}

// =============================================================================
// Internal state
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ResolvedKey {
    Link { collection: String, id: DocId },
    BackLink(JsonPath),
}

#[derive(Debug, Clone)]
pub(crate) enum Resolved {
    Single(Document),
    Many(Batch),
}

/// Key of a raw link shape; the reference's own collection wins over the
/// schema's
fn link_key(value: &serde_json::Value, fixed: Option<&str>) -> Option<ResolvedKey> {
    let obj = value.as_object()?;
    let id = obj.get(ID_FIELD)?.as_str()?;
    let collection = obj
        .get(COLLECTION_FIELD)
        .and_then(|c| c.as_str())
        .or(fixed)?;
    Some(ResolvedKey::Link {
        collection: collection.to_string(),
        id: DocId::new(id),
    })
}

fn patch_of(raw: &JsonValue, dirty: &DirtyTree) -> Patch {
    dirty
        .paths()
        .into_iter()
        .fold(Patch::new(), |patch, path| match get_at_path(raw, &path) {
            Some(value) => patch.set(path, value.clone()),
            None => patch.unset(path),
        })
}

fn claim_expired(claim: &LockClaim, timeout: Duration) -> bool {
    LockState::Held {
        holder: claim.holder,
        acquired_at: claim.acquired_at,
    }
    .is_expired(Timestamp::now(), timeout)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persist {
    Save,
    Commit,
}

struct DocumentState {
    raw: JsonValue,
    lifecycle: Lifecycle,
    dirty: DirtyTree,
    snapshot: Option<JsonValue>,
    resolved: HashMap<ResolvedKey, Resolved>,
    populated: BTreeSet<JsonPath>,
    lock: Option<LockClaim>,
}

impl DocumentState {
    fn resolved_link(&self, value: &serde_json::Value, fixed: Option<&str>) -> Option<Document> {
        match self.resolved.get(&link_key(value, fixed)?) {
            Some(Resolved::Single(doc)) => Some(doc.clone()),
            _ => None,
        }
    }

    fn field_value(&self, path: &JsonPath, descriptor: Option<&LinkDescriptor>) -> FieldValue {
        if let Some(LinkDescriptor::BackLink { .. }) = descriptor {
            return match self.resolved.get(&ResolvedKey::BackLink(path.clone())) {
                Some(Resolved::Many(batch)) => FieldValue::Links(batch.clone()),
                _ => FieldValue::Missing,
            };
        }

        let Some(raw) = get_at_path(&self.raw, path) else {
            return FieldValue::Missing;
        };
        match descriptor {
            Some(LinkDescriptor::Link { collection }) => {
                match self.resolved_link(raw.as_inner(), collection.as_deref()) {
                    Some(doc) => FieldValue::Link(doc),
                    None => FieldValue::Value(raw.clone()),
                }
            }
            Some(LinkDescriptor::MultiLink { collection }) => {
                let Some(items) = raw.as_array() else {
                    return FieldValue::Value(raw.clone());
                };
                let docs: Option<Vec<Document>> = items
                    .iter()
                    .map(|item| self.resolved_link(item, collection.as_deref()))
                    .collect();
                match docs {
                    Some(docs) if !docs.is_empty() || self.populated.contains(path) => {
                        FieldValue::Links(Batch::new(docs))
                    }
                    _ => FieldValue::Value(raw.clone()),
                }
            }
            _ => FieldValue::Value(raw.clone()),
        }
    }
}

struct DocumentInner {
    id: DocId,
    collection: Arc<Collection>,
    state: RwLock<DocumentState>,
}

// =============================================================================
// Document
// =============================================================================

/// Shared handle over one record
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

impl Document {
    pub(crate) fn with_id(
        collection: Arc<Collection>,
        id: DocId,
        raw: JsonValue,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            inner: Arc::new(DocumentInner {
                id,
                collection,
                state: RwLock::new(DocumentState {
                    raw,
                    lifecycle,
                    dirty: DirtyTree::new(),
                    snapshot: None,
                    resolved: HashMap::new(),
                    populated: BTreeSet::new(),
                    lock: None,
                }),
            }),
        }
    }

    /// Wrap a stored record
    pub(crate) fn from_record(collection: Arc<Collection>, raw: JsonValue) -> Result<Self> {
        let id = DocId::of_record(&raw).ok_or_else(|| {
            Error::internal(format!(
                "record without '{}' returned by '{}'",
                ID_FIELD,
                collection.name()
            ))
        })?;
        Ok(Self::with_id(collection, id, raw, Lifecycle::Loaded))
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    /// Record id
    pub fn id(&self) -> &DocId {
        &self.inner.id
    }

    /// Owning collection
    pub fn collection(&self) -> &Arc<Collection> {
        &self.inner.collection
    }

    /// Owning collection's name
    pub fn collection_name(&self) -> &str {
        self.inner.collection.name()
    }

    /// Whether two handles point at the same instance
    pub fn ptr_eq(a: &Document, b: &Document) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Reference naming this document's collection
    pub fn doc_ref(&self) -> DocRef {
        DocRef::with_collection(self.inner.id.clone(), self.collection_name())
    }

    // -------------------------------------------------------------------------
    // State
    // -------------------------------------------------------------------------

    /// Current lifecycle state
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.read().lifecycle
    }

    /// Whether unpersisted changes exist
    pub fn is_dirty(&self) -> bool {
        !self.inner.state.read().dirty.is_empty()
    }

    /// Changed paths since the last persist
    pub fn dirty_paths(&self) -> Vec<JsonPath> {
        self.inner.state.read().dirty.paths()
    }

    /// Whether the record carries the freeze flag
    pub fn is_frozen(&self) -> bool {
        is_frozen(&self.inner.state.read().raw)
    }

    /// Lock held (or reserved) by this instance
    ///
    /// Expired claims are not reported.
    pub fn lock_holder(&self) -> Option<LockId> {
        let state = self.inner.state.read();
        let claim = state.lock.as_ref()?;
        let live = state.lifecycle == Lifecycle::Detached
            || !claim_expired(claim, self.inner.collection.lock_timeout());
        live.then_some(claim.holder)
    }

    /// Version number of the record
    pub fn version(&self) -> u64 {
        version_of(&self.inner.state.read().raw)
    }

    /// Copy of the raw record
    pub fn to_json(&self) -> JsonValue {
        self.inner.state.read().raw.clone()
    }

    fn deleted_error(&self) -> Error {
        Error::bad_request(format!(
            "document '{}' in '{}' is deleted",
            self.inner.id,
            self.collection_name()
        ))
    }

    fn ensure_live(&self, state: &DocumentState) -> Result<()> {
        if state.lifecycle == Lifecycle::Deleted {
            return Err(self.deleted_error());
        }
        Ok(())
    }

    fn ensure_writable(&self, state: &DocumentState) -> Result<()> {
        self.ensure_live(state)?;
        if is_frozen(&state.raw) {
            return Err(Error::bad_request(format!(
                "document '{}' in '{}' is frozen",
                self.inner.id,
                self.collection_name()
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Raw value at a path
    pub fn get<P: ToPath + ?Sized>(&self, path: &P) -> Result<Option<JsonValue>> {
        let path = path.to_path()?;
        let state = self.inner.state.read();
        self.ensure_live(&state)?;
        Ok(get_at_path(&state.raw, &path).cloned())
    }

    /// Field value, with links substituted once resolved
    pub fn field<P: ToPath + ?Sized>(&self, path: &P) -> Result<FieldValue> {
        let path = path.to_path()?;
        let descriptor = self.inner.collection.link_descriptor(&path);
        let state = self.inner.state.read();
        self.ensure_live(&state)?;
        Ok(state.field_value(&path, descriptor.as_ref()))
    }

    fn expect_link(&self, path: &JsonPath, expected: &str) -> Result<LinkDescriptor> {
        let descriptor = self.inner.collection.link_descriptor(path);
        match descriptor {
            Some(d) if d.kind_name() == expected => Ok(d),
            other => Err(Error::bad_request(format!(
                "'{}' in '{}' is {}, not a {}",
                path,
                self.collection_name(),
                other
                    .map(|d| format!("a {}", d.kind_name()))
                    .unwrap_or_else(|| "not a link".to_string()),
                expected
            ))),
        }
    }

    /// Raw reference stored in a link field
    pub fn link_ref<P: ToPath + ?Sized>(&self, path: &P) -> Result<Option<DocRef>> {
        let path = path.to_path()?;
        self.expect_link(&path, "link")?;
        Ok(self.get(&path)?.and_then(|v| DocRef::from_json(&v)))
    }

    /// Resolved target of a link field
    ///
    /// `None` when the link is null or not populated yet. Fails with
    /// `BadRequest` when the path is not a link field.
    pub fn get_link<P: ToPath + ?Sized>(&self, path: &P) -> Result<Option<Document>> {
        let path = path.to_path()?;
        self.expect_link(&path, "link")?;
        Ok(self.field(&path)?.into_link())
    }

    /// Resolved targets of a multi-link field
    pub fn get_multi_link<P: ToPath + ?Sized>(&self, path: &P) -> Result<Option<Batch>> {
        let path = path.to_path()?;
        self.expect_link(&path, "multi-link")?;
        Ok(self.field(&path)?.into_links())
    }

    /// Documents linking back to this one through a back-link field
    pub fn get_back_link<P: ToPath + ?Sized>(&self, path: &P) -> Result<Option<Batch>> {
        let path = path.to_path()?;
        self.expect_link(&path, "back-link")?;
        Ok(self.field(&path)?.into_links())
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    fn check_writable_path(&self, path: &JsonPath) -> Result<()> {
        if path.is_root() {
            return Err(Error::bad_request("cannot replace a whole record by path"));
        }
        if path.has_wildcard() {
            return Err(Error::bad_request(format!(
                "cannot write through wildcard path '{}'",
                path
            )));
        }
        if let Some(PathSegment::Key(field)) = path.segments().first() {
            if is_reserved(field) {
                return Err(Error::bad_request(format!(
                    "field '{}' is managed by trellis",
                    field
                )));
            }
        }
        Ok(())
    }

    fn link_target(&self, doc: &Document, fixed: Option<&str>) -> Result<(JsonValue, ResolvedKey)> {
        let collection = doc.collection_name();
        let reference = match fixed {
            Some(expected) if expected != collection => {
                return Err(Error::bad_request(format!(
                    "link expects a document of '{}', got one of '{}'",
                    expected, collection
                )))
            }
            Some(_) => DocRef::new(doc.id().clone()),
            None => DocRef::with_collection(doc.id().clone(), collection),
        };
        let key = ResolvedKey::Link {
            collection: collection.to_string(),
            id: doc.id().clone(),
        };
        Ok((reference.to_json(), key))
    }

    fn prepare_input(
        &self,
        path: &JsonPath,
        input: FieldInput,
    ) -> Result<(JsonValue, Vec<(ResolvedKey, Document)>)> {
        let descriptor = self.inner.collection.link_descriptor(path);
        if let Some(LinkDescriptor::BackLink { .. }) = descriptor {
            return Err(Error::bad_request(format!(
                "back-link '{}' is derived and cannot be written",
                path
            )));
        }
        match (input, descriptor) {
            (FieldInput::Value(value), _) => Ok((value, Vec::new())),
            (FieldInput::Document(doc), Some(LinkDescriptor::Link { collection })) => {
                let (reference, key) = self.link_target(&doc, collection.as_deref())?;
                Ok((reference, vec![(key, doc)]))
            }
            (FieldInput::Documents(docs), Some(LinkDescriptor::MultiLink { collection })) => {
                let mut refs = Vec::with_capacity(docs.len());
                let mut resolved: Vec<(ResolvedKey, Document)> = Vec::with_capacity(docs.len());
                for doc in docs {
                    let (reference, key) = self.link_target(&doc, collection.as_deref())?;
                    if resolved.iter().any(|(k, _)| *k == key) {
                        continue;
                    }
                    refs.push(reference.into_inner());
                    resolved.push((key, doc));
                }
                Ok((serde_json::Value::Array(refs).into(), resolved))
            }
            (FieldInput::Document(_), _) => Err(Error::bad_request(format!(
                "'{}' is not a link field",
                path
            ))),
            (FieldInput::Documents(_), _) => Err(Error::bad_request(format!(
                "'{}' is not a multi-link field",
                path
            ))),
        }
    }

    fn needs_snapshot(&self, state: &DocumentState) -> bool {
        self.inner.collection.is_versioned()
            && state.snapshot.is_none()
            && matches!(state.lifecycle, Lifecycle::Loaded | Lifecycle::Saved)
    }

    fn write_path(&self, state: &mut DocumentState, path: &JsonPath, value: JsonValue) -> Result<()> {
        let depth = path.len() + value.nesting_depth();
        if depth > MAX_NESTING_DEPTH {
            return Err(LimitError::NestingTooDeep {
                depth,
                max: MAX_NESTING_DEPTH,
            }
            .into());
        }
        if get_at_path(&state.raw, path) == Some(&value) {
            return Ok(());
        }
        let before = self.needs_snapshot(state).then(|| state.raw.clone());
        set_at_path(&mut state.raw, path, value)
            .map_err(|e| Error::bad_request(format!("cannot set '{}': {}", path, e)))?;
        if before.is_some() {
            state.snapshot = before;
        }
        state.dirty.mark(path);
        Ok(())
    }

    fn remove_path(&self, state: &mut DocumentState, path: &JsonPath) -> Result<()> {
        if get_at_path(&state.raw, path).is_none() {
            return Ok(());
        }
        let before = self.needs_snapshot(state).then(|| state.raw.clone());
        delete_at_path(&mut state.raw, path)
            .map_err(|e| Error::bad_request(format!("cannot unset '{}': {}", path, e)))?;
        if before.is_some() {
            state.snapshot = before;
        }
        let changed = match path.last_segment() {
            Some(PathSegment::Index(_)) => path.parent().unwrap_or_default(),
            _ => path.clone(),
        };
        state.dirty.mark(&changed);
        Ok(())
    }

    /// Write a field
    ///
    /// Assigning a [`Document`] to a link field (or a list of them to a
    /// multi-link) stores the references and keeps the instances for reads.
    /// Writing an identical value is a no-op.
    pub fn set<P: ToPath + ?Sized>(&self, path: &P, value: impl Into<FieldInput>) -> Result<()> {
        let path = path.to_path()?;
        self.check_writable_path(&path)?;
        let (value, resolved) = self.prepare_input(&path, value.into())?;

        let mut state = self.inner.state.write();
        self.ensure_writable(&state)?;
        self.write_path(&mut state, &path, value)?;
        for (key, doc) in resolved {
            state.resolved.insert(key, Resolved::Single(doc));
        }
        Ok(())
    }

    /// Remove a field or array element
    pub fn unset<P: ToPath + ?Sized>(&self, path: &P) -> Result<()> {
        let path = path.to_path()?;
        self.check_writable_path(&path)?;
        if let Some(LinkDescriptor::BackLink { .. }) = self.inner.collection.link_descriptor(&path) {
            return Err(Error::bad_request(format!(
                "back-link '{}' is derived and cannot be written",
                path
            )));
        }
        let mut state = self.inner.state.write();
        self.ensure_writable(&state)?;
        self.remove_path(&mut state, &path)
    }

    /// Minimal patch covering the changes since the last persist
    pub fn build_patch(&self) -> Patch {
        let state = self.inner.state.read();
        patch_of(&state.raw, &state.dirty)
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Write the whole record
    ///
    /// Creates the record when the document was never persisted.
    pub fn save(&self) -> Result<()> {
        self.save_with(&WriteOptions::default())
    }

    /// [`Document::save`] with options
    pub fn save_with(&self, options: &WriteOptions) -> Result<()> {
        options.filter(self.persist(Persist::Save))
    }

    /// Write only the changed paths
    ///
    /// Creates the record when the document was never persisted; a no-op when
    /// nothing changed.
    pub fn commit(&self) -> Result<()> {
        self.commit_with(&WriteOptions::default())
    }

    /// [`Document::commit`] with options
    pub fn commit_with(&self, options: &WriteOptions) -> Result<()> {
        options.filter(self.persist(Persist::Commit))
    }

    fn persist(&self, mode: Persist) -> Result<()> {
        let collection = &self.inner.collection;
        let mut state = self.inner.state.write();
        self.ensure_writable(&state)?;
        let detached = state.lifecycle == Lifecycle::Detached;
        if mode == Persist::Commit && !detached && state.dirty.is_empty() {
            return Ok(());
        }

        let mut next = collection.validate(&state.raw)?;
        let mut dirty = state.dirty.clone();
        if let (Some(before), Some(after)) = (state.raw.as_object(), next.as_object()) {
            for key in before.keys().chain(after.keys()) {
                if before.get(key) != after.get(key) {
                    dirty.mark(&JsonPath::root().key(key.clone()));
                }
            }
        }

        if collection.is_versioned() {
            let version = if detached {
                Some(version_of(&next))
            } else if let Some(snapshot) = &state.snapshot {
                Some(collection.archive(snapshot)? + 1)
            } else {
                None
            };
            if let Some(version) = version {
                stamp_version(&mut next, version, Timestamp::now());
                dirty.mark(&JsonPath::root().key(VERSION_FIELD));
                dirty.mark(&JsonPath::root().key(LAST_MODIFIED_FIELD));
            }
        }

        let driver = collection.driver();
        let written = match (detached, mode) {
            (true, _) => driver.create(&next, state.lock.as_ref()),
            (false, Persist::Save) => driver.update(&self.inner.id, &next),
            (false, Persist::Commit) => driver.patch(&self.inner.id, &patch_of(&next, &dirty)),
        };
        written.map_err(|e| e.with_collection(collection.name()))?;

        state.raw = next;
        state.lifecycle = Lifecycle::Saved;
        state.dirty.clear();
        state.snapshot = None;
        debug!(
            target: "trellis::document",
            collection = collection.name(),
            id = %self.inner.id,
            mode = ?mode,
            created = detached,
            "Persisted document"
        );
        Ok(())
    }

    /// Delete the record
    ///
    /// In a versioned collection the final stored state is archived first.
    pub fn delete(&self) -> Result<()> {
        let collection = &self.inner.collection;
        let mut state = self.inner.state.write();
        self.ensure_writable(&state)?;

        if state.lifecycle != Lifecycle::Detached {
            if collection.is_versioned() {
                let stored = state.snapshot.as_ref().unwrap_or(&state.raw);
                collection.archive(stored)?;
            }
            let existed = collection
                .driver()
                .delete(&self.inner.id)
                .map_err(|e| e.with_collection(collection.name()))?;
            debug!(
                target: "trellis::document",
                collection = collection.name(),
                id = %self.inner.id,
                existed,
                "Deleted document"
            );
        }

        state.lifecycle = Lifecycle::Deleted;
        state.dirty.clear();
        state.snapshot = None;
        state.lock = None;
        Ok(())
    }

    /// Replace local state with the stored record
    ///
    /// Discards unpersisted changes and resolved links.
    pub fn reload(&self) -> Result<()> {
        let collection = &self.inner.collection;
        let mut state = self.inner.state.write();
        self.ensure_live(&state)?;
        if state.lifecycle == Lifecycle::Detached {
            return Err(Error::bad_request(format!(
                "document '{}' in '{}' was never saved",
                self.inner.id,
                collection.name()
            )));
        }
        let record = collection
            .driver()
            .get(&self.inner.id)
            .map_err(|e| e.with_collection(collection.name()))?
            .ok_or_else(|| {
                Error::not_found(format!("document '{}' not found", self.inner.id))
                    .with_collection(collection.name())
            })?;

        state.raw = record;
        state.lifecycle = Lifecycle::Loaded;
        state.dirty.clear();
        state.snapshot = None;
        state.resolved.clear();
        state.populated.clear();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Locking and freezing
    // -------------------------------------------------------------------------

    /// Take the record lock
    ///
    /// A never-saved document reserves a lock that its creation writes.
    /// Returns `false` when another holder has a live lock.
    pub fn lock(&self) -> Result<bool> {
        let collection = &self.inner.collection;
        if !collection.is_lockable() {
            return Err(Error::bad_request(format!(
                "collection '{}' is not lockable",
                collection.name()
            )));
        }
        let mut state = self.inner.state.write();
        self.ensure_live(&state)?;
        if let Some(claim) = &state.lock {
            if state.lifecycle == Lifecycle::Detached
                || !claim_expired(claim, collection.lock_timeout())
            {
                return Ok(true);
            }
            // Expired claims may have been taken over upstream
            state.lock = None;
        }
        if state.lifecycle == Lifecycle::Detached {
            state.lock = Some(collection.controller().reserve_lock());
            return Ok(true);
        }

        let outcome = collection
            .controller()
            .lock(collection.driver().as_ref(), &self.inner.id, collection.lock_timeout())
            .map_err(|e| e.with_collection(collection.name()))?;
        match outcome {
            LockOutcome::Acquired(holder) => {
                state.lock = Some(LockClaim {
                    holder,
                    acquired_at: Timestamp::now(),
                });
                Ok(true)
            }
            LockOutcome::NotAcquired => Ok(false),
        }
    }

    /// Release the lock this instance holds
    ///
    /// Returns `false` when nothing was released. An expired claim is dropped
    /// and reports `false`; a stale lock pair still stored under it is cleared.
    pub fn unlock(&self) -> Result<bool> {
        let collection = &self.inner.collection;
        let mut state = self.inner.state.write();
        self.ensure_live(&state)?;
        let Some(claim) = state.lock.take() else {
            return Ok(false);
        };
        if state.lifecycle == Lifecycle::Detached {
            return Ok(true);
        }
        let released = collection
            .controller()
            .unlock(collection.driver().as_ref(), &self.inner.id, &claim.holder)
            .map_err(|e| e.with_collection(collection.name()))?;
        Ok(released && !claim_expired(&claim, collection.lock_timeout()))
    }

    pub(crate) fn adopt_lock(&self, holder: LockId) {
        self.inner.state.write().lock = Some(LockClaim {
            holder,
            acquired_at: Timestamp::now(),
        });
    }

    pub(crate) fn forget_lock(&self) {
        self.inner.state.write().lock = None;
    }

    /// Set the freeze flag; frozen documents reject writes
    ///
    /// Best effort: returns `false` when the stored record could not be
    /// updated, in which case the local flag is unchanged.
    pub fn freeze(&self) -> Result<bool> {
        self.set_frozen(true)
    }

    /// Clear the freeze flag
    pub fn unfreeze(&self) -> Result<bool> {
        self.set_frozen(false)
    }

    fn set_frozen(&self, frozen: bool) -> Result<bool> {
        let collection = &self.inner.collection;
        let mut state = self.inner.state.write();
        self.ensure_live(&state)?;
        if state.lifecycle == Lifecycle::Detached {
            return Err(Error::bad_request(format!(
                "document '{}' in '{}' was never saved",
                self.inner.id,
                collection.name()
            )));
        }
        if is_frozen(&state.raw) == frozen {
            return Ok(true);
        }
        let applied =
            collection
                .controller()
                .set_frozen(collection.driver().as_ref(), &self.inner.id, frozen);
        if applied {
            freeze_patch(frozen).apply_to(&mut state.raw)?;
            if let Some(snapshot) = state.snapshot.as_mut() {
                freeze_patch(frozen).apply_to(snapshot)?;
            }
        }
        Ok(applied)
    }

    // -------------------------------------------------------------------------
    // Links and history
    // -------------------------------------------------------------------------

    /// Resolve link fields of this document
    pub fn populate(&self, paths: &[&str], options: &PopulateOptions) -> Result<PopulationStats> {
        populate::populate(std::slice::from_ref(self), paths, options)
    }

    /// Forget resolved links
    ///
    /// Linked documents hold each other; this breaks such cycles.
    pub fn release_links(&self) {
        let mut state = self.inner.state.write();
        state.resolved.clear();
        state.populated.clear();
    }

    /// Archived versions of this record, oldest first
    pub fn versions(&self) -> Result<Vec<JsonValue>> {
        self.inner.collection.versions(&self.inner.id)
    }

    // -------------------------------------------------------------------------
    // Population hooks
    // -------------------------------------------------------------------------

    pub(crate) fn is_persisted(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Loaded | Lifecycle::Saved)
    }

    pub(crate) fn expand(&self, pattern: &JsonPath) -> Vec<JsonPath> {
        expand_wildcards(&self.inner.state.read().raw, pattern)
    }

    pub(crate) fn raw_at(&self, path: &JsonPath) -> Option<JsonValue> {
        get_at_path(&self.inner.state.read().raw, path).cloned()
    }

    pub(crate) fn resolved_link(&self, collection: &str, id: &DocId) -> Option<Document> {
        let key = ResolvedKey::Link {
            collection: collection.to_string(),
            id: id.clone(),
        };
        match self.inner.state.read().resolved.get(&key) {
            Some(Resolved::Single(doc)) => Some(doc.clone()),
            _ => None,
        }
    }

    pub(crate) fn resolved_back_link(&self, path: &JsonPath) -> Option<Batch> {
        match self
            .inner
            .state
            .read()
            .resolved
            .get(&ResolvedKey::BackLink(path.clone()))
        {
            Some(Resolved::Many(batch)) => Some(batch.clone()),
            _ => None,
        }
    }

    pub(crate) fn record_link(&self, target: &Document) {
        let key = ResolvedKey::Link {
            collection: target.collection_name().to_string(),
            id: target.id().clone(),
        };
        self.inner
            .state
            .write()
            .resolved
            .insert(key, Resolved::Single(target.clone()));
    }

    pub(crate) fn record_back_link(&self, path: JsonPath, docs: Batch) {
        self.inner
            .state
            .write()
            .resolved
            .insert(ResolvedKey::BackLink(path), Resolved::Many(docs));
    }

    pub(crate) fn mark_populated(&self, pattern: JsonPath) {
        self.inner.state.write().populated.insert(pattern);
    }

    /// Local repair that bypasses the freeze and reserved-field checks
    pub(crate) fn repair(&self, path: &JsonPath, replacement: Option<JsonValue>) -> Result<()> {
        let mut state = self.inner.state.write();
        self.ensure_live(&state)?;
        match replacement {
            Some(value) => self.write_path(&mut state, path, value),
            None => self.remove_path(&mut state, path),
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("collection", &self.collection_name())
            .field("id", &self.inner.id)
            .field(
                "lifecycle",
                &self.inner.state.try_read().map(|state| state.lifecycle),
            )
            .finish()
    }
}
