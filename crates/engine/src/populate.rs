//! Link population
//!
//! Population replaces link references with the documents they point at.
//! One call is a session that runs level by level:
//!
//! 1. **Plan**: expand each requested path against every host, skip what the
//!    session (or the host itself) already resolved, and collect the missing
//!    ids per target collection
//! 2. **Fetch**: one `multi_get` per collection, one `find` per back-link
//!    `(collection, path)` pair; every record is wrapped through the session's
//!    [`MemoryCache`], so a record maps to exactly one instance
//! 3. **Substitute**: hand the instances to their hosts; references whose
//!    target does not exist are repaired (links nulled, multi-link elements
//!    removed) and the host is committed best-effort at the end
//! 4. **Deep**: targets whose collection has deep paths become the hosts of
//!    the next level
//!
//! Cycles terminate because a `(collection, id, path)` triple is planned once
//! per session; `max_populate_depth` bounds the number of levels.

use crate::batch::Batch;
use crate::cache::MemoryCache;
use crate::collection::Collection;
use crate::document::{Document, Lifecycle, ToPath};
use crate::registry::Registry;
use crate::schema::LinkDescriptor;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use trellis_core::{DocId, DocRef, Error, JsonPath, JsonValue, PathSegment, Result, ID_FIELD};

/// Options of one population session
#[derive(Debug, Clone, Default)]
pub struct PopulateOptions {
    /// Paths to populate on documents of a collection once they are resolved
    pub deep: BTreeMap<String, Vec<String>>,
    /// Identity map to share with other reads; a fresh one otherwise
    pub cache: Option<MemoryCache>,
}

impl PopulateOptions {
    /// No deep paths, fresh cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate `paths` on every resolved document of `collection`
    pub fn deep<S: Into<String>>(
        mut self,
        collection: impl Into<String>,
        paths: impl IntoIterator<Item = S>,
    ) -> Self {
        self.deep
            .entry(collection.into())
            .or_default()
            .extend(paths.into_iter().map(Into::into));
        self
    }

    /// Share an identity map
    pub fn cache(mut self, cache: MemoryCache) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Counters of one population session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PopulationStats {
    /// Levels processed
    pub depth: usize,
    /// Storage queries issued
    pub db_queries: usize,
}

fn parse_paths<S: AsRef<str>>(paths: &[S]) -> Result<Vec<JsonPath>> {
    paths.iter().map(|p| p.as_ref().to_path()).collect()
}

fn check_paths(registry: &Registry, collection: &Collection, paths: &[JsonPath]) -> Result<()> {
    for path in paths {
        let target = match collection.link_descriptor(path) {
            None => {
                return Err(Error::bad_request(format!(
                    "'{}' in '{}' is not a link field",
                    path,
                    collection.name()
                )))
            }
            Some(LinkDescriptor::Link { collection })
            | Some(LinkDescriptor::MultiLink { collection }) => collection,
            Some(LinkDescriptor::BackLink { collection, .. }) => Some(collection),
        };
        if let Some(name) = target {
            registry.collection(&name)?;
        }
    }
    Ok(())
}

/// Dot path of the forward link field, as the query matcher reads it
fn query_path(foreign_path: &str) -> Result<Vec<String>> {
    let path = foreign_path.to_path()?;
    Ok(path
        .segments()
        .iter()
        .filter_map(|s| match s {
            PathSegment::Key(k) => Some(k.clone()),
            _ => None,
        })
        .collect())
}

/// Whether `raw` references `id` at `path`, fanning out through arrays
fn links_to(raw: &Value, path: &[String], id: &str) -> bool {
    match raw {
        Value::Array(items) => items.iter().any(|item| links_to(item, path, id)),
        Value::Object(obj) => match path.split_first() {
            Some((head, tail)) => obj.get(head).is_some_and(|v| links_to(v, tail, id)),
            None => obj.get(ID_FIELD).and_then(Value::as_str) == Some(id),
        },
        _ => false,
    }
}

/// Check population paths for a collection without any I/O
pub(crate) fn check(collection: &Collection, paths: &[&str], options: &PopulateOptions) -> Result<()> {
    let registry = collection.registry()?;
    check_paths(&registry, collection, &parse_paths(paths)?)?;
    for (name, deep_paths) in &options.deep {
        check_paths(&registry, &*registry.collection(name)?, &parse_paths(deep_paths)?)?;
    }
    Ok(())
}

/// Resolve link paths on a set of documents
///
/// Paths are checked before any I/O: each must name a link, multi-link or
/// back-link field of its host's collection, and every fixed target
/// collection must be declared.
///
/// Dangling links are repaired in place. A persisted host with no other
/// unsaved edits is committed at the end of the pass; otherwise the repair
/// stays pending and goes out with the host's next commit.
pub fn populate(
    roots: &[Document],
    paths: &[&str],
    options: &PopulateOptions,
) -> Result<PopulationStats> {
    let Some(first) = roots.first() else {
        return Ok(PopulationStats::default());
    };
    let registry = first.collection().registry()?;
    let paths = Arc::new(parse_paths(paths)?);

    let mut checked = HashSet::new();
    for root in roots {
        if checked.insert(root.collection_name().to_string()) {
            check_paths(&registry, root.collection(), &paths)?;
        }
    }
    let mut deep = HashMap::new();
    for (name, deep_paths) in &options.deep {
        let parsed = parse_paths(deep_paths)?;
        check_paths(&registry, &*registry.collection(name)?, &parsed)?;
        deep.insert(name.clone(), Arc::new(parsed));
    }

    let mut session = Session {
        max_depth: registry.config().max_populate_depth,
        registry,
        cache: options.cache.clone().unwrap_or_default(),
        planned: HashSet::new(),
        deep,
        repairs: Vec::new(),
        stats: PopulationStats::default(),
    };
    session.run(roots.iter().map(|r| (r.clone(), Arc::clone(&paths))).collect())?;
    session.flush_repairs();

    debug!(
        target: "trellis::populate",
        roots = roots.len(),
        depth = session.stats.depth,
        db_queries = session.stats.db_queries,
        "Population finished"
    );
    Ok(session.stats)
}

// =============================================================================
// Session
// =============================================================================

type Level = Vec<(Document, Arc<Vec<JsonPath>>)>;

enum Target {
    Link {
        host: Document,
        path: JsonPath,
        collection: String,
        id: DocId,
        element: bool,
    },
    BackLink {
        host: Document,
        path: JsonPath,
        collection: String,
        foreign_path: String,
    },
    Known(Document),
}

#[derive(Default)]
struct Plan {
    fetch: BTreeMap<String, BTreeSet<DocId>>,
    back_links: BTreeMap<(String, String), BTreeSet<DocId>>,
    targets: Vec<Target>,
}

struct Session {
    registry: Registry,
    cache: MemoryCache,
    planned: HashSet<(String, DocId, JsonPath)>,
    deep: HashMap<String, Arc<Vec<JsonPath>>>,
    /// Repaired hosts, with whether they had unsaved edits beforehand
    repairs: Vec<(Document, bool)>,
    stats: PopulationStats,
    max_depth: usize,
}

impl Session {
    fn run(&mut self, mut level: Level) -> Result<()> {
        while !level.is_empty() {
            if self.stats.depth >= self.max_depth {
                warn!(
                    target: "trellis::populate",
                    max_depth = self.max_depth,
                    pending = level.len(),
                    "Population depth limit reached"
                );
                break;
            }
            self.stats.depth += 1;
            let plan = self.plan(&level)?;
            let back_links = self.fetch(&plan)?;
            level = self.substitute(plan.targets, &back_links);
        }
        Ok(())
    }

    fn schedule_repair(&mut self, host: &Document, had_edits: bool) {
        if !self.repairs.iter().any(|(d, _)| Document::ptr_eq(d, host)) {
            self.repairs.push((host.clone(), had_edits));
        }
    }

    // -------------------------------------------------------------------------
    // Plan
    // -------------------------------------------------------------------------

    fn plan(&mut self, level: &Level) -> Result<Plan> {
        let mut plan = Plan::default();
        for (host, _) in level {
            self.cache.add(host.clone());
        }

        for (host, patterns) in level {
            for pattern in patterns.iter() {
                let key = (
                    host.collection_name().to_string(),
                    host.id().clone(),
                    pattern.clone(),
                );
                if !self.planned.insert(key) {
                    continue;
                }
                match host.collection().link_descriptor(pattern) {
                    Some(LinkDescriptor::BackLink { collection, path }) => {
                        match host.resolved_back_link(pattern) {
                            Some(known) => plan
                                .targets
                                .extend(known.into_iter().map(|d| Target::Known(self.cache.add(d)))),
                            None => {
                                plan.back_links
                                    .entry((collection.clone(), path.clone()))
                                    .or_default()
                                    .insert(host.id().clone());
                                plan.targets.push(Target::BackLink {
                                    host: host.clone(),
                                    path: pattern.clone(),
                                    collection,
                                    foreign_path: path,
                                });
                            }
                        }
                    }
                    Some(LinkDescriptor::Link { collection }) => {
                        for concrete in host.expand(pattern) {
                            if let Some(value) = host.raw_at(&concrete).filter(|v| !v.is_null()) {
                                let element =
                                    matches!(concrete.last_segment(), Some(PathSegment::Index(_)));
                                self.plan_link(&mut plan, host, concrete, &value, collection.as_deref(), element);
                            }
                        }
                    }
                    Some(LinkDescriptor::MultiLink { collection }) => {
                        for concrete in host.expand(pattern) {
                            let items = match host.raw_at(&concrete) {
                                Some(value) => match value.into_inner() {
                                    Value::Array(items) => Some(items),
                                    _ => None,
                                },
                                None => None,
                            };
                            let Some(items) = items else {
                                warn!(
                                    target: "trellis::populate",
                                    collection = host.collection_name(),
                                    id = %host.id(),
                                    path = %concrete,
                                    "Multi-link is not an array, resetting it"
                                );
                                let had_edits = host.is_dirty();
                                if host.repair(&concrete, Some(JsonValue::array())).is_ok() {
                                    self.schedule_repair(host, had_edits);
                                }
                                continue;
                            };
                            for (i, item) in items.into_iter().enumerate() {
                                let path = concrete.clone().index(i);
                                let item = JsonValue::from_value(item);
                                self.plan_link(&mut plan, host, path, &item, collection.as_deref(), true);
                            }
                        }
                    }
                    None => {}
                }
                host.mark_populated(pattern.clone());
            }
        }
        Ok(plan)
    }

    fn plan_link(
        &mut self,
        plan: &mut Plan,
        host: &Document,
        path: JsonPath,
        value: &JsonValue,
        fixed: Option<&str>,
        element: bool,
    ) {
        let target = DocRef::from_json(value).and_then(|r| {
            r.target(fixed)
                .map(|collection| (collection.to_string(), r.id.clone()))
        });
        let Some((collection, id)) = target else {
            warn!(
                target: "trellis::populate",
                collection = host.collection_name(),
                id = %host.id(),
                path = %path,
                "Skipping malformed link"
            );
            return;
        };

        if let Some(known) = host.resolved_link(&collection, &id) {
            self.cache.add(known);
        } else if !self.cache.contains(&collection, &id) {
            plan.fetch
                .entry(collection.clone())
                .or_default()
                .insert(id.clone());
        }
        plan.targets.push(Target::Link {
            host: host.clone(),
            path,
            collection,
            id,
            element,
        });
    }

    // -------------------------------------------------------------------------
    // Fetch
    // -------------------------------------------------------------------------

    fn wrap(&self, collection: &Arc<Collection>, record: JsonValue) -> Option<Document> {
        let Some(id) = DocId::of_record(&record) else {
            warn!(
                target: "trellis::populate",
                collection = collection.name(),
                "Skipping record without id"
            );
            return None;
        };
        let make_id = id.clone();
        Some(self.cache.get_or_insert_with(collection.name(), &id, || {
            Document::with_id(Arc::clone(collection), make_id, record, Lifecycle::Loaded)
        }))
    }

    fn fetch(&mut self, plan: &Plan) -> Result<HashMap<(String, String), Vec<Document>>> {
        for (name, ids) in &plan.fetch {
            let ids: Vec<DocId> = ids
                .iter()
                .filter(|id| !self.cache.contains(name, id))
                .cloned()
                .collect();
            if ids.is_empty() {
                continue;
            }
            let collection = self.registry.collection(name)?;
            let records = collection
                .driver()
                .multi_get(&ids)
                .map_err(|e| e.with_collection(name))?;
            self.stats.db_queries += 1;
            for record in records {
                self.wrap(&collection, record);
            }
        }

        let mut back_links = HashMap::new();
        for ((name, foreign_path), hosts) in &plan.back_links {
            let collection = self.registry.collection(name)?;
            let field = format!("{}.{}", query_path(foreign_path)?.join("."), ID_FIELD);
            let ids: Vec<&str> = hosts.iter().map(DocId::as_str).collect();
            let query = JsonValue::from(json!({ field: { "$in": ids } }));
            let records = collection
                .driver()
                .find(&query)
                .map_err(|e| e.with_collection(name))?;
            self.stats.db_queries += 1;
            let docs: Vec<Document> = records
                .into_iter()
                .filter_map(|record| self.wrap(&collection, record))
                .collect();
            back_links.insert((name.clone(), foreign_path.clone()), docs);
        }
        Ok(back_links)
    }

    // -------------------------------------------------------------------------
    // Substitute
    // -------------------------------------------------------------------------

    fn substitute(
        &mut self,
        targets: Vec<Target>,
        back_links: &HashMap<(String, String), Vec<Document>>,
    ) -> Level {
        let mut next = Level::new();
        let mut queued = HashSet::new();
        let mut dangling = Vec::new();
        let mut queue = |doc: &Document, next: &mut Level| {
            if let Some(paths) = self.deep.get(doc.collection_name()) {
                if queued.insert((doc.collection_name().to_string(), doc.id().clone())) {
                    next.push((doc.clone(), Arc::clone(paths)));
                }
            }
        };

        for target in targets {
            match target {
                Target::Link {
                    host,
                    path,
                    collection,
                    id,
                    element,
                } => match self.cache.get(&collection, &id) {
                    Some(doc) => {
                        host.record_link(&doc);
                        queue(&doc, &mut next);
                    }
                    None => dangling.push((host, path, element)),
                },
                Target::BackLink {
                    host,
                    path,
                    collection,
                    foreign_path,
                } => {
                    let segments = query_path(&foreign_path).unwrap_or_default();
                    let docs: Vec<Document> = back_links
                        .get(&(collection, foreign_path))
                        .map(|docs| {
                            docs.iter()
                                .filter(|d| {
                                    links_to(d.to_json().as_inner(), &segments, host.id().as_str())
                                })
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default();
                    for doc in &docs {
                        queue(doc, &mut next);
                    }
                    host.record_back_link(path, Batch::new(docs));
                }
                Target::Known(doc) => queue(&doc, &mut next),
            }
        }

        // Highest index first, so removals leave pending indices in place
        dangling.sort_by(|a: &(Document, JsonPath, bool), b| b.1.cmp(&a.1));
        for (host, path, element) in dangling {
            warn!(
                target: "trellis::populate",
                collection = host.collection_name(),
                id = %host.id(),
                path = %path,
                "Dangling link, repairing"
            );
            let replacement = if element { None } else { Some(JsonValue::null()) };
            let had_edits = host.is_dirty();
            match host.repair(&path, replacement) {
                Ok(()) => self.schedule_repair(&host, had_edits),
                Err(e) => warn!(target: "trellis::populate", error = %e, "Link repair failed"),
            }
        }
        next
    }

    fn flush_repairs(&mut self) {
        for (host, had_edits) in self.repairs.drain(..) {
            if !host.is_persisted() {
                continue;
            }
            if had_edits {
                debug!(
                    target: "trellis::populate",
                    collection = host.collection_name(),
                    id = %host.id(),
                    "Link repair left for the next commit"
                );
                continue;
            }
            if let Err(e) = host.commit() {
                warn!(
                    target: "trellis::populate",
                    collection = host.collection_name(),
                    id = %host.id(),
                    error = %e,
                    "Could not persist link repair"
                );
            }
        }
    }
}
