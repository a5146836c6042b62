//! Population Tests for trellis-engine
//!
//! Link resolution across collections:
//!
//! 1. **Identity** - One record, one instance per session
//! 2. **Batching** - Query counts for first and repeated population
//! 3. **Cycles** - Self links and mutual links terminate
//! 4. **Dangling Links** - Missing targets are repaired, not raised
//! 5. **Kinds** - Multi-links, polymorphic links, back-links, deep paths
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test population_tests
//! ```

use serde_json::json;
use std::sync::Arc;

use trellis_core::{ErrorCode, JsonValue, StorageDriver};
use trellis_engine::{
    Collection, CollectionOptions, Document, FieldSpec, FieldValue, MemoryCache, PopulateOptions,
    ReadOptions, Registry, Schema, TrellisConfig,
};
use trellis_storage::MemoryDriver;

// ============================================================================
// Test Helpers
// ============================================================================

struct Library {
    registry: Registry,
    authors: Arc<Collection>,
    books: Arc<Collection>,
    people: Arc<Collection>,
    items: Arc<Collection>,
}

impl Library {
    fn new() -> Self {
        Self::with_config(TrellisConfig::default())
    }

    fn with_config(config: TrellisConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let registry = Registry::new(config).unwrap();
        let authors = registry
            .create_collection(CollectionOptions::new(
                "authors",
                Schema::new()
                    .field("name", FieldSpec::string())
                    .field("books", FieldSpec::back_link("books", "author"))
                    .field("friends", FieldSpec::multi_link("authors")),
            ))
            .unwrap();
        let books = registry
            .create_collection(CollectionOptions::new(
                "books",
                Schema::new()
                    .field("title", FieldSpec::string())
                    .field("author", FieldSpec::link("authors"))
                    .field("coauthors", FieldSpec::multi_link("authors")),
            ))
            .unwrap();
        let people = registry
            .create_collection(CollectionOptions::new(
                "people",
                Schema::new()
                    .field("name", FieldSpec::string())
                    .field("next", FieldSpec::link("people")),
            ))
            .unwrap();
        let items = registry
            .create_collection(CollectionOptions::new(
                "items",
                Schema::new().field("target", FieldSpec::dynamic_link()),
            ))
            .unwrap();
        Self {
            registry,
            authors,
            books,
            people,
            items,
        }
    }

    fn store(&self, collection: &str) -> Arc<MemoryDriver> {
        self.registry.memory_store("", collection).unwrap()
    }

    fn total_queries(&self) -> u64 {
        ["authors", "books", "people", "items"]
            .iter()
            .map(|c| self.store(c).query_count())
            .sum()
    }

    fn reset_queries(&self) {
        for c in ["authors", "books", "people", "items"] {
            self.store(c).reset_query_count();
        }
    }

    fn author(&self, id: &str, name: &str) -> Document {
        let doc = self
            .authors
            .create_document(json!({"_id": id, "name": name}))
            .unwrap();
        doc.save().unwrap();
        doc
    }

    fn book(&self, id: &str, author: &str) -> Document {
        let doc = self
            .books
            .create_document(json!({"_id": id, "title": id, "author": {"_id": author}}))
            .unwrap();
        doc.save().unwrap();
        doc
    }

    fn person(&self, id: &str, next: Option<&str>) -> Document {
        let next = next.map(|n| json!({"_id": n})).unwrap_or(serde_json::Value::Null);
        let doc = self
            .people
            .create_document(json!({"_id": id, "name": id, "next": next}))
            .unwrap();
        doc.save().unwrap();
        doc
    }

    fn load(collection: &Arc<Collection>, id: &str) -> Document {
        collection.get(id, &ReadOptions::new()).unwrap().unwrap()
    }
}

// ============================================================================
// Identity
// ============================================================================

mod identity {
    use super::*;

    #[test]
    fn test_link_resolves_to_same_instance_as_direct_fetch() {
        let lib = Library::new();
        lib.author("a1", "Ada");
        lib.book("b1", "a1");

        let cache = MemoryCache::new();
        let direct = lib
            .authors
            .get("a1", &ReadOptions::new().cache(cache.clone()))
            .unwrap()
            .unwrap();
        let book = lib
            .books
            .get(
                "b1",
                &ReadOptions::new().populate(["author"]).cache(cache.clone()),
            )
            .unwrap()
            .unwrap();

        let author = book.get_link("author").unwrap().unwrap();
        assert_eq!(author.id(), direct.id());
        assert!(Document::ptr_eq(&author, &direct));
    }

    #[test]
    fn test_two_hosts_share_one_target_instance() {
        let lib = Library::new();
        lib.author("a1", "Ada");
        lib.book("b1", "a1");
        lib.book("b2", "a1");

        let books = lib
            .books
            .find(json!({}), &ReadOptions::new().populate(["author"]))
            .unwrap();
        assert_eq!(books.len(), 2);
        let first = books.get(0).unwrap().get_link("author").unwrap().unwrap();
        let second = books.get(1).unwrap().get_link("author").unwrap().unwrap();
        assert!(Document::ptr_eq(&first, &second));

        let stats = books.population_stats().unwrap();
        assert_eq!(stats.db_queries, 1);
        assert_eq!(stats.depth, 1);
    }

    #[test]
    fn test_field_substitutes_resolved_link() {
        let lib = Library::new();
        lib.author("a1", "Ada");
        let book = lib.book("b1", "a1");

        match book.field("author").unwrap() {
            FieldValue::Value(raw) => assert_eq!(raw, JsonValue::from(json!({"_id": "a1"}))),
            other => panic!("expected raw reference, got {:?}", other),
        }
        book.populate(&["author"], &PopulateOptions::new()).unwrap();
        match book.field("author").unwrap() {
            FieldValue::Link(doc) => {
                assert_eq!(doc.get("name").unwrap(), Some(JsonValue::from("Ada")))
            }
            other => panic!("expected link, got {:?}", other),
        }
    }

    #[test]
    fn test_assigned_document_is_kept_without_fetch() {
        let lib = Library::new();
        let ada = lib.author("a1", "Ada");
        let book = lib
            .books
            .create_document(json!({"title": "Notes"}))
            .unwrap();
        book.set("author", &ada).unwrap();
        assert_eq!(
            book.get("author").unwrap(),
            Some(JsonValue::from(json!({"_id": "a1"})))
        );

        lib.reset_queries();
        let linked = book.get_link("author").unwrap().unwrap();
        assert!(Document::ptr_eq(&linked, &ada));
        assert_eq!(lib.total_queries(), 0);
    }

    #[test]
    fn test_assigning_wrong_collection_is_bad_request() {
        let lib = Library::new();
        let book = lib.book("b0", "a0");
        let other = lib.book("b1", "a0");
        assert_eq!(
            book.set("author", &other).unwrap_err().code(),
            ErrorCode::BadRequest
        );
    }
}

// ============================================================================
// Batching
// ============================================================================

mod batching {
    use super::*;

    #[test]
    fn test_second_populate_issues_no_queries() {
        let lib = Library::new();
        lib.author("a1", "Ada");
        let book = Library::load(&lib.books, &lib.book("b1", "a1").id().to_string());

        let first = book.populate(&["author"], &PopulateOptions::new()).unwrap();
        assert_eq!(first.db_queries, 1);

        lib.reset_queries();
        let second = book.populate(&["author"], &PopulateOptions::new()).unwrap();
        assert_eq!(second.db_queries, 0);
        assert_eq!(lib.total_queries(), 0);
    }

    #[test]
    fn test_one_query_per_target_collection() {
        let lib = Library::new();
        for i in 0..5 {
            lib.author(&format!("a{}", i), "x");
        }
        for i in 0..5 {
            let book = lib.book(&format!("b{}", i), &format!("a{}", i));
            book.set(
                "coauthors",
                json!([{"_id": format!("a{}", (i + 1) % 5)}, {"_id": format!("a{}", (i + 2) % 5)}]),
            )
            .unwrap();
            book.commit().unwrap();
        }

        lib.reset_queries();
        let books = lib
            .books
            .find(json!({}), &ReadOptions::new().populate(["author", "coauthors"]))
            .unwrap();
        assert_eq!(books.population_stats().unwrap().db_queries, 1);
        // one find for the books, one multi_get for every author
        assert_eq!(lib.total_queries(), 2);

        for book in &books {
            let coauthors = book.get_multi_link("coauthors").unwrap().unwrap();
            assert_eq!(coauthors.len(), 2);
        }
    }

    #[test]
    fn test_empty_population_is_free() {
        let lib = Library::new();
        let stats = trellis_engine::populate(&[], &["author"], &PopulateOptions::new()).unwrap();
        assert_eq!(stats.db_queries, 0);
        assert_eq!(stats.depth, 0);
        assert_eq!(lib.total_queries(), 0);
    }
}

// ============================================================================
// Cycles
// ============================================================================

mod cycles {
    use super::*;

    #[test]
    fn test_self_link_resolves_to_itself() {
        let lib = Library::new();
        let loop_doc = Library::load(&lib.people, &lib.person("p1", Some("p1")).id().to_string());

        lib.reset_queries();
        let stats = loop_doc
            .populate(&["next"], &PopulateOptions::new().deep("people", ["next"]))
            .unwrap();
        assert_eq!(stats.db_queries, 0);
        let next = loop_doc.get_link("next").unwrap().unwrap();
        assert!(Document::ptr_eq(&next, &loop_doc));
        loop_doc.release_links();
    }

    #[test]
    fn test_mutual_links_terminate() {
        let lib = Library::new();
        lib.person("a", Some("b"));
        lib.person("b", Some("a"));
        let a = Library::load(&lib.people, "a");

        let stats = a
            .populate(&["next"], &PopulateOptions::new().deep("people", ["next"]))
            .unwrap();
        assert_eq!(stats.db_queries, 1);

        let b = a.get_link("next").unwrap().unwrap();
        let back = b.get_link("next").unwrap().unwrap();
        assert!(Document::ptr_eq(&back, &a));
        a.release_links();
        b.release_links();
    }

    #[test]
    fn test_depth_ceiling_stops_deep_population() {
        let lib = Library::with_config(TrellisConfig {
            max_populate_depth: 2,
            ..TrellisConfig::default()
        });
        lib.person("p1", Some("p2"));
        lib.person("p2", Some("p3"));
        lib.person("p3", Some("p4"));
        lib.person("p4", None);
        let p1 = Library::load(&lib.people, "p1");

        let stats = p1
            .populate(&["next"], &PopulateOptions::new().deep("people", ["next"]))
            .unwrap();
        assert_eq!(stats.depth, 2);

        let p2 = p1.get_link("next").unwrap().unwrap();
        let p3 = p2.get_link("next").unwrap().unwrap();
        assert_eq!(p3.id().as_str(), "p3");
        assert!(p3.get_link("next").unwrap().is_none());
    }

    #[test]
    fn test_deep_population_follows_chain() {
        let lib = Library::new();
        lib.person("p1", Some("p2"));
        lib.person("p2", Some("p3"));
        lib.person("p3", None);
        let p1 = Library::load(&lib.people, "p1");

        let stats = p1
            .populate(&["next"], &PopulateOptions::new().deep("people", ["next"]))
            .unwrap();
        assert_eq!(stats.db_queries, 2);
        let p3 = p1
            .get_link("next")
            .unwrap()
            .unwrap()
            .get_link("next")
            .unwrap()
            .unwrap();
        assert_eq!(p3.get("name").unwrap(), Some(JsonValue::from("p3")));
    }

    #[test]
    fn test_read_options_carry_deep_paths() {
        let lib = Library::new();
        lib.person("p1", Some("p2"));
        lib.person("p2", Some("p3"));
        lib.person("p3", None);

        let people = lib
            .people
            .find(
                json!({"_id": "p1"}),
                &ReadOptions::new().populate(["next"]).deep("people", ["next"]),
            )
            .unwrap();
        assert_eq!(people.population_stats().unwrap().db_queries, 2);
        let p2 = people.get(0).unwrap().get_link("next").unwrap().unwrap();
        assert_eq!(p2.get_link("next").unwrap().unwrap().id().as_str(), "p3");
    }
}

// ============================================================================
// Dangling links
// ============================================================================

mod dangling {
    use super::*;

    #[test]
    fn test_dangling_link_is_nulled_and_persisted() {
        let lib = Library::new();
        lib.book("b1", "ghost");
        let book = Library::load(&lib.books, "b1");

        book.populate(&["author"], &PopulateOptions::new()).unwrap();
        assert!(book.get_link("author").unwrap().is_none());
        assert_eq!(book.get("author").unwrap(), Some(JsonValue::null()));
        assert!(!book.is_dirty());

        let stored = lib.store("books").get(book.id()).unwrap().unwrap();
        assert_eq!(stored.field("author"), Some(&JsonValue::null()));
    }

    #[test]
    fn test_dangling_multi_link_elements_are_removed() {
        let lib = Library::new();
        lib.author("a1", "Ada");
        lib.author("a3", "Cy");
        let book = lib.book("b1", "a1");
        book.set(
            "coauthors",
            json!([{"_id": "ghost1"}, {"_id": "a1"}, {"_id": "ghost2"}, {"_id": "a3"}]),
        )
        .unwrap();
        book.commit().unwrap();
        let book = Library::load(&lib.books, "b1");

        book.populate(&["coauthors"], &PopulateOptions::new()).unwrap();
        let coauthors = book.get_multi_link("coauthors").unwrap().unwrap();
        let ids: Vec<&str> = coauthors.iter().map(|d| d.id().as_str()).collect();
        assert_eq!(ids, vec!["a1", "a3"]);

        let stored = lib.store("books").get(book.id()).unwrap().unwrap();
        assert_eq!(
            stored.field("coauthors"),
            Some(&JsonValue::from(json!([{"_id": "a1"}, {"_id": "a3"}])))
        );
    }

    #[test]
    fn test_repair_does_not_flush_pending_edits() {
        let lib = Library::new();
        lib.book("b1", "ghost");
        let book = Library::load(&lib.books, "b1");
        book.set("title", "Unsaved").unwrap();

        book.populate(&["author"], &PopulateOptions::new()).unwrap();
        assert_eq!(book.get("author").unwrap(), Some(JsonValue::null()));
        let stored = lib.store("books").get(book.id()).unwrap().unwrap();
        assert_eq!(stored.field("title"), Some(&JsonValue::from(json!("b1"))));
        assert_eq!(stored.field("author"), Some(&JsonValue::from(json!({"_id": "ghost"}))));

        book.commit().unwrap();
        let stored = lib.store("books").get(book.id()).unwrap().unwrap();
        assert_eq!(stored.field("title"), Some(&JsonValue::from(json!("Unsaved"))));
        assert_eq!(stored.field("author"), Some(&JsonValue::null()));
    }

    #[test]
    fn test_dangling_link_on_unsaved_host_is_local_only() {
        let lib = Library::new();
        let book = lib
            .books
            .create_document(json!({"_id": "b9", "title": "Draft", "author": {"_id": "ghost"}}))
            .unwrap();
        book.populate(&["author"], &PopulateOptions::new()).unwrap();
        assert_eq!(book.get("author").unwrap(), Some(JsonValue::null()));
        assert!(lib.store("books").is_empty());
    }
}

// ============================================================================
// Kinds
// ============================================================================

mod kinds {
    use super::*;

    #[test]
    fn test_back_link_collects_referrers() {
        let lib = Library::new();
        let ada = lib.author("a1", "Ada");
        lib.author("a2", "Bo");
        lib.book("b1", "a1");
        lib.book("b2", "a2");
        lib.book("b3", "a1");

        let authors = lib
            .authors
            .find(json!({}), &ReadOptions::new().populate(["books"]))
            .unwrap();
        assert_eq!(authors.population_stats().unwrap().db_queries, 1);

        let by_id = |id: &str| authors.iter().find(|a| a.id().as_str() == id).unwrap().clone();
        let mut titles: Vec<String> = by_id("a1")
            .get_back_link("books")
            .unwrap()
            .unwrap()
            .ids()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        titles.sort();
        assert_eq!(titles, vec!["b1".to_string(), "b3".to_string()]);
        assert_eq!(by_id("a2").get_back_link("books").unwrap().unwrap().len(), 1);
        assert!(ada.get_back_link("books").unwrap().is_none());
    }

    #[test]
    fn test_back_link_is_read_only() {
        let lib = Library::new();
        let ada = lib.author("a1", "Ada");
        assert_eq!(
            ada.set("books", json!([])).unwrap_err().code(),
            ErrorCode::BadRequest
        );
    }

    #[test]
    fn test_polymorphic_link_uses_stored_collection() {
        let lib = Library::new();
        lib.author("a1", "Ada");
        let person = lib.person("p1", None);
        let item = lib
            .items
            .create_document(json!({"target": {"_id": "a1", "_collection": "authors"}}))
            .unwrap();
        item.save().unwrap();

        item.populate(&["target"], &PopulateOptions::new()).unwrap();
        let target = item.get_link("target").unwrap().unwrap();
        assert_eq!(target.collection_name(), "authors");

        item.set("target", &person).unwrap();
        assert_eq!(
            item.get("target").unwrap(),
            Some(JsonValue::from(json!({"_id": "p1", "_collection": "people"})))
        );
        assert!(Document::ptr_eq(&item.get_link("target").unwrap().unwrap(), &person));
    }

    #[test]
    fn test_wildcard_path_resolves_each_element() {
        let lib = Library::new();
        lib.author("a1", "Ada");
        lib.author("a2", "Bo");
        let shelves = lib
            .registry
            .create_collection(CollectionOptions::new(
                "shelves",
                Schema::new().field(
                    "rows",
                    FieldSpec::array(trellis_engine::FieldKind::Object(
                        Schema::new()
                            .field("label", FieldSpec::string())
                            .field("owner", FieldSpec::link("authors")),
                    )),
                ),
            ))
            .unwrap();
        shelves
            .create_document(json!({"_id": "s1", "rows": [
                {"label": "top", "owner": {"_id": "a1"}},
                {"label": "middle", "owner": {"_id": "a2"}},
                {"label": "bottom", "owner": {"_id": "a1"}},
            ]}))
            .unwrap()
            .save()
            .unwrap();

        let shelf = Library::load(&shelves, "s1");
        lib.reset_queries();
        let stats = shelf
            .populate(&["rows[*].owner"], &PopulateOptions::new())
            .unwrap();
        assert_eq!((stats.depth, stats.db_queries), (1, 1));
        assert_eq!(lib.store("authors").query_count(), 1);

        let top = shelf.get_link("rows[0].owner").unwrap().unwrap();
        let middle = shelf.get_link("rows[1].owner").unwrap().unwrap();
        let bottom = shelf.get_link("rows[2].owner").unwrap().unwrap();
        assert_eq!(top.id().as_str(), "a1");
        assert_eq!(middle.id().as_str(), "a2");
        assert!(Document::ptr_eq(&top, &bottom));
    }

    #[test]
    fn test_multi_link_assignment_deduplicates() {
        let lib = Library::new();
        let ada = lib.author("a1", "Ada");
        let bo = lib.author("a2", "Bo");
        let book = lib.book("b1", "a1");
        book.set("coauthors", vec![ada.clone(), bo.clone(), ada.clone()])
            .unwrap();
        assert_eq!(
            book.get("coauthors").unwrap(),
            Some(JsonValue::from(json!([{"_id": "a1"}, {"_id": "a2"}])))
        );
        assert_eq!(book.get_multi_link("coauthors").unwrap().unwrap().len(), 2);
    }
}

// ============================================================================
// Request checks
// ============================================================================

mod request_checks {
    use super::*;

    #[test]
    fn test_accessor_kind_mismatch_fails_before_io() {
        let lib = Library::new();
        lib.author("a1", "Ada");
        let book = lib.book("b1", "a1");
        lib.reset_queries();

        for err in [
            book.get_multi_link("author").unwrap_err(),
            book.get_link("coauthors").unwrap_err(),
            book.get_back_link("author").unwrap_err(),
            book.get_link("title").unwrap_err(),
        ] {
            assert_eq!(err.code(), ErrorCode::BadRequest);
        }
        assert_eq!(lib.total_queries(), 0);
    }

    #[test]
    fn test_populate_non_link_path_fails_before_io() {
        let lib = Library::new();
        lib.book("b1", "a1");
        lib.reset_queries();

        let err = lib
            .books
            .get("b1", &ReadOptions::new().populate(["title"]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);

        let err = lib
            .books
            .find(json!({}), &ReadOptions::new().populate(["author"]).deep("nope", ["x"]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert_eq!(lib.total_queries(), 0);
    }

    #[test]
    fn test_link_to_undeclared_collection_is_rejected() {
        let lib = Library::new();
        let registry = &lib.registry;
        let orphans = registry
            .create_collection(CollectionOptions::new(
                "orphans",
                Schema::new().field("owner", FieldSpec::link("missing")),
            ))
            .unwrap();
        let doc = orphans
            .create_document(json!({"owner": {"_id": "x"}}))
            .unwrap();
        assert_eq!(
            doc.populate(&["owner"], &PopulateOptions::new())
                .unwrap_err()
                .code(),
            ErrorCode::BadRequest
        );
    }
}
