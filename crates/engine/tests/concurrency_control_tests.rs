//! Concurrency Control Tests for trellis-engine
//!
//! Document-level locking, freezing and versioning through the public API:
//!
//! 1. **Locks** - lock/unlock, contention, reserved locks on new documents
//! 2. **Lock Retrieve Release** - batch locks and their release
//! 3. **Freeze** - frozen documents reject writes
//! 4. **Versioning** - archives on save/commit/delete, concurrent writers
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test concurrency_control_tests
//! ```

use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use trellis_core::{ErrorCode, JsonValue, StorageDriver, LOCKED_BY_FIELD};
use trellis_engine::{
    Collection, CollectionOptions, FieldSpec, ReadOptions, Registry, Schema,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn schema() -> Schema {
    Schema::new()
        .field("title", FieldSpec::string())
        .field("status", FieldSpec::string().with_default("pending"))
}

fn registry() -> Registry {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Registry::default()
}

fn tasks(registry: &Registry) -> Arc<Collection> {
    registry
        .create_collection(CollectionOptions::new("tasks", schema()).lockable())
        .unwrap()
}

fn drafts(registry: &Registry) -> Arc<Collection> {
    registry
        .create_collection(CollectionOptions::new("drafts", schema()).versioned())
        .unwrap()
}

fn seed(collection: &Arc<Collection>, titles: &[&str]) {
    for title in titles {
        collection
            .create_document(json!({"_id": title, "title": title}))
            .unwrap()
            .save()
            .unwrap();
    }
}

fn load(collection: &Arc<Collection>, id: &str) -> trellis_engine::Document {
    collection.get(id, &ReadOptions::new()).unwrap().unwrap()
}

// ============================================================================
// Locks
// ============================================================================

mod locks {
    use super::*;

    #[test]
    fn test_second_instance_cannot_lock() {
        let registry = registry();
        let tasks = tasks(&registry);
        seed(&tasks, &["t1"]);
        let first = load(&tasks, "t1");
        let second = load(&tasks, "t1");

        assert!(first.lock().unwrap());
        assert!(first.lock_holder().is_some());
        assert!(!second.lock().unwrap());

        assert!(first.unlock().unwrap());
        assert!(!first.unlock().unwrap());
        assert!(second.lock().unwrap());
    }

    #[test]
    fn test_lock_survives_save() {
        let registry = registry();
        let tasks = tasks(&registry);
        seed(&tasks, &["t1"]);
        let doc = load(&tasks, "t1");
        assert!(doc.lock().unwrap());
        doc.set("status", "running").unwrap();
        doc.save().unwrap();

        let stored = tasks.driver().get(doc.id()).unwrap().unwrap();
        assert!(stored.field(LOCKED_BY_FIELD).is_some());
        assert!(!load(&tasks, "t1").lock().unwrap());
    }

    #[test]
    fn test_expired_lock_can_be_taken() {
        let registry = registry();
        let tasks = registry
            .create_collection(
                CollectionOptions::new("tasks", schema())
                    .lockable()
                    .lock_timeout(Duration::from_millis(20)),
            )
            .unwrap();
        seed(&tasks, &["t1"]);
        assert!(load(&tasks, "t1").lock().unwrap());
        thread::sleep(Duration::from_millis(50));
        assert!(load(&tasks, "t1").lock().unwrap());
    }

    #[test]
    fn test_expired_claim_is_not_trusted_after_takeover() {
        let registry = registry();
        let tasks = registry
            .create_collection(
                CollectionOptions::new("tasks", schema())
                    .lockable()
                    .lock_timeout(Duration::from_millis(20)),
            )
            .unwrap();
        seed(&tasks, &["t1"]);
        let first = load(&tasks, "t1");
        let second = load(&tasks, "t1");

        assert!(first.lock().unwrap());
        thread::sleep(Duration::from_millis(50));
        assert!(first.lock_holder().is_none());
        assert!(second.lock().unwrap());
        let holder = second.lock_holder().unwrap();

        assert!(!first.lock().unwrap());
        assert!(!first.unlock().unwrap());
        let stored = tasks.driver().get(first.id()).unwrap().unwrap();
        assert_eq!(
            stored.field(LOCKED_BY_FIELD).and_then(|v| v.as_str()),
            Some(holder.to_string().as_str())
        );
    }

    #[test]
    fn test_expired_claim_is_renewed() {
        let registry = registry();
        let tasks = registry
            .create_collection(
                CollectionOptions::new("tasks", schema())
                    .lockable()
                    .lock_timeout(Duration::from_millis(20)),
            )
            .unwrap();
        seed(&tasks, &["t1"]);
        let doc = load(&tasks, "t1");
        assert!(doc.lock().unwrap());
        let before = doc.lock_holder().unwrap();
        thread::sleep(Duration::from_millis(50));

        assert!(doc.lock().unwrap());
        assert_ne!(doc.lock_holder().unwrap(), before);
        assert!(doc.unlock().unwrap());
    }

    #[test]
    fn test_new_document_reserves_lock_until_created() {
        let registry = registry();
        let tasks = tasks(&registry);
        let doc = tasks.create_document(json!({"_id": "t1", "title": "t1"})).unwrap();
        assert!(doc.lock().unwrap());
        doc.save().unwrap();

        assert!(!load(&tasks, "t1").lock().unwrap());
        assert!(doc.unlock().unwrap());
        assert!(load(&tasks, "t1").lock().unwrap());
    }

    #[test]
    fn test_lock_on_plain_collection_is_bad_request() {
        let registry = registry();
        let drafts = drafts(&registry);
        seed(&drafts, &["d1"]);
        assert_eq!(
            load(&drafts, "d1").lock().unwrap_err().code(),
            ErrorCode::BadRequest
        );
    }

    #[test]
    fn test_concurrent_lockers_have_one_winner() {
        let registry = registry();
        let tasks = tasks(&registry);
        seed(&tasks, &["t1"]);
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let doc = load(&tasks, "t1");
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    doc.lock().unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}

// ============================================================================
// Lock retrieve release
// ============================================================================

mod lock_retrieve_release {
    use super::*;

    #[test]
    fn test_batch_holds_and_releases_locks() {
        let registry = registry();
        let tasks = tasks(&registry);
        seed(&tasks, &["t1", "t2", "t3"]);

        let batch = tasks
            .lock_retrieve_release(json!({"status": "pending"}), &ReadOptions::new())
            .unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|d| d.lock_holder().is_some()));

        let again = tasks
            .lock_retrieve_release(json!({"status": "pending"}), &ReadOptions::new())
            .unwrap();
        assert!(again.is_empty());

        assert_eq!(batch.release_locks().unwrap(), 3);
        assert_eq!(batch.release_locks().unwrap(), 0);
        assert!(batch.iter().all(|d| d.lock_holder().is_none()));

        let after = tasks
            .lock_retrieve_release(json!({"status": "pending"}), &ReadOptions::new())
            .unwrap();
        assert_eq!(after.len(), 3);
    }

    #[test]
    fn test_overlapping_callers_never_share_records() {
        let registry = registry();
        let tasks = tasks(&registry);
        let titles: Vec<String> = (0..20).map(|i| format!("t{}", i)).collect();
        seed(&tasks, &titles.iter().map(String::as_str).collect::<Vec<_>>());

        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let tasks = Arc::clone(&tasks);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    tasks
                        .lock_retrieve_release(json!({}), &ReadOptions::new())
                        .unwrap()
                        .ids()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "record locked twice");
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn test_requires_lockable_collection() {
        let registry = registry();
        let drafts = drafts(&registry);
        let err = drafts
            .lock_retrieve_release(json!({}), &ReadOptions::new())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }

    #[test]
    fn test_invalid_populate_path_locks_nothing() {
        let registry = registry();
        let tasks = tasks(&registry);
        seed(&tasks, &["t1"]);
        let err = tasks
            .lock_retrieve_release(json!({}), &ReadOptions::new().populate(["title"]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
        assert!(load(&tasks, "t1").lock().unwrap());
    }
}

// ============================================================================
// Freeze
// ============================================================================

mod freeze {
    use super::*;

    #[test]
    fn test_frozen_document_rejects_writes() {
        let registry = registry();
        let drafts = drafts(&registry);
        seed(&drafts, &["d1"]);
        let doc = load(&drafts, "d1");

        assert!(doc.freeze().unwrap());
        assert!(doc.is_frozen());
        assert_eq!(doc.set("title", "x").unwrap_err().code(), ErrorCode::BadRequest);
        assert_eq!(doc.save().unwrap_err().code(), ErrorCode::BadRequest);
        assert_eq!(doc.delete().unwrap_err().code(), ErrorCode::BadRequest);

        let other = load(&drafts, "d1");
        assert!(other.is_frozen());
        assert_eq!(other.set("title", "x").unwrap_err().code(), ErrorCode::BadRequest);

        assert!(doc.unfreeze().unwrap());
        doc.set("title", "thawed").unwrap();
        doc.save().unwrap();
    }

    #[test]
    fn test_freeze_requires_saved_document() {
        let registry = registry();
        let drafts = drafts(&registry);
        let doc = drafts.create_document(json!({"title": "new"})).unwrap();
        assert_eq!(doc.freeze().unwrap_err().code(), ErrorCode::BadRequest);
    }

    #[test]
    fn test_freeze_of_removed_record_reports_false() {
        let registry = registry();
        let drafts = drafts(&registry);
        seed(&drafts, &["d1"]);
        let doc = load(&drafts, "d1");
        drafts.driver().delete(doc.id()).unwrap();

        assert!(!doc.freeze().unwrap());
        assert!(!doc.is_frozen());
    }
}

// ============================================================================
// Versioning
// ============================================================================

mod versioning {
    use super::*;

    #[test]
    fn test_save_archives_previous_state() {
        let registry = registry();
        let drafts = drafts(&registry);
        let doc = drafts
            .create_document(json!({"_id": "d1", "title": "first"}))
            .unwrap();
        doc.save().unwrap();
        assert_eq!(doc.version(), 1);
        assert!(doc.versions().unwrap().is_empty());

        doc.set("title", "second").unwrap();
        doc.save().unwrap();
        doc.set("title", "third").unwrap();
        doc.commit().unwrap();
        assert_eq!(doc.version(), 3);

        let history = doc.versions().unwrap();
        let titles: Vec<JsonValue> = history
            .iter()
            .map(|v| v.field("title").cloned().unwrap_or_default())
            .collect();
        assert_eq!(
            titles,
            vec![JsonValue::from("first"), JsonValue::from("second")]
        );

        let stored = drafts.driver().get(doc.id()).unwrap().unwrap();
        assert_eq!(stored.field("_version"), Some(&JsonValue::from(3u64)));
        assert!(stored.field("_lastModified").is_some());
    }

    #[test]
    fn test_unchanged_document_does_not_archive() {
        let registry = registry();
        let drafts = drafts(&registry);
        seed(&drafts, &["d1"]);
        let doc = load(&drafts, "d1");
        doc.set("title", "d1").unwrap();
        doc.save().unwrap();
        assert!(doc.versions().unwrap().is_empty());
        assert_eq!(doc.version(), 1);
    }

    #[test]
    fn test_delete_archives_final_state() {
        let registry = registry();
        let drafts = drafts(&registry);
        seed(&drafts, &["d1"]);
        let doc = load(&drafts, "d1");
        doc.set("title", "edited").unwrap();
        doc.save().unwrap();
        doc.delete().unwrap();

        let history = drafts.versions(&"d1".into()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[1].field("title"),
            Some(&JsonValue::from("edited"))
        );
        assert!(drafts.driver().get(&"d1".into()).unwrap().is_none());
    }

    #[test]
    fn test_versions_on_plain_collection_is_bad_request() {
        let registry = registry();
        let tasks = tasks(&registry);
        assert_eq!(
            tasks.versions(&"t1".into()).unwrap_err().code(),
            ErrorCode::BadRequest
        );
    }

    #[test]
    fn test_concurrent_writers_never_reuse_a_version() {
        let registry = registry();
        let drafts = drafts(&registry);
        seed(&drafts, &["d1"]);
        let threads = 6;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let doc = load(&drafts, "d1");
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    doc.set("title", format!("writer {}", i)).unwrap();
                    barrier.wait();
                    doc.commit().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let history = drafts.versions(&"d1".into()).unwrap();
        let numbers: HashSet<u64> = history
            .iter()
            .filter_map(|v| v.field("_version").and_then(|n| n.as_u64()))
            .collect();
        assert_eq!(numbers.len(), threads);
        assert_eq!(history.len(), threads);
    }
}
