//! Optimistic versioning: version-chain archival
//!
//! Before a versioned record is overwritten, its pre-mutation snapshot is
//! written to the version collection as an immutable version record:
//!
//! ```text
//! { ...snapshot, "_id": <fresh>, "_version": n, "_lastModified": <ms>,
//!   "_activeVersion": { "_id": <active id>, "_collection": <active collection> } }
//! ```
//!
//! The version collection carries a unique index on
//! `(_activeVersion._id, _activeVersion._collection, _version)`. Two writers
//! archiving the same number collide on that index; the loser moves to the next
//! number and tries again. The number of retries is bounded by the caller.
//!
//! Version numbers start at [`INITIAL_VERSION`]. After archiving version `n`
//! the active record carries `_version = n + 1`.

use tracing::{debug, warn};
use trellis_core::{
    ConflictKind, DocId, Error, ErrorCode, IndexSpec, JsonValue, Result, StorageDriver,
    Timestamp, ACTIVE_VERSION_FIELD, COLLECTION_FIELD, ID_FIELD, LAST_MODIFIED_FIELD,
    LOCK_FIELDS, VERSION_FIELD,
};

/// Version number of a record that was never archived
pub const INITIAL_VERSION: u64 = 1;

/// Unique index every version collection must carry
pub fn version_index() -> IndexSpec {
    IndexSpec::unique([
        format!("{}.{}", ACTIVE_VERSION_FIELD, ID_FIELD),
        format!("{}.{}", ACTIVE_VERSION_FIELD, COLLECTION_FIELD),
        VERSION_FIELD.to_string(),
    ])
    .named("active_version")
}

/// Current version number of a record
///
/// Records without `_version` are at [`INITIAL_VERSION`].
pub fn version_of(raw: &JsonValue) -> u64 {
    raw.field(VERSION_FIELD)
        .and_then(|v| v.as_u64())
        .unwrap_or(INITIAL_VERSION)
}

/// Write `_version` and `_lastModified` on an active record
pub fn stamp_version(raw: &mut JsonValue, version: u64, now: Timestamp) {
    if let Some(obj) = raw.as_object_mut() {
        obj.insert(VERSION_FIELD.to_string(), serde_json::Value::from(version));
        obj.insert(
            LAST_MODIFIED_FIELD.to_string(),
            now.to_json().into_inner(),
        );
    }
}

/// Build the version record archiving `snapshot` as version `version`
pub fn version_record(
    collection: &str,
    snapshot: &JsonValue,
    version: u64,
    now: Timestamp,
) -> Result<JsonValue> {
    let active_id = DocId::of_record(snapshot)
        .ok_or_else(|| Error::internal("cannot archive a snapshot without _id"))?;
    let mut record = snapshot.clone();
    let obj = record
        .as_object_mut()
        .ok_or_else(|| Error::internal("cannot archive a non-object snapshot"))?;
    for field in LOCK_FIELDS {
        obj.remove(field);
    }
    obj.insert(
        ID_FIELD.to_string(),
        DocId::generate().to_json().into_inner(),
    );
    obj.insert(
        ACTIVE_VERSION_FIELD.to_string(),
        serde_json::json!({ ID_FIELD: active_id.as_str(), COLLECTION_FIELD: collection }),
    );
    stamp_version(&mut record, version, now);
    Ok(record)
}

/// Archive `snapshot` into `versions`, starting at `start_version`
///
/// Returns the version number actually archived. A duplicate-key rejection
/// means another writer archived that number first: the number is bumped and
/// the write retried, at most `max_retries` times (`None` = no bound).
pub fn archive(
    versions: &dyn StorageDriver,
    collection: &str,
    snapshot: &JsonValue,
    start_version: u64,
    max_retries: Option<u32>,
) -> Result<u64> {
    let mut version = start_version;
    let mut retries: u32 = 0;
    loop {
        let record = version_record(collection, snapshot, version, Timestamp::now())?;
        match versions.create(&record, None) {
            Ok(()) => {
                debug!(collection, version, retries, "archived version");
                return Ok(version);
            }
            Err(e) if e.code() == ErrorCode::DuplicateKey => {
                retries += 1;
                if max_retries.is_some_and(|max| retries > max) {
                    warn!(collection, version, retries, "version archive retries exhausted");
                    return Err(Error::Conflict {
                        collection: Some(collection.to_string()),
                        kind: ConflictKind::VersionArchiveRace,
                        index: version_index().fields,
                        message: format!(
                            "gave up archiving after {} attempts, last tried version {}",
                            retries, version
                        ),
                    });
                }
                debug!(collection, version, "version already archived, retrying");
                version += 1;
            }
            Err(e) => return Err(e.with_collection(versions.collection_name())),
        }
    }
}

/// All archived versions of one active record, oldest first
pub fn history(versions: &dyn StorageDriver, collection: &str, id: &DocId) -> Result<Vec<JsonValue>> {
    let query = serde_json::json!({
        format!("{}.{}", ACTIVE_VERSION_FIELD, ID_FIELD): id.as_str(),
        format!("{}.{}", ACTIVE_VERSION_FIELD, COLLECTION_FIELD): collection,
    });
    let mut records = versions.find(&JsonValue::from(query))?;
    records.sort_by_key(version_of);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_storage::MemoryDriver;

    fn versions() -> MemoryDriver {
        let driver = MemoryDriver::new("versions");
        driver.build_index(&version_index()).unwrap();
        driver
    }

    fn snapshot() -> JsonValue {
        JsonValue::from(json!({
            "_id": "b1",
            "_version": 1,
            "_lockedBy": "someone",
            "_lockedAt": 5,
            "title": "Dune",
        }))
    }

    #[test]
    fn test_version_of_defaults_to_initial() {
        assert_eq!(version_of(&JsonValue::object()), INITIAL_VERSION);
        assert_eq!(version_of(&JsonValue::from(json!({"_version": 7}))), 7);
    }

    #[test]
    fn test_version_record_shape() {
        let record = version_record("books", &snapshot(), 3, Timestamp::from_millis(10)).unwrap();
        assert_ne!(record.field("_id").unwrap().as_str(), Some("b1"));
        assert_eq!(record.field("_version").unwrap().as_u64(), Some(3));
        assert_eq!(record.field("_lastModified").unwrap().as_u64(), Some(10));
        assert_eq!(
            record.field("_activeVersion").unwrap().as_inner(),
            &json!({"_id": "b1", "_collection": "books"})
        );
        assert!(record.field("_lockedBy").is_none());
        assert_eq!(record.field("title").unwrap().as_str(), Some("Dune"));
    }

    #[test]
    fn test_archive_first_version() {
        let driver = versions();
        let v = archive(&driver, "books", &snapshot(), 1, Some(4)).unwrap();
        assert_eq!(v, 1);
        assert_eq!(history(&driver, "books", &DocId::new("b1")).unwrap().len(), 1);
    }

    #[test]
    fn test_archive_retries_past_taken_numbers() {
        let driver = versions();
        archive(&driver, "books", &snapshot(), 1, None).unwrap();
        archive(&driver, "books", &snapshot(), 2, None).unwrap();
        let v = archive(&driver, "books", &snapshot(), 1, None).unwrap();
        assert_eq!(v, 3);

        let numbers: Vec<u64> = history(&driver, "books", &DocId::new("b1"))
            .unwrap()
            .iter()
            .map(version_of)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_archive_retry_bound() {
        let driver = versions();
        for v in 1..=3 {
            archive(&driver, "books", &snapshot(), v, Some(0)).unwrap();
        }
        let err = archive(&driver, "books", &snapshot(), 1, Some(1)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionArchiveRace);
    }

    #[test]
    fn test_history_is_per_collection() {
        let driver = versions();
        archive(&driver, "books", &snapshot(), 1, None).unwrap();
        archive(&driver, "films", &snapshot(), 1, None).unwrap();
        assert_eq!(history(&driver, "books", &DocId::new("b1")).unwrap().len(), 1);
        assert_eq!(history(&driver, "films", &DocId::new("b1")).unwrap().len(), 1);
        assert!(history(&driver, "books", &DocId::new("x")).unwrap().is_empty());
    }
}
