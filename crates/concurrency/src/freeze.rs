//! Freeze flag
//!
//! Freezing writes `_frozen: true` on the stored record with a single patch.
//! Copies already loaded elsewhere keep accepting writes until they reload.

use tracing::error;
use trellis_core::{DocId, JsonPath, JsonValue, Patch, StorageDriver, FROZEN_FIELD};

/// Path of the freeze flag
pub fn frozen_path() -> JsonPath {
    JsonPath::root().key(FROZEN_FIELD)
}

/// Patch setting or clearing the flag
pub fn freeze_patch(frozen: bool) -> Patch {
    if frozen {
        Patch::new().set(frozen_path(), JsonValue::from(true))
    } else {
        Patch::new().unset(frozen_path())
    }
}

/// Whether a raw record is frozen
pub fn is_frozen(raw: &JsonValue) -> bool {
    raw.field(FROZEN_FIELD)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Best-effort remote flag update
///
/// Failures are logged, not returned.
pub fn set_frozen(driver: &dyn StorageDriver, id: &DocId, frozen: bool) -> bool {
    match driver.patch(id, &freeze_patch(frozen)) {
        Ok(()) => true,
        Err(e) => {
            error!(
                collection = driver.collection_name(),
                id = %id,
                frozen,
                error = %e,
                "failed to update freeze flag"
            );
            false
        }
    }
}
