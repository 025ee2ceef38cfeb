//! Persisted snapshot of the workout cache.
//!
//! The snapshot is a versioned JSON envelope stored in a [`BlobStore`] under a
//! single key. It is discarded on load when:
//! - `SNAPSHOT_SCHEMA_VERSION` differs (a change to `WorkoutRecord` or the envelope)
//! - the blob is corrupt or not valid JSON
//!
//! `max_created_at` is kept so a future incremental refresh can start from the
//! newest known record rather than the full window.

use serde::{Deserialize, Serialize};

use super::blob::BlobStore;
use crate::error::CoreError;
use crate::models::WorkoutRecord;
use crate::{tlog, unix_now};

/// Bump whenever `WorkoutRecord` or `SnapshotEnvelope` changes shape.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    schema_version: u32,
    /// Unix seconds when written.
    saved_at: u64,
    max_created_at: u64,
    records: Vec<WorkoutRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSnapshot {
    pub records: Vec<WorkoutRecord>,
    pub saved_at: u64,
    pub max_created_at: u64,
}

pub fn save_snapshot(
    store: &dyn BlobStore,
    key: &str,
    records: Vec<WorkoutRecord>,
) -> Result<(), CoreError> {
    let max_created_at = records.iter().map(|r| r.created_at).max().unwrap_or(0);
    let envelope = SnapshotEnvelope {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        saved_at: unix_now(),
        max_created_at,
        records,
    };
    let json = serde_json::to_string(&envelope)?;
    store.set(key, &json)
}

/// `Ok(None)` when there is nothing usable; only a failing blob store errors.
pub fn load_snapshot(store: &dyn BlobStore, key: &str) -> Result<Option<LoadedSnapshot>, CoreError> {
    let Some(json) = store.get(key)? else {
        return Ok(None);
    };

    let envelope: SnapshotEnvelope = match serde_json::from_str(&json) {
        Ok(envelope) => envelope,
        Err(e) => {
            tlog!("CACHE", "snapshot '{}' is corrupt, discarding: {}", key, e);
            return Ok(None);
        }
    };

    if envelope.schema_version != SNAPSHOT_SCHEMA_VERSION {
        tlog!(
            "CACHE",
            "snapshot schema mismatch (stored={} current={}), discarding",
            envelope.schema_version,
            SNAPSHOT_SCHEMA_VERSION
        );
        return Ok(None);
    }

    Ok(Some(LoadedSnapshot {
        records: envelope.records,
        saved_at: envelope.saved_at,
        max_created_at: envelope.max_created_at,
    }))
}

pub fn invalidate_snapshot(store: &dyn BlobStore, key: &str) -> Result<(), CoreError> {
    store.remove(key)
}
