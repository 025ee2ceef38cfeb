pub mod blob;
pub mod event_cache;
pub mod snapshot;

pub use blob::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use event_cache::{
    CachePhase, CacheStatus, CacheSubscription, EventCacheStore, RefreshOutcome, RefreshSchedule,
};
pub use snapshot::{load_snapshot, save_snapshot, LoadedSnapshot, SNAPSHOT_SCHEMA_VERSION};
