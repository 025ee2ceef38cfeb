pub mod config;
pub mod constants;
pub mod dedup;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod relay;
pub mod runtime;
pub mod stats;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

pub use config::CoreConfig;
pub use dedup::TtlDeduplicator;
pub use error::{CoreError, ParseError, TransportError};
pub use lifecycle::{AppState, LifecycleGate};
pub use models::WorkoutRecord;
pub use relay::{PoolStatus, QueryResolution, RelayPoolManager, SubscriptionRunner};
pub use runtime::CoreRuntime;
pub use store::{CacheStatus, EventCacheStore, RefreshOutcome};

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
