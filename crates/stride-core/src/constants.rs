//! Application-wide constants
//!
//! Centralized location for default timeouts, thresholds and event kinds
//! that are used across multiple modules. Every timeout here is only a
//! default; `CoreConfig` carries the values actually in effect.

/// Fallback relay set used when no relay list is configured
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
];

/// Blob store key the workout snapshot is persisted under
pub const SNAPSHOT_KEY: &str = "workout_snapshot";

// Lifecycle
pub const FOREGROUND_SETTLE_MS: u64 = 500;
pub const BACKGROUND_GRACE_MS: u64 = 50;

// Pool
/// Per-endpoint connect timeout
pub const CONNECT_TIMEOUT_MS: u64 = 2_000;
/// Delay before the single retry after a connect attempt reached zero relays
pub const CONNECT_RETRY_DELAY_MS: u64 = 2_000;
/// At most one disconnect-triggered reconnect per window
pub const RECONNECT_COOLDOWN_MS: u64 = 10_000;
pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
pub const STATUS_POLL_INTERVAL_MS: u64 = 100;
/// Below this many connected relays the pool schedules a reconnect
pub const MIN_CONNECTED_RELAYS: usize = 2;
/// Minimum-connectivity wait used by refreshes
pub const MIN_CONNECTIVITY_WAIT_MS: u64 = 3_000;

// Subscriptions
pub const SUBSCRIPTION_HARD_TIMEOUT_MS: u64 = 5_000;
pub const EARLY_EXIT_COUNT: usize = 100;
/// Buffer for standing subscription delivery channels
pub const STANDING_CHANNEL_CAPACITY: usize = 256;

// Cache
/// Outer guard around a whole refresh cycle
pub const REFRESH_TIMEOUT_MS: u64 = 15_000;
/// Records created within this many days are requested on refresh
pub const REFRESH_WINDOW_DAYS: u64 = 30;
pub const SECS_PER_DAY: u64 = 24 * 60 * 60;

// Dedup
pub const DEDUP_TTL_MS: u64 = 5 * 60 * 1000;
pub const DEDUP_MAX_ENTRIES: usize = 10_000;

// Nostr event kinds
pub mod kinds {
    /// Workout record
    pub const WORKOUT_RECORD: u16 = 1301;
}
