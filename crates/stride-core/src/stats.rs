use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Stats for events received from relays
#[derive(Debug, Default, Clone)]
pub struct EventStats {
    /// Counts by kind -> group -> count
    /// Empty string for group means "no team"
    pub by_kind_group: HashMap<u16, HashMap<String, u64>>,
    /// Total count by kind
    pub by_kind_total: HashMap<u16, u64>,
    /// Total events received
    pub total: u64,
}

impl EventStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: u16, group: Option<&str>) {
        self.total += 1;
        *self.by_kind_total.entry(kind).or_insert(0) += 1;

        let group_key = group.unwrap_or("").to_string();
        *self
            .by_kind_group
            .entry(kind)
            .or_default()
            .entry(group_key)
            .or_insert(0) += 1;
    }

    /// Get list of kinds sorted by total count (descending)
    pub fn kinds_by_count(&self) -> Vec<(u16, u64)> {
        let mut kinds: Vec<_> = self.by_kind_total.iter().map(|(&k, &c)| (k, c)).collect();
        kinds.sort_by(|a, b| b.1.cmp(&a.1));
        kinds
    }
}

/// Thread-safe wrapper for event stats
#[derive(Debug, Clone)]
pub struct SharedEventStats {
    inner: Arc<RwLock<EventStats>>,
}

impl Default for SharedEventStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedEventStats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(EventStats::new())),
        }
    }

    pub fn record(&self, kind: u16, group: Option<&str>) {
        if let Ok(mut stats) = self.inner.write() {
            stats.record(kind, group);
        }
    }

    pub fn snapshot(&self) -> EventStats {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Point-in-time copy of the pool counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub connect_attempts: u64,
    pub reconnects_triggered: u64,
    /// Reconnect requests swallowed by the debounce window
    pub reconnects_suppressed: u64,
    pub keepalive_ticks: u64,
    /// Network work skipped because the app was backgrounded
    pub skipped_background: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    connect_attempts: AtomicU64,
    reconnects_triggered: AtomicU64,
    reconnects_suppressed: AtomicU64,
    keepalive_ticks: AtomicU64,
    skipped_background: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct SharedPoolStats {
    inner: Arc<PoolCounters>,
}

impl SharedPoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect_attempt(&self) {
        self.inner.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.inner.reconnects_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_suppressed(&self) {
        self.inner.reconnects_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keepalive_tick(&self) {
        self.inner.keepalive_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_background(&self) {
        self.inner.skipped_background.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connect_attempts: self.inner.connect_attempts.load(Ordering::Relaxed),
            reconnects_triggered: self.inner.reconnects_triggered.load(Ordering::Relaxed),
            reconnects_suppressed: self.inner.reconnects_suppressed.load(Ordering::Relaxed),
            keepalive_ticks: self.inner.keepalive_ticks.load(Ordering::Relaxed),
            skipped_background: self.inner.skipped_background.load(Ordering::Relaxed),
        }
    }
}
