//! Bounded "recently seen" set with time-based expiry.
//!
//! Guards high-volume event streams against processing the same id twice.
//! Memory stays bounded regardless of traffic: expired entries are swept
//! lazily on insert, and the oldest entries are evicted once the cap is hit.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::DedupConfig;

#[derive(Debug, Default)]
struct DedupState {
    seen: HashMap<String, Instant>,
    /// Insertion order. An id re-inserted after expiry appears twice; only the
    /// entry whose timestamp matches `seen` is live.
    order: VecDeque<(String, Instant)>,
}

/// Thread-safe TTL deduplicator. Share it via `Arc` or own one per consumer.
#[derive(Debug)]
pub struct TtlDeduplicator {
    ttl: Duration,
    max_entries: usize,
    state: Mutex<DedupState>,
}

impl TtlDeduplicator {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            state: Mutex::new(DedupState::default()),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.ttl(), config.max_entries)
    }

    /// Returns true if `id` was seen within the TTL window (state untouched).
    /// Otherwise records `id` as seen now and returns false.
    pub fn is_duplicate(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(seen_at) = state.seen.get(id) {
            if now.duration_since(*seen_at) < self.ttl {
                return true;
            }
        }

        state.seen.insert(id.to_string(), now);
        state.order.push_back((id.to_string(), now));
        self.evict(&mut state, now);
        false
    }

    fn evict(&self, state: &mut DedupState, now: Instant) {
        while let Some((front_id, front_at)) = state.order.front() {
            let live = state.seen.get(front_id) == Some(front_at);
            if !live {
                // Superseded by a later re-insert of the same id
                state.order.pop_front();
                continue;
            }

            let expired = now.duration_since(*front_at) >= self.ttl;
            let over_cap = state.seen.len() > self.max_entries;
            if !expired && !over_cap {
                break;
            }

            if let Some((id, _)) = state.order.pop_front() {
                state.seen.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.seen.clear();
        state.order.clear();
    }
}
