//! Offline-first cache of workout records.
//!
//! `EventCacheStore` is the only thing the UI reads from. It hydrates from the
//! persisted snapshot on `initialize()`, then refreshes from the relays in the
//! background. Readers always see a complete index: each merge builds a new
//! `CacheIndex` off to the side and swaps the `Arc` in one step.
//!
//! Phase: `Uninitialized -> Loading -> Ready`, with `Ready -> Refreshing -> Ready`
//! while a refresh is in flight. Reads never wait on either.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Local;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use nostr_sdk::{Event, Filter, Kind, Timestamp};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::blob::BlobStore;
use super::snapshot::{invalidate_snapshot, load_snapshot, save_snapshot};
use crate::config::CacheConfig;
use crate::constants::{kinds, SECS_PER_DAY};
use crate::error::CoreError;
use crate::models::WorkoutRecord;
use crate::relay::{QueryResolution, RelayPoolManager, SubscriptionRunner};
use crate::{tlog, unix_now};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePhase {
    Uninitialized,
    Loading,
    Ready,
    Refreshing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    pub phase: CachePhase,
    pub is_loading: bool,
    /// Why the last refresh failed; cleared by the next successful one.
    pub error: Option<String>,
    pub record_count: usize,
    pub last_refreshed_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed {
        fetched: usize,
        /// Events that failed to parse.
        skipped: usize,
        total: usize,
    },
    /// The app was backgrounded; nothing was attempted.
    Skipped,
    Failed(String),
}

type Subscriber = Arc<dyn Fn(&[WorkoutRecord]) + Send + Sync>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

#[derive(Debug, Default)]
struct CacheIndex {
    by_id: HashMap<String, WorkoutRecord>,
    by_owner: HashMap<String, Vec<String>>,
    by_group: HashMap<String, Vec<String>>,
    by_day: BTreeMap<u64, Vec<String>>,
}

impl CacheIndex {
    fn from_records(records: impl IntoIterator<Item = WorkoutRecord>) -> Self {
        Self::build(HashMap::new(), records)
    }

    /// A new index holding this one's records upserted with `records`.
    /// Later records win on id collisions.
    fn merged_with(&self, records: impl IntoIterator<Item = WorkoutRecord>) -> Self {
        Self::build(self.by_id.clone(), records)
    }

    fn build(
        mut by_id: HashMap<String, WorkoutRecord>,
        records: impl IntoIterator<Item = WorkoutRecord>,
    ) -> Self {
        for record in records {
            by_id.insert(record.id.clone(), record);
        }

        let mut by_owner: HashMap<String, Vec<String>> = HashMap::new();
        let mut by_group: HashMap<String, Vec<String>> = HashMap::new();
        let mut by_day: BTreeMap<u64, Vec<String>> = BTreeMap::new();
        for (id, record) in &by_id {
            by_owner
                .entry(record.pubkey.clone())
                .or_default()
                .push(id.clone());
            if let Some(team) = &record.team {
                by_group.entry(team.clone()).or_default().push(id.clone());
            }
            by_day.entry(record.day_bucket()).or_default().push(id.clone());
        }

        Self {
            by_id,
            by_owner,
            by_group,
            by_day,
        }
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }

    fn resolve<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> Vec<WorkoutRecord> {
        let mut records: Vec<WorkoutRecord> = ids
            .into_iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect();
        sort_newest_first(&mut records);
        records
    }

    fn all(&self) -> Vec<WorkoutRecord> {
        self.resolve(self.by_id.keys())
    }
}

fn sort_newest_first(records: &mut [WorkoutRecord]) {
    records.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

struct CacheState {
    phase: CachePhase,
    is_loading: bool,
    error: Option<String>,
    last_refreshed_at: Option<u64>,
}

struct CacheInner {
    pool: RelayPoolManager,
    runner: SubscriptionRunner,
    blob: Arc<dyn BlobStore>,
    config: CacheConfig,
    runtime: Handle,
    index: RwLock<Arc<CacheIndex>>,
    /// Serializes read-modify-swap of `index`; never held across `.await`.
    merge_lock: Mutex<()>,
    state: Mutex<CacheState>,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_subscriber_id: AtomicU64,
    init: OnceCell<usize>,
    in_flight: Mutex<Option<SharedRefresh>>,
}

#[derive(Clone)]
pub struct EventCacheStore {
    inner: Arc<CacheInner>,
}

/// Returned by [`EventCacheStore::subscribe`].
pub struct CacheSubscription {
    id: u64,
    store: Weak<CacheInner>,
}

impl CacheSubscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.store.upgrade() {
            inner.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Handle for [`EventCacheStore::spawn_refresh_schedule`]. Dropping it stops
/// the schedule.
pub struct RefreshSchedule {
    task: JoinHandle<()>,
}

impl RefreshSchedule {
    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for RefreshSchedule {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl EventCacheStore {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        pool: RelayPoolManager,
        runner: SubscriptionRunner,
        blob: Arc<dyn BlobStore>,
        config: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                pool,
                runner,
                blob,
                config,
                runtime: Handle::current(),
                index: RwLock::new(Arc::new(CacheIndex::default())),
                merge_lock: Mutex::new(()),
                state: Mutex::new(CacheState {
                    phase: CachePhase::Uninitialized,
                    is_loading: false,
                    error: None,
                    last_refreshed_at: None,
                }),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(1),
                init: OnceCell::new(),
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Hydrate from the snapshot and start a background refresh. Concurrent
    /// and repeated calls share the first call's result: the number of
    /// records loaded from disk.
    pub async fn initialize(&self) -> usize {
        let inner = self.inner.clone();
        *self
            .inner
            .init
            .get_or_init(|| async move {
                let loaded = inner.hydrate();
                let background = inner.clone();
                inner.runtime.spawn(async move {
                    background.refresh().await;
                });
                loaded
            })
            .await
    }

    /// Fetch the rolling window from the relays and fold it into the cache.
    /// Overlapping calls share one in-flight refresh and see the same outcome.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.inner.refresh().await
    }

    /// Fold already-fetched events through the same parse/merge/persist/notify
    /// path as a refresh. Returns how many records were accepted.
    pub fn ingest(&self, events: &[Event]) -> usize {
        let (records, skipped) = parse_events(events);
        let accepted = records.len();
        if accepted == 0 {
            return 0;
        }
        self.inner.merge_and_persist(records);
        tlog!("CACHE", "ingested {} record(s), skipped {}", accepted, skipped);
        self.inner.notify_subscribers();
        accepted
    }

    /// Drop every record from memory and from the persisted snapshot.
    pub fn clear_all(&self) -> Result<(), CoreError> {
        {
            let _guard = self.inner.merge_lock.lock();
            *self.inner.index.write() = Arc::new(CacheIndex::default());
            invalidate_snapshot(self.inner.blob.as_ref(), &self.inner.config.snapshot_key)?;
        }
        self.inner.state.lock().error = None;
        tlog!("CACHE", "cache cleared");
        self.inner.notify_subscribers();
        Ok(())
    }

    /// Refresh every `interval` while foregrounded. Ticks that land while the
    /// app is backgrounded are skipped.
    pub fn spawn_refresh_schedule(&self, interval: Duration) -> RefreshSchedule {
        let weak = Arc::downgrade(&self.inner);
        let task = self.inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.pool.gate().can_operate() {
                    tlog!("CACHE", "scheduled refresh skipped while backgrounded");
                    continue;
                }
                inner.refresh().await;
            }
        });
        RefreshSchedule { task }
    }

    /// Fires `callback` immediately with the current records, then once per
    /// completed refresh, ingest or clear.
    pub fn subscribe<F>(&self, callback: F) -> CacheSubscription
    where
        F: Fn(&[WorkoutRecord]) + Send + Sync + 'static,
    {
        let callback: Subscriber = Arc::new(callback);
        let records = self.all();
        invoke_guarded(&callback, &records);

        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, callback));
        CacheSubscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn status(&self) -> CacheStatus {
        let record_count = self.snapshot().len();
        let state = self.inner.state.lock();
        CacheStatus {
            phase: state.phase,
            is_loading: state.is_loading,
            error: state.error.clone(),
            record_count,
            last_refreshed_at: state.last_refreshed_at,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<WorkoutRecord> {
        self.snapshot().by_id.get(id).cloned()
    }

    /// Every record, newest first.
    pub fn all(&self) -> Vec<WorkoutRecord> {
        self.snapshot().all()
    }

    pub fn by_owner(&self, pubkey: &str) -> Vec<WorkoutRecord> {
        let index = self.snapshot();
        match index.by_owner.get(pubkey) {
            Some(ids) => index.resolve(ids),
            None => Vec::new(),
        }
    }

    pub fn by_group(&self, team: &str) -> Vec<WorkoutRecord> {
        let index = self.snapshot();
        match index.by_group.get(team) {
            Some(ids) => index.resolve(ids),
            None => Vec::new(),
        }
    }

    /// Records with `since <= created_at <= until` (unix seconds), newest first.
    pub fn in_range(&self, since: u64, until: u64) -> Vec<WorkoutRecord> {
        if since > until {
            return Vec::new();
        }
        let index = self.snapshot();
        let ids = index
            .by_day
            .range(since / SECS_PER_DAY..=until / SECS_PER_DAY)
            .flat_map(|(_, ids)| ids.iter())
            .filter(|id| {
                index
                    .by_id
                    .get(*id)
                    .is_some_and(|r| r.created_at >= since && r.created_at <= until)
            });
        index.resolve(ids)
    }

    /// Records created since local midnight.
    pub fn today(&self) -> Vec<WorkoutRecord> {
        let now = unix_now();
        let midnight = Local::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| dt.and_local_timezone(Local).earliest())
            .map(|dt| dt.timestamp().max(0) as u64)
            .unwrap_or(now - now % SECS_PER_DAY);
        self.in_range(midnight, midnight + SECS_PER_DAY - 1)
    }

    fn snapshot(&self) -> Arc<CacheIndex> {
        self.inner.index.read().clone()
    }
}

impl CacheInner {
    /// Load the persisted snapshot into the index. Returns the record count.
    fn hydrate(&self) -> usize {
        self.state.lock().phase = CachePhase::Loading;
        let started = Instant::now();

        let loaded = match load_snapshot(self.blob.as_ref(), &self.config.snapshot_key) {
            Ok(Some(snapshot)) => {
                let count = snapshot.records.len();
                let _guard = self.merge_lock.lock();
                *self.index.write() = Arc::new(CacheIndex::from_records(snapshot.records));
                count
            }
            Ok(None) => 0,
            Err(e) => {
                tlog!("ERROR", "failed to read snapshot: {}", e);
                self.state.lock().error = Some(e.to_string());
                0
            }
        };

        self.state.lock().phase = CachePhase::Ready;
        tlog!(
            "PERF",
            "hydrated {} record(s) from snapshot in {:?}",
            loaded,
            started.elapsed()
        );
        loaded
    }

    fn refresh(self: &Arc<Self>) -> SharedRefresh {
        let mut in_flight = self.in_flight.lock();
        if let Some(refresh) = in_flight.as_ref() {
            tlog!("CACHE", "refresh already in flight, joining it");
            return refresh.clone();
        }

        // Run on the runtime so the refresh completes even if every caller
        // stops polling.
        let inner = self.clone();
        let task = self.runtime.spawn(async move {
            let outcome = match AssertUnwindSafe(inner.run_refresh()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tlog!("ERROR", "refresh panicked");
                    inner.fail_refresh("refresh panicked".to_string())
                }
            };
            // Blocks until the caller below has stored the shared future
            *inner.in_flight.lock() = None;
            outcome
        });
        let weak = Arc::downgrade(self);
        let refresh = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let reason = format!("refresh task failed: {}", e);
                    match weak.upgrade() {
                        Some(inner) => {
                            *inner.in_flight.lock() = None;
                            inner.fail_refresh(reason)
                        }
                        None => RefreshOutcome::Failed(reason),
                    }
                }
            }
        }
        .boxed()
        .shared();

        *in_flight = Some(refresh.clone());
        refresh
    }

    async fn run_refresh(&self) -> RefreshOutcome {
        if !self.pool.gate().can_operate() {
            tlog!("CACHE", "refresh skipped while backgrounded");
            return RefreshOutcome::Skipped;
        }

        {
            let mut state = self.state.lock();
            state.is_loading = true;
            if state.phase == CachePhase::Ready {
                state.phase = CachePhase::Refreshing;
            }
        }

        let started = Instant::now();
        let timeout = self.config.refresh_timeout();
        let result = match tokio::time::timeout(timeout, self.fetch_and_merge()).await {
            Ok(result) => result,
            Err(_) => Err(format!("refresh timed out after {:?}", timeout)),
        };

        let outcome = {
            let mut state = self.state.lock();
            state.is_loading = false;
            if state.phase == CachePhase::Refreshing {
                state.phase = CachePhase::Ready;
            }
            match result {
                Ok((fetched, skipped, total)) => {
                    state.error = None;
                    state.last_refreshed_at = Some(unix_now());
                    RefreshOutcome::Completed {
                        fetched,
                        skipped,
                        total,
                    }
                }
                Err(reason) => {
                    state.error = Some(reason.clone());
                    RefreshOutcome::Failed(reason)
                }
            }
        };

        match &outcome {
            RefreshOutcome::Completed { .. } => {
                tlog!("PERF", "refresh completed in {:?}: {:?}", started.elapsed(), outcome);
                self.notify_subscribers();
            }
            _ => tlog!("CACHE", "refresh failed after {:?}: {:?}", started.elapsed(), outcome),
        }
        outcome
    }

    /// Settle the state of a refresh that never reached its normal exit.
    fn fail_refresh(&self, reason: String) -> RefreshOutcome {
        let mut state = self.state.lock();
        state.is_loading = false;
        if state.phase == CachePhase::Refreshing {
            state.phase = CachePhase::Ready;
        }
        state.error = Some(reason.clone());
        RefreshOutcome::Failed(reason)
    }

    /// Returns `(fetched, skipped, total)` on success.
    async fn fetch_and_merge(&self) -> Result<(usize, usize, usize), String> {
        self.pool.get_pool();
        let wanted = self.config.min_relays_for_refresh;
        if !self
            .pool
            .wait_for_minimum(wanted, self.config.min_connectivity_wait())
            .await
        {
            let status = self.pool.status();
            if status.connected == 0 {
                return Err("no relays connected".to_string());
            }
            tlog!(
                "CACHE",
                "refreshing with partial connectivity ({}/{})",
                status.connected,
                status.total
            );
        }
        if !self.pool.gate().can_operate() {
            return Err("app backgrounded during refresh".to_string());
        }

        let since = unix_now().saturating_sub(self.config.refresh_window_days * SECS_PER_DAY);
        let filter = Filter::new()
            .kind(Kind::Custom(kinds::WORKOUT_RECORD))
            .since(Timestamp::from(since));
        let result = self
            .runner
            .run(filter, self.runner.default_options())
            .await
            .map_err(|e| e.to_string())?;

        match result.resolution {
            QueryResolution::NoRelays => return Err("no relays connected".to_string()),
            QueryResolution::Cancelled => return Err("app backgrounded during refresh".to_string()),
            _ => {}
        }

        let fetched = result.events.len();
        let (records, skipped) = parse_events(&result.events);
        let total = self.merge_and_persist(records);
        Ok((fetched, skipped, total))
    }

    /// Swap in a new index with `records` upserted, then persist it. Returns
    /// the new record count.
    ///
    /// The save happens under `merge_lock` so snapshots reach the blob store
    /// in the same order the indexes were swapped in.
    fn merge_and_persist(&self, records: Vec<WorkoutRecord>) -> usize {
        let _guard = self.merge_lock.lock();
        let current = self.index.read().clone();
        let next = Arc::new(current.merged_with(records));
        *self.index.write() = next.clone();

        if let Err(e) = save_snapshot(self.blob.as_ref(), &self.config.snapshot_key, next.all()) {
            tlog!("ERROR", "failed to persist snapshot: {}", e);
        }
        next.len()
    }

    fn notify_subscribers(&self) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        if subscribers.is_empty() {
            return;
        }
        let records = self.index.read().all();
        for callback in &subscribers {
            invoke_guarded(callback, &records);
        }
    }
}

fn invoke_guarded(callback: &Subscriber, records: &[WorkoutRecord]) {
    if catch_unwind(AssertUnwindSafe(|| callback(records))).is_err() {
        tlog!("ERROR", "cache subscriber panicked");
    }
}

/// Parse each event, skipping (and counting) the ones that fail.
fn parse_events(events: &[Event]) -> (Vec<WorkoutRecord>, usize) {
    let mut records = Vec::with_capacity(events.len());
    let mut skipped = 0;
    for event in events {
        match WorkoutRecord::from_event(event) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                tlog!("CACHE", "skipping event {}: {}", event.id.to_hex(), e);
            }
        }
    }
    (records, skipped)
}
