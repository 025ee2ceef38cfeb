//! Relay connection pool manager.
//!
//! `RelayPoolManager` is the single owner of every relay connection. Callers
//! get the pool through [`RelayPoolManager::get_pool`], which never waits on
//! the network: the first call builds a disconnected pool and dials the
//! relays in the background.
//!
//! Health is tracked from the transport's connect/disconnect messages. When
//! the connected count drops below `min_connected`, a reconnect runs at most
//! once per cooldown window no matter how many disconnects arrive. A
//! keepalive timer re-checks the pool periodically; it is cleared while the
//! app is backgrounded and restarted on return, so no timer ever touches a
//! torn-down transport.
//!
//! Partial connectivity is normal. Relays that keep failing stay in the pool
//! and are re-dialled on every reconnect cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use nostr_sdk::Event;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::transport::{PublishOutcome, RelayTransport, TransportMessage};
use crate::config::PoolConfig;
use crate::lifecycle::{AppState, LifecycleGate};
use crate::stats::{PoolStats, SharedPoolStats};
use crate::{tlog, unix_now};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub url: String,
    pub state: ConnectionState,
    /// Unix seconds of the last successful connect.
    pub last_connected_at: Option<u64>,
    pub consecutive_errors: u32,
}

impl RelayEndpoint {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: ConnectionState::Disconnected,
            last_connected_at: None,
            consecutive_errors: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub connected: usize,
}

/// The set of relay endpoints. Readable by anyone holding it; only the
/// manager in this module mutates it.
#[derive(Debug)]
pub struct RelayPool {
    endpoints: RwLock<Vec<RelayEndpoint>>,
}

impl RelayPool {
    fn new(relay_urls: &[String]) -> Self {
        let mut endpoints: Vec<RelayEndpoint> = Vec::with_capacity(relay_urls.len());
        for url in relay_urls {
            if !endpoints.iter().any(|e| &e.url == url) {
                endpoints.push(RelayEndpoint::new(url));
            }
        }
        Self {
            endpoints: RwLock::new(endpoints),
        }
    }

    pub fn status(&self) -> PoolStatus {
        let endpoints = self.endpoints.read();
        PoolStatus {
            total: endpoints.len(),
            connected: endpoints
                .iter()
                .filter(|e| e.state == ConnectionState::Connected)
                .count(),
        }
    }

    pub fn endpoints(&self) -> Vec<RelayEndpoint> {
        self.endpoints.read().clone()
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.endpoints
            .read()
            .iter()
            .filter(|e| e.state == ConnectionState::Connected)
            .map(|e| e.url.clone())
            .collect()
    }

    /// Mark every endpoint that is neither connected nor already being dialled
    /// as connecting, and return their urls. Concurrent attempts therefore
    /// never dial the same relay twice.
    fn claim_pending(&self) -> Vec<String> {
        let mut endpoints = self.endpoints.write();
        endpoints
            .iter_mut()
            .filter(|e| {
                !matches!(
                    e.state,
                    ConnectionState::Connected | ConnectionState::Connecting
                )
            })
            .map(|e| {
                e.state = ConnectionState::Connecting;
                e.url.clone()
            })
            .collect()
    }

    fn mark_connected(&self, url: &str) {
        if let Some(endpoint) = self.endpoints.write().iter_mut().find(|e| e.url == url) {
            endpoint.state = ConnectionState::Connected;
            endpoint.last_connected_at = Some(unix_now());
            endpoint.consecutive_errors = 0;
        }
    }

    fn mark_failed(&self, url: &str) {
        if let Some(endpoint) = self.endpoints.write().iter_mut().find(|e| e.url == url) {
            // A connect message may have raced ahead of the failed future
            if endpoint.state != ConnectionState::Connected {
                endpoint.state = ConnectionState::Error;
                endpoint.consecutive_errors = endpoint.consecutive_errors.saturating_add(1);
            }
        }
    }

    fn mark_disconnected(&self, url: &str) -> bool {
        if let Some(endpoint) = self.endpoints.write().iter_mut().find(|e| e.url == url) {
            if endpoint.state == ConnectionState::Connected {
                endpoint.state = ConnectionState::Disconnected;
                return true;
            }
        }
        false
    }

    fn mark_all_disconnected(&self) {
        for endpoint in self.endpoints.write().iter_mut() {
            endpoint.state = ConnectionState::Disconnected;
        }
    }
}

/// Keepalive timer state. Backgrounding clears the timer (`Paused`),
/// foregrounding starts a fresh one.
enum KeepaliveState {
    Idle,
    Running(JoinHandle<()>),
    Paused,
}

struct ManagerInner {
    config: PoolConfig,
    relay_urls: Vec<String>,
    transport: Arc<dyn RelayTransport>,
    gate: LifecycleGate,
    runtime: Handle,
    pool: OnceLock<Arc<RelayPool>>,
    connect_in_flight: AtomicBool,
    last_reconnect: Mutex<Option<Instant>>,
    keepalive: Mutex<KeepaliveState>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    stats: SharedPoolStats,
}

/// Handle to the process-wide pool manager. Clones share the same pool.
#[derive(Clone)]
pub struct RelayPoolManager {
    inner: Arc<ManagerInner>,
}

impl RelayPoolManager {
    /// Must be called from within a Tokio runtime; background connects,
    /// health monitoring and keepalive run on it.
    pub fn new(
        relay_urls: Vec<String>,
        config: PoolConfig,
        transport: Arc<dyn RelayTransport>,
        gate: LifecycleGate,
    ) -> Self {
        let inner = Arc::new(ManagerInner {
            config,
            relay_urls,
            transport,
            gate: gate.clone(),
            runtime: Handle::current(),
            pool: OnceLock::new(),
            connect_in_flight: AtomicBool::new(false),
            last_reconnect: Mutex::new(None),
            keepalive: Mutex::new(KeepaliveState::Idle),
            monitor: Mutex::new(None),
            stats: SharedPoolStats::new(),
        });

        let weak: Weak<ManagerInner> = Arc::downgrade(&inner);
        gate.on_change(move |state| {
            if let Some(inner) = weak.upgrade() {
                inner.on_lifecycle(state);
            }
        });

        Self { inner }
    }

    /// Return the pool, creating it on first use. Never blocks on I/O.
    pub fn get_pool(&self) -> Arc<RelayPool> {
        self.inner.get_pool()
    }

    /// Cheap synchronous read; never triggers I/O.
    pub fn status(&self) -> PoolStatus {
        match self.inner.pool.get() {
            Some(pool) => pool.status(),
            None => PoolStatus {
                total: self.inner.relay_urls.len(),
                connected: 0,
            },
        }
    }

    pub fn endpoints(&self) -> Vec<RelayEndpoint> {
        self.inner
            .pool
            .get()
            .map(|pool| pool.endpoints())
            .unwrap_or_default()
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.inner
            .pool
            .get()
            .map(|pool| pool.connected_urls())
            .unwrap_or_default()
    }

    pub fn transport(&self) -> Arc<dyn RelayTransport> {
        self.inner.transport.clone()
    }

    pub fn gate(&self) -> &LifecycleGate {
        &self.inner.gate
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot()
    }

    /// Dial every endpoint that is not connected and wait for the attempt.
    /// No-op while backgrounded. Counts toward the reconnect cooldown.
    pub async fn reconnect(&self) -> PoolStatus {
        let inner = &self.inner;
        if !inner.gate.can_operate() {
            inner.stats.record_skipped_background();
            return self.status();
        }
        inner.get_or_create_pool();
        *inner.last_reconnect.lock() = Some(Instant::now());
        inner.stats.record_reconnect();
        tlog!("POOL", "manual reconnect");

        let connected = inner.connect_pending().await;
        if connected > 0 {
            inner.ensure_keepalive();
        }
        self.status()
    }

    /// Debounced reconnect; returns whether an attempt was started.
    pub fn request_reconnect(&self) -> bool {
        self.inner.request_reconnect("caller")
    }

    /// Poll until at least `min_count` relays are connected or `timeout`
    /// elapses. Gives up early if the app is backgrounded.
    pub async fn wait_for_minimum(&self, min_count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let poll = self.inner.config.status_poll_interval();
        loop {
            if self.status().connected >= min_count {
                return true;
            }
            if !self.inner.gate.can_operate() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                tlog!(
                    "POOL",
                    "wait_for_minimum({}) timed out after {:?}, connected={}",
                    min_count,
                    timeout,
                    self.status().connected
                );
                return false;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Publish to every connected relay. Empty outcome when backgrounded or
    /// when no relay is connected.
    pub async fn publish(&self, event: Event) -> PublishOutcome {
        let inner = &self.inner;
        if !inner.gate.can_operate() {
            inner.stats.record_skipped_background();
            return PublishOutcome::default();
        }
        let relays = self.connected_urls();
        if relays.is_empty() {
            return PublishOutcome::default();
        }
        match inner.transport.publish(&relays, event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tlog!("ERROR", "publish failed: {}", e);
                PublishOutcome {
                    accepted: Vec::new(),
                    rejected: relays.into_iter().map(|url| (url, e.to_string())).collect(),
                }
            }
        }
    }

    /// Stop background tasks and close every connection.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.stop_keepalive(KeepaliveState::Idle);
        if let Some(monitor) = inner.monitor.lock().take() {
            monitor.abort();
        }
        if let Some(pool) = inner.pool.get() {
            for url in pool.connected_urls() {
                inner.transport.disconnect(&url).await;
            }
            pool.mark_all_disconnected();
        }
        tlog!("POOL", "shutdown complete");
    }

    #[cfg(test)]
    fn keepalive_running(&self) -> bool {
        matches!(*self.inner.keepalive.lock(), KeepaliveState::Running(_))
    }
}

impl ManagerInner {
    fn get_or_create_pool(self: &Arc<Self>) -> Arc<RelayPool> {
        let mut created = false;
        let pool = self
            .pool
            .get_or_init(|| {
                created = true;
                Arc::new(RelayPool::new(&self.relay_urls))
            })
            .clone();
        if created {
            tlog!("POOL", "pool created with {} endpoint(s)", pool.status().total);
            self.start_monitor();
        }
        pool
    }

    fn get_pool(self: &Arc<Self>) -> Arc<RelayPool> {
        let pool = self.get_or_create_pool();
        let status = pool.status();
        if status.connected == 0 {
            self.spawn_connect(false);
        } else if status.connected < self.config.min_connected {
            self.request_reconnect("degraded pool");
        }
        pool
    }

    /// Kick off a background connect unless one is already running. A
    /// first attempt that reaches no relay schedules exactly one retry.
    /// Returns whether a pass was started.
    fn spawn_connect(self: &Arc<Self>, is_retry: bool) -> bool {
        if !self.gate.can_operate() {
            self.stats.record_skipped_background();
            return false;
        }
        if self.connect_in_flight.swap(true, Ordering::SeqCst) {
            return false;
        }

        let inner = self.clone();
        self.runtime.spawn(async move {
            let connected = inner.connect_pending().await;
            inner.connect_in_flight.store(false, Ordering::SeqCst);

            if connected > 0 {
                inner.ensure_keepalive();
            } else if !is_retry && inner.gate.can_operate() {
                let delay = inner.config.connect_retry_delay();
                tlog!("POOL", "no relay reachable, retrying once in {:?}", delay);
                let weak = Arc::downgrade(&inner);
                inner.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.spawn_connect(true);
                    }
                });
            }
        });
        true
    }

    /// Dial all pending endpoints concurrently. Returns the connected count
    /// once every dial has finished or timed out.
    async fn connect_pending(&self) -> usize {
        let Some(pool) = self.pool.get().cloned() else {
            return 0;
        };
        if !self.gate.can_operate() {
            self.stats.record_skipped_background();
            return pool.status().connected;
        }

        let pending = pool.claim_pending();
        if pending.is_empty() {
            return pool.status().connected;
        }

        let timeout = self.config.connect_timeout();
        let started = Instant::now();
        let attempts = pending.iter().map(|url| {
            self.stats.record_connect_attempt();
            let transport = self.transport.clone();
            async move {
                let result = match tokio::time::timeout(timeout, transport.connect(url, timeout)).await {
                    Ok(result) => result,
                    Err(_) => Err(crate::error::TransportError::Timeout(timeout.as_millis() as u64)),
                };
                (url.clone(), result)
            }
        });

        let results = join_all(attempts).await;
        if !self.gate.can_operate() {
            // Sockets opened after the gate closed are the transport's to
            // tear down; the pool only records what the dials reported.
            self.stats.record_skipped_background();
            tlog!("CONN", "gate closed during connect pass");
        }
        for (url, result) in results {
            match result {
                Ok(()) => pool.mark_connected(&url),
                Err(e) => {
                    tlog!("CONN", "connect {} failed: {}", url, e);
                    pool.mark_failed(&url);
                }
            }
        }

        let status = pool.status();
        tlog!(
            "CONN",
            "connect pass finished in {:?}: {}/{} connected",
            started.elapsed(),
            status.connected,
            status.total
        );
        status.connected
    }

    fn request_reconnect(self: &Arc<Self>, reason: &str) -> bool {
        if !self.gate.can_operate() {
            self.stats.record_skipped_background();
            return false;
        }
        let now = Instant::now();
        let mut last = self.last_reconnect.lock();
        if let Some(previous) = *last {
            if now.duration_since(previous) < self.config.reconnect_cooldown() {
                self.stats.record_reconnect_suppressed();
                return false;
            }
        }
        // The window only starts once a pass actually dials
        if !self.spawn_connect(true) {
            tlog!("POOL", "reconnect ({}) deferred: connect pass in flight", reason);
            return false;
        }
        *last = Some(now);
        drop(last);

        self.stats.record_reconnect();
        tlog!("POOL", "reconnect triggered ({})", reason);
        true
    }

    fn start_monitor(self: &Arc<Self>) {
        // Subscribe before spawning so no early message is lost
        let mut messages = self.transport.messages();
        let weak = Arc::downgrade(self);
        let handle = self.runtime.spawn(async move {
            loop {
                let message = match messages.recv().await {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        tlog!("POOL", "health monitor lagged, skipped {} message(s)", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_transport_message(message);
            }
            tlog!("POOL", "health monitor stopped");
        });
        *self.monitor.lock() = Some(handle);
    }

    fn handle_transport_message(self: &Arc<Self>, message: TransportMessage) {
        let Some(pool) = self.pool.get() else {
            return;
        };
        match message {
            TransportMessage::Connected { relay_url } => {
                pool.mark_connected(&relay_url);
            }
            TransportMessage::Disconnected { relay_url } => {
                if !pool.mark_disconnected(&relay_url) {
                    return;
                }
                let status = pool.status();
                tlog!(
                    "CONN",
                    "{} disconnected, {}/{} connected",
                    relay_url,
                    status.connected,
                    status.total
                );
                if status.connected < self.config.min_connected {
                    self.request_reconnect("disconnect");
                }
            }
            _ => {}
        }
    }

    /// Arm the keepalive after a successful connect. A pass that finishes
    /// after the app backgrounded leaves it paused for the foreground
    /// listener to resume.
    fn ensure_keepalive(self: &Arc<Self>) {
        let mut keepalive = self.keepalive.lock();
        if !matches!(*keepalive, KeepaliveState::Idle) {
            return;
        }
        // Checked under the keepalive lock: `on_lifecycle` takes the same
        // lock after the gate has recorded the new state.
        if self.gate.state() == AppState::Background {
            *keepalive = KeepaliveState::Paused;
            tlog!("POOL", "keepalive armed paused (backgrounded)");
        } else {
            *keepalive = KeepaliveState::Running(self.spawn_keepalive());
        }
    }

    fn spawn_keepalive(self: &Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.keepalive_interval();
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.keepalive_tick();
            }
        })
    }

    fn keepalive_tick(self: &Arc<Self>) {
        if !self.gate.can_operate() {
            self.stats.record_skipped_background();
            return;
        }
        self.stats.record_keepalive_tick();
        self.health_check("keepalive");
    }

    fn health_check(self: &Arc<Self>, reason: &str) {
        let Some(pool) = self.pool.get() else {
            return;
        };
        let status = pool.status();
        if status.connected == 0 {
            self.spawn_connect(false);
        } else if status.connected < self.config.min_connected {
            self.request_reconnect(reason);
        }
    }

    /// Replace the keepalive state, clearing a running timer.
    fn stop_keepalive(&self, next: KeepaliveState) {
        let previous = std::mem::replace(&mut *self.keepalive.lock(), next);
        if let KeepaliveState::Running(handle) = previous {
            handle.abort();
        }
    }

    fn on_lifecycle(self: &Arc<Self>, state: AppState) {
        match state {
            AppState::Background => {
                let was_running =
                    matches!(*self.keepalive.lock(), KeepaliveState::Running(_));
                if was_running {
                    self.stop_keepalive(KeepaliveState::Paused);
                    tlog!("POOL", "keepalive paused");
                }
            }
            AppState::Foreground => {
                {
                    let mut keepalive = self.keepalive.lock();
                    if matches!(*keepalive, KeepaliveState::Paused) {
                        *keepalive = KeepaliveState::Running(self.spawn_keepalive());
                        tlog!("POOL", "keepalive resumed");
                    }
                }
                if self.pool.get().is_some() {
                    let weak = Arc::downgrade(self);
                    self.gate.defer_until_foreground(move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.health_check("foreground");
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, TeardownPolicy};
    use crate::relay::mock::MockTransport;

    const RELAYS: [&str; 3] = ["wss://a.example", "wss://b.example", "wss://c.example"];

    fn relay_urls() -> Vec<String> {
        RELAYS.iter().map(|s| s.to_string()).collect()
    }

    fn gate() -> LifecycleGate {
        LifecycleGate::new(LifecycleConfig {
            teardown: TeardownPolicy::Aggressive,
            foreground_settle_ms: 500,
            background_grace_ms: 50,
        })
    }

    fn manager(transport: Arc<MockTransport>, gate: LifecycleGate) -> RelayPoolManager {
        manager_with(transport, gate, PoolConfig::default())
    }

    fn manager_with(
        transport: Arc<MockTransport>,
        gate: LifecycleGate,
        config: PoolConfig,
    ) -> RelayPoolManager {
        RelayPoolManager::new(relay_urls(), config, transport, gate)
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_pool_is_singleton_and_non_blocking() {
        let transport = MockTransport::new(RELAYS);
        let manager = manager(transport.clone(), gate());

        let started = std::time::Instant::now();
        let first = manager.get_pool();
        assert!(started.elapsed() < std::time::Duration::from_millis(50));
        assert_eq!(first.status().connected, 0);

        for _ in 0..50 {
            let again = manager.get_pool();
            assert!(Arc::ptr_eq(&first, &again));
        }

        assert!(manager.wait_for_minimum(3, Duration::from_secs(1)).await);
        for _ in 0..50 {
            manager.get_pool();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_before_pool_exists_does_no_io() {
        let transport = MockTransport::new(RELAYS);
        let manager = manager(transport.clone(), gate());
        assert_eq!(
            manager.status(),
            PoolStatus {
                total: 3,
                connected: 0
            }
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_connectivity_wait_times_out() {
        let transport = MockTransport::new(["wss://a.example"]);
        let manager = manager(transport.clone(), gate());
        manager.get_pool();

        let started = Instant::now();
        let met = manager
            .wait_for_minimum(2, Duration::from_millis(3000))
            .await;
        let elapsed = started.elapsed();

        assert!(!met);
        assert!(elapsed >= Duration::from_millis(3000));
        assert!(elapsed < Duration::from_millis(3200));
        assert_eq!(
            manager.status(),
            PoolStatus {
                total: 3,
                connected: 1
            }
        );

        let errored: Vec<_> = manager
            .endpoints()
            .into_iter()
            .filter(|e| e.state == ConnectionState::Error)
            .collect();
        assert_eq!(errored.len(), 2);
        assert!(errored.iter().all(|e| e.consecutive_errors == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_storm_triggers_single_reconnect() {
        let transport = MockTransport::new(RELAYS);
        let manager = manager(transport.clone(), gate());
        manager.get_pool();
        assert!(manager.wait_for_minimum(3, Duration::from_secs(1)).await);

        for i in 0..10 {
            transport.drop_relay(RELAYS[i % 3]);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let stats = manager.stats();
        assert_eq!(stats.reconnects_triggered, 1);
        assert!(stats.reconnects_suppressed >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backgrounded_gate_blocks_all_network_work() {
        let transport = MockTransport::new(RELAYS);
        let gate = gate();
        gate.transition(AppState::Background);
        let manager = manager(transport.clone(), gate.clone());

        manager.get_pool();
        assert!(!manager.request_reconnect());
        assert_eq!(manager.reconnect().await.connected, 0);
        transport.drop_relay(RELAYS[0]);
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(transport.connects(), 0);
        assert!(!manager.keepalive_running());
        assert!(manager.stats().skipped_background >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_retries_exactly_once() {
        let transport = MockTransport::new(Vec::<String>::new());
        let config = PoolConfig {
            connect_timeout_ms: 100,
            connect_retry_delay_ms: 200,
            ..PoolConfig::default()
        };
        let manager = manager_with(transport.clone(), gate(), config);
        manager.get_pool();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connects(), 6);
        assert_eq!(manager.status().connected, 0);

        // A later access starts a fresh attempt once a relay recovers
        transport.set_reachable(RELAYS[1], true);
        manager.get_pool();
        assert!(manager.wait_for_minimum(1, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_reconnects_and_pauses_in_background() {
        let transport = MockTransport::new(["wss://a.example", "wss://b.example"]);
        let config = PoolConfig {
            min_connected: 3,
            ..PoolConfig::default()
        };
        let gate = gate();
        let manager = manager_with(transport.clone(), gate.clone(), config);
        manager.get_pool();
        assert!(manager.wait_for_minimum(2, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let initial_connects = transport.connects();
        assert!(manager.keepalive_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        let stats = manager.stats();
        assert!(stats.keepalive_ticks >= 1);
        assert!(transport.connects() > initial_connects);

        gate.transition(AppState::Background);
        assert!(!manager.keepalive_running());
        let ticks = manager.stats().keepalive_ticks;
        let connects = transport.connects();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(manager.stats().keepalive_ticks, ticks);
        assert_eq!(transport.connects(), connects);

        gate.transition(AppState::Foreground);
        assert!(manager.keepalive_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_during_connect_pass_leaves_keepalive_paused() {
        // b never answers, so the first pass lasts the full connect timeout
        let transport = MockTransport::new(["wss://a.example"]);
        let config = PoolConfig {
            connect_timeout_ms: 2000,
            ..PoolConfig::default()
        };
        let gate = gate();
        let manager = manager_with(transport.clone(), gate.clone(), config);
        manager.get_pool();

        tokio::time::sleep(Duration::from_millis(100)).await;
        gate.transition(AppState::Background);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(manager.status().connected, 1);
        assert!(!manager.keepalive_running());
        let ticks = manager.stats().keepalive_ticks;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(manager.stats().keepalive_ticks, ticks);

        gate.transition(AppState::Foreground);
        assert!(manager.keepalive_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_during_connect_pass_keeps_cooldown_open() {
        let transport = MockTransport::new(["wss://a.example"]);
        let config = PoolConfig {
            connect_timeout_ms: 2000,
            ..PoolConfig::default()
        };
        let manager = manager_with(transport.clone(), gate(), config);
        manager.get_pool();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.request_reconnect());
        assert_eq!(manager.stats().reconnects_triggered, 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let connects = transport.connects();
        assert!(manager.request_reconnect());
        assert_eq!(manager.stats().reconnects_triggered, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.connects() > connects);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_goes_to_connected_relays_only() {
        let transport = MockTransport::new(["wss://a.example", "wss://b.example"]);
        let manager = manager(transport.clone(), gate());
        manager.get_pool();
        assert!(manager.wait_for_minimum(2, Duration::from_secs(1)).await);

        let keys = nostr_sdk::Keys::generate();
        let event = nostr_sdk::EventBuilder::new(nostr_sdk::Kind::TextNote, "hello")
            .sign_with_keys(&keys)
            .unwrap();
        let outcome = manager.publish(event).await;
        assert!(outcome.is_accepted());
        assert_eq!(outcome.accepted.len(), 2);
        assert!(outcome.rejected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_everything() {
        let transport = MockTransport::new(RELAYS);
        let manager = manager(transport.clone(), gate());
        manager.get_pool();
        assert!(manager.wait_for_minimum(3, Duration::from_secs(1)).await);

        manager.shutdown().await;
        assert_eq!(manager.status().connected, 0);
        assert!(!manager.keepalive_running());
    }
}
