//! One-shot queries and standing subscriptions over the relay pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::{Event, EventId, Filter, SubscriptionId};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::pool::RelayPoolManager;
use super::transport::{RelayTransport, TransportMessage};
use crate::config::{DedupConfig, SubscriptionConfig};
use crate::dedup::TtlDeduplicator;
use crate::error::CoreError;
use crate::models::workout::group_of;
use crate::stats::SharedEventStats;
use crate::tlog;

/// How a one-shot query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResolution {
    /// Every targeted relay signalled end-of-stored-events (or dropped).
    EndOfStoredEvents,
    EarlyExit,
    Timeout,
    /// Nothing was connected when the query started.
    NoRelays,
    /// The app was backgrounded mid-query.
    Cancelled,
}

/// Deduplicated events in arrival order. Callers that need another order
/// sort themselves.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub events: Vec<Event>,
    pub resolution: QueryResolution,
}

impl QueryResult {
    fn empty(resolution: QueryResolution) -> Self {
        Self {
            events: Vec::new(),
            resolution,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub early_exit_count: Option<usize>,
    pub hard_timeout: Duration,
}

impl RunOptions {
    pub fn from_config(config: &SubscriptionConfig) -> Self {
        Self {
            early_exit_count: config.early_exit_count,
            hard_timeout: Duration::from_millis(config.hard_timeout_ms),
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.hard_timeout.is_zero() {
            return Err(CoreError::InvalidQuery {
                message: "hard timeout must be greater than zero".to_string(),
            });
        }
        if self.early_exit_count == Some(0) {
            return Err(CoreError::InvalidQuery {
                message: "early exit count must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SubscriptionRunner {
    pool: RelayPoolManager,
    config: SubscriptionConfig,
    dedup: DedupConfig,
    stats: SharedEventStats,
}

impl SubscriptionRunner {
    pub fn new(
        pool: RelayPoolManager,
        config: SubscriptionConfig,
        dedup: DedupConfig,
        stats: SharedEventStats,
    ) -> Self {
        Self {
            pool,
            config,
            dedup,
            stats,
        }
    }

    pub fn default_options(&self) -> RunOptions {
        RunOptions::from_config(&self.config)
    }

    pub fn stats(&self) -> &SharedEventStats {
        &self.stats
    }

    /// Run `filter` against every connected relay until EOS, the early-exit
    /// count or the hard timeout, whichever comes first.
    ///
    /// Only invalid options return `Err`. Zero connectivity resolves
    /// immediately with [`QueryResolution::NoRelays`].
    pub async fn run(&self, filter: Filter, options: RunOptions) -> Result<QueryResult, CoreError> {
        options.validate()?;

        let gate = self.pool.gate();
        let mut network = gate.network_watch();
        if !*network.borrow() {
            return Ok(QueryResult::empty(QueryResolution::Cancelled));
        }

        let relays = self.pool.connected_urls();
        if relays.is_empty() {
            tlog!("SUB", "no connected relays, skipping query");
            return Ok(QueryResult::empty(QueryResolution::NoRelays));
        }

        let transport = self.pool.transport();
        let subscription_id = SubscriptionId::new(Uuid::new_v4().to_string());
        // Listen before sending so a fast relay cannot beat us
        let mut messages = transport.messages();
        let started = Instant::now();

        if let Err(e) = transport
            .subscribe(&relays, subscription_id.clone(), filter)
            .await
        {
            tlog!("ERROR", "subscribe {} failed: {}", subscription_id, e);
            return Ok(QueryResult::empty(QueryResolution::NoRelays));
        }
        let open = OpenSubscription::new(transport, subscription_id.clone());

        let mut events: Vec<Event> = Vec::new();
        let mut seen: HashSet<EventId> = HashSet::new();
        let mut finished: HashSet<String> = HashSet::new();
        let deadline = tokio::time::sleep(options.hard_timeout);
        tokio::pin!(deadline);

        // Each arm breaks with the single resolution for this query
        let resolution = loop {
            tokio::select! {
                _ = &mut deadline => break QueryResolution::Timeout,
                changed = network.changed() => {
                    if changed.is_err() || !*network.borrow() {
                        break QueryResolution::Cancelled;
                    }
                }
                message = messages.recv() => match message {
                    Ok(TransportMessage::Event { subscription_id: id, event, .. })
                        if id == subscription_id =>
                    {
                        if seen.insert(event.id) {
                            self.stats.record(event.kind.as_u16(), group_of(&event));
                            events.push(*event);
                            if options.early_exit_count.is_some_and(|n| events.len() >= n) {
                                break QueryResolution::EarlyExit;
                            }
                        }
                    }
                    Ok(TransportMessage::EndOfStoredEvents { relay_url, subscription_id: id })
                        if id == subscription_id =>
                    {
                        finished.insert(relay_url);
                        if relays.iter().all(|r| finished.contains(r)) {
                            break QueryResolution::EndOfStoredEvents;
                        }
                    }
                    Ok(TransportMessage::Disconnected { relay_url }) => {
                        // A dropped relay will never send EOS
                        if relays.contains(&relay_url) {
                            finished.insert(relay_url);
                            if relays.iter().all(|r| finished.contains(r)) {
                                break QueryResolution::EndOfStoredEvents;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tlog!("SUB", "{} lagged, skipped {} message(s)", subscription_id, skipped);
                    }
                    Err(RecvError::Closed) => break QueryResolution::Cancelled,
                },
            }
        };

        open.close().await;
        tlog!(
            "PERF",
            "query {} resolved {:?} with {} event(s) from {} relay(s) in {:?}",
            subscription_id,
            resolution,
            events.len(),
            relays.len(),
            started.elapsed()
        );

        Ok(QueryResult { events, resolution })
    }

    /// Open a long-lived subscription. Events arrive on the returned handle,
    /// deduplicated across relays. The stream ends when the app is
    /// backgrounded, when no relay is connected at start, or on `stop()`.
    pub async fn stream(&self, filter: Filter) -> StandingSubscription {
        let subscription_id = SubscriptionId::new(Uuid::new_v4().to_string());
        let (tx, receiver) = mpsc::channel(self.config.standing_channel_capacity.max(1));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let gate = self.pool.gate();
        let mut network = gate.network_watch();
        let relays = self.pool.connected_urls();
        let transport = self.pool.transport();

        if !*network.borrow() || relays.is_empty() {
            tlog!("SUB", "standing subscription not opened (no relays or backgrounded)");
            return StandingSubscription {
                id: subscription_id,
                receiver,
                stop_tx: Some(stop_tx),
                task: None,
            };
        }

        let mut messages = transport.messages();
        if let Err(e) = transport
            .subscribe(&relays, subscription_id.clone(), filter)
            .await
        {
            tlog!("ERROR", "subscribe {} failed: {}", subscription_id, e);
            return StandingSubscription {
                id: subscription_id,
                receiver,
                stop_tx: Some(stop_tx),
                task: None,
            };
        }

        let dedup = Arc::new(TtlDeduplicator::from_config(&self.dedup));
        let stats = self.stats.clone();
        let id = subscription_id.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    changed = network.changed() => {
                        if changed.is_err() || !*network.borrow() {
                            break;
                        }
                    }
                    message = messages.recv() => match message {
                        Ok(TransportMessage::Event { subscription_id, event, .. })
                            if subscription_id == id =>
                        {
                            if dedup.is_duplicate(&event.id.to_hex()) {
                                continue;
                            }
                            stats.record(event.kind.as_u16(), group_of(&event));
                            // A full channel must not stop us hearing stop_rx
                            tokio::select! {
                                sent = tx.send(*event) => if sent.is_err() {
                                    break;
                                },
                                _ = &mut stop_rx => break,
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tlog!("SUB", "{} lagged, skipped {} message(s)", id, skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            dedup.clear();
            transport.unsubscribe(&id).await;
            tlog!("SUB", "standing subscription {} closed", id);
        });

        StandingSubscription {
            id: subscription_id,
            receiver,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }
}

/// Cancellation handle for a standing subscription. Dropping it also closes
/// the subscription with the transport.
pub struct StandingSubscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<Event>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StandingSubscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn is_open(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Close the subscription and wait until the transport has been told.
    /// Events still queued on the handle are discarded.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.receiver.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StandingSubscription {
    fn drop(&mut self) {
        // The forwarding task sees the closed oneshot and cleans up on its own
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

/// Owns a transport subscription until it is closed. If the query future is
/// dropped first, for instance by a caller's timeout, the unsubscribe is
/// spawned instead.
struct OpenSubscription {
    transport: Arc<dyn RelayTransport>,
    id: Option<SubscriptionId>,
}

impl OpenSubscription {
    fn new(transport: Arc<dyn RelayTransport>, id: SubscriptionId) -> Self {
        Self {
            transport,
            id: Some(id),
        }
    }

    async fn close(mut self) {
        if let Some(id) = self.id.take() {
            self.transport.unsubscribe(&id).await;
        }
    }
}

impl Drop for OpenSubscription {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let transport = self.transport.clone();
        match Handle::try_current() {
            Ok(handle) => {
                tlog!("SUB", "query {} abandoned, unsubscribing", id);
                handle.spawn(async move {
                    transport.unsubscribe(&id).await;
                });
            }
            Err(_) => tlog!("ERROR", "query {} abandoned outside a runtime", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LifecycleConfig, PoolConfig};
    use crate::lifecycle::{AppState, LifecycleGate};
    use crate::relay::mock::{MockTransport, SubscriptionScript};
    use nostr_sdk::{EventBuilder, Keys, Kind};
    use std::sync::atomic::Ordering;

    const RELAYS: [&str; 3] = ["wss://a.example", "wss://b.example", "wss://c.example"];

    fn events(count: usize) -> Vec<Event> {
        let keys = Keys::generate();
        (0..count)
            .map(|i| {
                EventBuilder::new(Kind::Custom(1301), format!("workout {}", i))
                    .sign_with_keys(&keys)
                    .unwrap()
            })
            .collect()
    }

    async fn connected_runner(transport: Arc<MockTransport>) -> (SubscriptionRunner, LifecycleGate) {
        let gate = LifecycleGate::new(LifecycleConfig::default());
        let pool = RelayPoolManager::new(
            RELAYS.iter().map(|s| s.to_string()).collect(),
            PoolConfig::default(),
            transport,
            gate.clone(),
        );
        pool.get_pool();
        pool.wait_for_minimum(1, Duration::from_secs(3)).await;
        let runner = SubscriptionRunner::new(
            pool,
            SubscriptionConfig::default(),
            DedupConfig::default(),
            SharedEventStats::new(),
        );
        (runner, gate)
    }

    fn options(early_exit: Option<usize>, timeout_ms: u64) -> RunOptions {
        RunOptions {
            early_exit_count: early_exit,
            hard_timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_beats_hard_timeout() {
        let transport = MockTransport::new(RELAYS);
        transport.set_script(SubscriptionScript {
            events: events(150),
            send_eose: false,
            event_interval: Duration::from_millis(1),
        });
        let (runner, _gate) = connected_runner(transport.clone()).await;

        let started = Instant::now();
        let result = runner
            .run(Filter::new().kind(Kind::Custom(1301)), options(Some(100), 5000))
            .await
            .unwrap();

        assert_eq!(result.resolution, QueryResolution::EarlyExit);
        assert_eq!(result.events.len(), 100);
        assert!(started.elapsed() < Duration::from_millis(5000));
        assert_eq!(transport.unsubscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_on_eos_and_dedups_across_relays() {
        let transport = MockTransport::new(RELAYS);
        transport.set_script(SubscriptionScript {
            events: events(5),
            send_eose: true,
            event_interval: Duration::ZERO,
        });
        let (runner, _gate) = connected_runner(transport.clone()).await;

        let result = runner
            .run(Filter::new(), options(Some(100), 5000))
            .await
            .unwrap();

        assert_eq!(result.resolution, QueryResolution::EndOfStoredEvents);
        // Every relay sent all five; each id is kept once
        assert_eq!(result.events.len(), 5);
        assert_eq!(runner.stats().snapshot().total, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_relays_stall() {
        let transport = MockTransport::new(RELAYS);
        transport.set_script(SubscriptionScript {
            events: events(3),
            send_eose: false,
            event_interval: Duration::ZERO,
        });
        let (runner, _gate) = connected_runner(transport).await;

        let started = Instant::now();
        let result = runner.run(Filter::new(), options(None, 5000)).await.unwrap();

        assert_eq!(result.resolution, QueryResolution::Timeout);
        assert_eq!(result.events.len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_relays_fails_fast() {
        let transport = MockTransport::new(Vec::<String>::new());
        let gate = LifecycleGate::new(LifecycleConfig::default());
        let pool = RelayPoolManager::new(
            RELAYS.iter().map(|s| s.to_string()).collect(),
            PoolConfig::default(),
            transport.clone(),
            gate,
        );
        let runner = SubscriptionRunner::new(
            pool,
            SubscriptionConfig::default(),
            DedupConfig::default(),
            SharedEventStats::new(),
        );

        let started = Instant::now();
        let result = runner.run(Filter::new(), options(Some(100), 5000)).await.unwrap();
        assert_eq!(result.resolution, QueryResolution::NoRelays);
        assert!(result.events.is_empty());
        assert!(started.elapsed() < Duration::from_millis(10));
        assert_eq!(transport.subscribes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backgrounding_cancels_query() {
        let transport = MockTransport::new(RELAYS);
        transport.set_script(SubscriptionScript {
            events: events(10),
            send_eose: false,
            event_interval: Duration::from_millis(200),
        });
        let (runner, gate) = connected_runner(transport.clone()).await;

        let background = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            background.transition(AppState::Background);
        });

        let result = runner.run(Filter::new(), options(None, 5000)).await.unwrap();
        assert_eq!(result.resolution, QueryResolution::Cancelled);
        assert!(result.events.len() < 10);
        assert_eq!(transport.unsubscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_options_are_rejected() {
        let transport = MockTransport::new(RELAYS);
        let (runner, _gate) = connected_runner(transport).await;

        assert!(matches!(
            runner.run(Filter::new(), options(Some(10), 0)).await,
            Err(CoreError::InvalidQuery { .. })
        ));
        assert!(matches!(
            runner.run(Filter::new(), options(Some(0), 1000)).await,
            Err(CoreError::InvalidQuery { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_delivers_unique_events_and_unsubscribes_on_stop() {
        let transport = MockTransport::new(RELAYS);
        transport.set_script(SubscriptionScript {
            events: events(4),
            send_eose: true,
            event_interval: Duration::ZERO,
        });
        let (runner, _gate) = connected_runner(transport.clone()).await;

        let mut stream = runner.stream(Filter::new()).await;
        assert!(stream.is_open());
        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(stream.recv().await.unwrap());
        }
        let unique: HashSet<EventId> = received.iter().map(|e| e.id).collect();
        assert_eq!(unique.len(), 4);

        // Duplicates from the other relays never reach the channel
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(stream.receiver.try_recv().is_err());

        stream.stop().await;
        assert_eq!(transport.unsubscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_unread_backlog_completes() {
        let transport = MockTransport::new(RELAYS);
        transport.set_script(SubscriptionScript {
            events: events(10),
            send_eose: false,
            event_interval: Duration::ZERO,
        });
        let (runner, _gate) = connected_runner(transport.clone()).await;
        let runner = SubscriptionRunner {
            config: SubscriptionConfig {
                standing_channel_capacity: 2,
                ..SubscriptionConfig::default()
            },
            ..runner
        };

        let stream = runner.stream(Filter::new()).await;
        // Let the forwarder fill the channel and block on the next send
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(60), stream.stop()).await;
        assert!(stopped.is_ok());
        assert_eq!(transport.unsubscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_query_still_unsubscribes() {
        let transport = MockTransport::new(RELAYS);
        transport.set_script(SubscriptionScript {
            events: events(2),
            send_eose: false,
            event_interval: Duration::ZERO,
        });
        let (runner, _gate) = connected_runner(transport.clone()).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            runner.run(Filter::new(), options(None, 5000)),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.subscribes(), 1);
        assert_eq!(transport.unsubscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_stream_is_closed_with_transport() {
        let transport = MockTransport::new(RELAYS);
        let (runner, _gate) = connected_runner(transport.clone()).await;

        let stream = runner.stream(Filter::new()).await;
        drop(stream);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.unsubscribe_calls.load(Ordering::SeqCst), 1);
    }
}
