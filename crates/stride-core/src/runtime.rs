use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use tokio::runtime::Handle;

use crate::config::CoreConfig;
use crate::lifecycle::{AppState, LifecycleGate};
use crate::logging;
use crate::relay::{NostrSdkTransport, RelayPoolManager, RelayTransport, SubscriptionRunner};
use crate::stats::SharedEventStats;
use crate::store::{BlobStore, EventCacheStore, FileBlobStore};
use crate::tlog;

/// Process-root container. Builds exactly one gate, pool manager, runner and
/// cache store; everything it hands out is a cheap clone of the same service.
pub struct CoreRuntime {
    config: CoreConfig,
    gate: LifecycleGate,
    pool: RelayPoolManager,
    runner: SubscriptionRunner,
    cache: EventCacheStore,
    event_stats: SharedEventStats,
}

impl CoreRuntime {
    pub fn new(
        config: CoreConfig,
        transport: Arc<dyn RelayTransport>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        Handle::try_current().context("CoreRuntime must be created inside a Tokio runtime")?;
        ensure!(!config.relay_urls.is_empty(), "no relay urls configured");

        let gate = LifecycleGate::new(config.lifecycle.clone());
        let pool = RelayPoolManager::new(
            config.relay_urls.clone(),
            config.pool.clone(),
            transport,
            gate.clone(),
        );
        let event_stats = SharedEventStats::new();
        let runner = SubscriptionRunner::new(
            pool.clone(),
            config.subscription.clone(),
            config.dedup.clone(),
            event_stats.clone(),
        );
        let cache = EventCacheStore::new(
            pool.clone(),
            runner.clone(),
            blob_store,
            config.cache.clone(),
        );

        tlog!(
            "CONN",
            "core runtime created with {} relay(s)",
            config.relay_urls.len()
        );

        Ok(Self {
            config,
            gate,
            pool,
            runner,
            cache,
            event_stats,
        })
    }

    /// Production wiring: nostr-sdk transport, snapshots and the diagnostic
    /// log under `config.data_dir`.
    pub fn with_nostr_sdk(config: CoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data dir {}", config.data_dir.display())
        })?;
        logging::set_log_path(config.data_dir.join("stride.log"));

        let transport = NostrSdkTransport::new(config.pool.status_poll_interval());
        let blob_store = Arc::new(FileBlobStore::new(&config.data_dir));
        Self::new(config, transport, blob_store)
    }

    /// Start connecting and hydrate the cache. Returns the number of records
    /// loaded from disk; the first refresh continues in the background.
    pub async fn start(&self) -> usize {
        self.pool.get_pool();
        self.cache.initialize().await
    }

    /// Forward a host lifecycle event to the gate.
    pub fn set_app_state(&self, state: AppState) {
        self.gate.transition(state);
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn gate(&self) -> &LifecycleGate {
        &self.gate
    }

    pub fn pool(&self) -> &RelayPoolManager {
        &self.pool
    }

    pub fn runner(&self) -> &SubscriptionRunner {
        &self.runner
    }

    pub fn cache(&self) -> &EventCacheStore {
        &self.cache
    }

    pub fn event_stats(&self) -> &SharedEventStats {
        &self.event_stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::mock::MockTransport;
    use crate::store::MemoryBlobStore;
    use std::time::Duration;
    use tempfile::tempdir;

    const RELAYS: [&str; 3] = ["wss://a.example", "wss://b.example", "wss://c.example"];

    fn config() -> CoreConfig {
        CoreConfig::new("/tmp/stride-test").with_relays(RELAYS)
    }

    #[tokio::test(start_paused = true)]
    async fn test_services_share_one_pool() {
        let transport = MockTransport::new(RELAYS);
        let runtime =
            CoreRuntime::new(config(), transport.clone(), Arc::new(MemoryBlobStore::new()))
                .unwrap();

        assert_eq!(runtime.start().await, 0);
        assert!(runtime
            .pool()
            .wait_for_minimum(3, Duration::from_secs(1))
            .await);
        tokio::time::sleep(Duration::from_secs(5)).await;

        // start() and the cache's background refresh used the same pool
        assert_eq!(transport.connects(), 3);
        assert_eq!(transport.subscribes(), 1);
        assert!(runtime.cache().status().last_refreshed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_state_reaches_every_service() {
        let transport = MockTransport::new(RELAYS);
        let runtime =
            CoreRuntime::new(config(), transport.clone(), Arc::new(MemoryBlobStore::new()))
                .unwrap();

        runtime.set_app_state(AppState::Background);
        runtime.start().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(!runtime.gate().can_operate());
        assert_eq!(transport.connects(), 0);
        assert_eq!(transport.subscribes(), 0);
    }

    #[tokio::test]
    async fn test_rejects_empty_relay_list() {
        let mut config = config();
        config.relay_urls.clear();
        let result = CoreRuntime::new(
            config,
            MockTransport::new(RELAYS),
            Arc::new(MemoryBlobStore::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_requires_tokio_runtime() {
        let result = CoreRuntime::new(
            config(),
            MockTransport::new(RELAYS),
            Arc::new(MemoryBlobStore::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_with_nostr_sdk_creates_data_dir() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("stride");
        let runtime = CoreRuntime::with_nostr_sdk(CoreConfig::new(&data_dir)).unwrap();
        assert!(data_dir.is_dir());
        assert_eq!(runtime.config().relay_urls.len(), 3);
        assert_eq!(runtime.pool().status().connected, 0);
    }
}
