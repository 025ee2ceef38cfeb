use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::*;

/// How the host platform treats network handles when the app is backgrounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// The OS may tear sockets down before any deferred callback runs
    /// (mobile). Network access is revoked synchronously.
    #[default]
    Aggressive,
    /// Sockets survive briefly after backgrounding; revoke after a grace period.
    Lenient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub teardown: TeardownPolicy,
    pub foreground_settle_ms: u64,
    pub background_grace_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            teardown: TeardownPolicy::default(),
            foreground_settle_ms: FOREGROUND_SETTLE_MS,
            background_grace_ms: BACKGROUND_GRACE_MS,
        }
    }
}

impl LifecycleConfig {
    pub fn foreground_settle(&self) -> Duration {
        Duration::from_millis(self.foreground_settle_ms)
    }

    pub fn background_grace(&self) -> Duration {
        Duration::from_millis(self.background_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub connect_timeout_ms: u64,
    pub connect_retry_delay_ms: u64,
    pub reconnect_cooldown_ms: u64,
    pub keepalive_interval_ms: u64,
    pub status_poll_interval_ms: u64,
    pub min_connected: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            reconnect_cooldown_ms: RECONNECT_COOLDOWN_MS,
            keepalive_interval_ms: KEEPALIVE_INTERVAL_MS,
            status_poll_interval_ms: STATUS_POLL_INTERVAL_MS,
            min_connected: MIN_CONNECTED_RELAYS,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub hard_timeout_ms: u64,
    /// `None` disables early exit; queries then wait for EOS or the timeout.
    pub early_exit_count: Option<usize>,
    pub standing_channel_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            hard_timeout_ms: SUBSCRIPTION_HARD_TIMEOUT_MS,
            early_exit_count: Some(EARLY_EXIT_COUNT),
            standing_channel_capacity: STANDING_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub min_connectivity_wait_ms: u64,
    pub refresh_timeout_ms: u64,
    pub refresh_window_days: u64,
    /// Relays required before a refresh stops waiting for more to come up.
    pub min_relays_for_refresh: usize,
    pub snapshot_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_connectivity_wait_ms: MIN_CONNECTIVITY_WAIT_MS,
            refresh_timeout_ms: REFRESH_TIMEOUT_MS,
            refresh_window_days: REFRESH_WINDOW_DAYS,
            min_relays_for_refresh: MIN_CONNECTED_RELAYS,
            snapshot_key: SNAPSHOT_KEY.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn min_connectivity_wait(&self) -> Duration {
        Duration::from_millis(self.min_connectivity_wait_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_ms: DEDUP_TTL_MS,
            max_entries: DEDUP_MAX_ENTRIES,
        }
    }
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub relay_urls: Vec<String>,
    pub lifecycle: LifecycleConfig,
    pub pool: PoolConfig,
    pub subscription: SubscriptionConfig,
    pub cache: CacheConfig,
    pub dedup: DedupConfig,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            relay_urls: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            lifecycle: LifecycleConfig::default(),
            pool: PoolConfig::default(),
            subscription: SubscriptionConfig::default(),
            cache: CacheConfig::default(),
            dedup: DedupConfig::default(),
        }
    }

    pub fn with_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relay_urls = relays.into_iter().map(Into::into).collect();
        self
    }

    /// Read a JSON config file. Missing fields fall back to defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config: CoreConfig = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        if config.relay_urls.is_empty() {
            config.relay_urls = DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect();
        }
        Ok(config)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|dir| dir.join("stride"))
            .unwrap_or_else(|| PathBuf::from("stride_data"));
        Self::new(data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_config_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "data_dir": "/tmp/stride-test",
                "relay_urls": ["wss://one.example", "wss://two.example"],
                "pool": { "connect_timeout_ms": 750 }
            }"#,
        )
        .unwrap();

        let config = CoreConfig::load_from_file(&path).unwrap();
        assert_eq!(config.relay_urls.len(), 2);
        assert_eq!(config.pool.connect_timeout(), Duration::from_millis(750));
        assert_eq!(config.pool.min_connected, MIN_CONNECTED_RELAYS);
        assert_eq!(
            config.subscription.early_exit_count,
            Some(EARLY_EXIT_COUNT)
        );
        assert_eq!(config.lifecycle.teardown, TeardownPolicy::Aggressive);
    }

    #[test]
    fn test_empty_relay_list_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "relay_urls": [] }"#).unwrap();

        let config = CoreConfig::load_from_file(&path).unwrap();
        assert_eq!(config.relay_urls.len(), DEFAULT_RELAYS.len());
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(CoreConfig::load_from_file(&path).is_err());
    }
}
