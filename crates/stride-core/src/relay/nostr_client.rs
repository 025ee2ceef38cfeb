//! Production transport over `nostr_sdk::Client`.
//!
//! Relay pool notifications are forwarded as [`TransportMessage`]s. The pool
//! level stream drops relay status changes, so each dialled relay gets its own
//! watcher on `Relay::notifications()` that turns them into
//! `Connected`/`Disconnected`. Watchers are event driven and hold no timer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use nostr_sdk::pool::RelayNotification;
use nostr_sdk::{
    Client, Event, Filter, Relay, RelayMessage, RelayPoolNotification, RelayStatus, RelayUrl,
    SubscriptionId,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::transport::{PublishOutcome, RelayTransport, TransportMessage};
use crate::error::TransportError;
use crate::tlog;

const MESSAGE_CHANNEL_CAPACITY: usize = 4096;

/// Normalized relay url -> the url string callers configured.
type UrlNames = Arc<RwLock<HashMap<RelayUrl, String>>>;

pub struct NostrSdkTransport {
    client: Client,
    tx: broadcast::Sender<TransportMessage>,
    names: UrlNames,
    /// Only used while a `connect` waits for the socket.
    poll_interval: Duration,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    watchers: Mutex<HashMap<RelayUrl, JoinHandle<()>>>,
}

impl NostrSdkTransport {
    /// Must be called from within a Tokio runtime.
    pub fn new(status_poll_interval: Duration) -> Arc<Self> {
        Self::with_client(Client::builder().build(), status_poll_interval)
    }

    pub fn with_client(client: Client, status_poll_interval: Duration) -> Arc<Self> {
        let (tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        let transport = Arc::new(Self {
            client,
            tx,
            names: Arc::new(RwLock::new(HashMap::new())),
            poll_interval: status_poll_interval,
            forwarder: Mutex::new(None),
            watchers: Mutex::new(HashMap::new()),
        });
        let forwarder = transport.spawn_notification_forwarder();
        *transport.forwarder.lock() = Some(forwarder);
        transport
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn spawn_notification_forwarder(&self) -> JoinHandle<()> {
        let mut notifications = self.client.notifications();
        let tx = self.tx.clone();
        let names = self.names.clone();

        tokio::spawn(async move {
            loop {
                let notification = match notifications.recv().await {
                    Ok(notification) => notification,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tlog!("CONN", "notification stream lagged, skipped {}", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let message = match notification {
                    RelayPoolNotification::Event {
                        relay_url,
                        subscription_id,
                        event,
                    } => Some(TransportMessage::Event {
                        relay_url: display_name(&names, &relay_url),
                        subscription_id,
                        event,
                    }),
                    RelayPoolNotification::Message { relay_url, message } => {
                        let relay_url = display_name(&names, &relay_url);
                        match message {
                            RelayMessage::EndOfStoredEvents(id) => {
                                Some(TransportMessage::EndOfStoredEvents {
                                    relay_url,
                                    subscription_id: SubscriptionId::new(id.to_string()),
                                })
                            }
                            RelayMessage::Notice(notice) => Some(TransportMessage::Notice {
                                relay_url,
                                message: notice.to_string(),
                            }),
                            RelayMessage::Ok {
                                event_id,
                                status,
                                message,
                            } => Some(TransportMessage::PublishResult {
                                relay_url,
                                event_id,
                                accepted: status,
                                message: message.to_string(),
                            }),
                            _ => None,
                        }
                    }
                    RelayPoolNotification::Shutdown => {
                        tlog!("CONN", "relay pool shutdown");
                        break;
                    }
                };

                if let Some(message) = message {
                    let _ = tx.send(message);
                }
            }
        })
    }

    /// Start forwarding `relay`'s status changes unless already watched.
    /// Must run before `connect_relay` so the first transition is seen.
    fn watch_relay(&self, relay: Relay) {
        let mut watchers = self.watchers.lock();
        if watchers.contains_key(relay.url()) {
            return;
        }
        let url = relay.url().clone();
        let mut notifications = relay.notifications();
        let tx = self.tx.clone();
        let names = self.names.clone();
        let watched = url.clone();

        let handle = tokio::spawn(async move {
            let mut was_connected = relay.status() == RelayStatus::Connected;
            loop {
                let status = match notifications.recv().await {
                    Ok(RelayNotification::RelayStatus { status }) => status,
                    Ok(RelayNotification::Shutdown) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => relay.status(),
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let connected = match status {
                    RelayStatus::Connected => true,
                    RelayStatus::Disconnected | RelayStatus::Terminated | RelayStatus::Banned => {
                        false
                    }
                    _ => continue,
                };
                if connected == was_connected {
                    continue;
                }
                was_connected = connected;
                let relay_url = display_name(&names, &watched);
                let message = if connected {
                    TransportMessage::Connected { relay_url }
                } else {
                    TransportMessage::Disconnected { relay_url }
                };
                let _ = tx.send(message);
            }
        });
        watchers.insert(url, handle);
    }

    async fn is_connected(&self, url: &RelayUrl) -> bool {
        self.client
            .relays()
            .await
            .get(url)
            .is_some_and(|relay| relay.status() == RelayStatus::Connected)
    }
}

impl Drop for NostrSdkTransport {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        for (_, watcher) in self.watchers.lock().drain() {
            watcher.abort();
        }
    }
}

fn display_name(names: &UrlNames, url: &RelayUrl) -> String {
    names
        .read()
        .get(url)
        .cloned()
        .unwrap_or_else(|| url.to_string())
}

fn connection_error(url: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::Connection {
        url: url.to_string(),
        message: e.to_string(),
    }
}

impl RelayTransport for NostrSdkTransport {
    fn connect<'a>(
        &'a self,
        relay_url: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            let parsed = RelayUrl::parse(relay_url).map_err(|e| connection_error(relay_url, e))?;
            self.names
                .write()
                .insert(parsed.clone(), relay_url.to_string());

            self.client
                .add_relay(relay_url)
                .await
                .map_err(|e| connection_error(relay_url, e))?;
            let relay = self
                .client
                .relay(&parsed)
                .await
                .map_err(|e| connection_error(relay_url, e))?;
            self.watch_relay(relay);
            self.client
                .connect_relay(relay_url)
                .await
                .map_err(|e| connection_error(relay_url, e))?;

            // connect_relay returns before the socket is up; poll until it is
            let deadline = Instant::now() + timeout;
            loop {
                if self.is_connected(&parsed).await {
                    tlog!("CONN", "{} connected", relay_url);
                    return Ok(());
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(TransportError::Timeout(timeout.as_millis() as u64));
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            }
        }
        .boxed()
    }

    fn disconnect<'a>(&'a self, relay_url: &'a str) -> BoxFuture<'a, ()> {
        async move {
            if let Err(e) = self.client.disconnect_relay(relay_url).await {
                tlog!("CONN", "disconnect {} failed: {}", relay_url, e);
            }
        }
        .boxed()
    }

    fn subscribe<'a>(
        &'a self,
        relay_urls: &'a [String],
        subscription_id: SubscriptionId,
        filter: Filter,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            self.client
                .subscribe_with_id_to(
                    relay_urls.to_vec(),
                    subscription_id,
                    filter,
                    None,
                )
                .await
                .map(|_| ())
                .map_err(|e| TransportError::Other(e.to_string()))
        }
        .boxed()
    }

    fn unsubscribe<'a>(&'a self, subscription_id: &'a SubscriptionId) -> BoxFuture<'a, ()> {
        async move {
            let _ = self.client.unsubscribe(subscription_id).await;
        }
        .boxed()
    }

    fn publish<'a>(
        &'a self,
        relay_urls: &'a [String],
        event: Event,
    ) -> BoxFuture<'a, Result<PublishOutcome, TransportError>> {
        async move {
            let output = self
                .client
                .send_event_to(relay_urls.to_vec(), &event)
                .await
                .map_err(|e| TransportError::Other(e.to_string()))?;

            Ok(PublishOutcome {
                accepted: output
                    .success
                    .iter()
                    .map(|url| display_name(&self.names, url))
                    .collect(),
                rejected: output
                    .failed
                    .iter()
                    .map(|(url, reason)| (display_name(&self.names, url), reason.to_string()))
                    .collect(),
            })
        }
        .boxed()
    }

    fn messages(&self) -> broadcast::Receiver<TransportMessage> {
        self.tx.subscribe()
    }
}
