//! Scripted in-process transport used by unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use nostr_sdk::{Event, Filter, SubscriptionId};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::transport::{PublishOutcome, RelayTransport, TransportMessage};
use crate::error::TransportError;

/// What every relay answers to a subscription.
#[derive(Clone, Default)]
pub struct SubscriptionScript {
    pub events: Vec<Event>,
    pub send_eose: bool,
    /// Pause between events, to interleave with timers.
    pub event_interval: Duration,
}

pub struct MockTransport {
    reachable: Mutex<HashSet<String>>,
    connected: Mutex<HashSet<String>>,
    script: Mutex<SubscriptionScript>,
    pub connect_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
    pub unsubscribe_calls: AtomicUsize,
    pub publish_calls: AtomicUsize,
    tx: broadcast::Sender<TransportMessage>,
}

impl MockTransport {
    pub fn new<I, S>(reachable: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, _) = broadcast::channel(8192);
        Arc::new(Self {
            reachable: Mutex::new(reachable.into_iter().map(Into::into).collect()),
            connected: Mutex::new(HashSet::new()),
            script: Mutex::new(SubscriptionScript {
                send_eose: true,
                ..Default::default()
            }),
            connect_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            unsubscribe_calls: AtomicUsize::new(0),
            publish_calls: AtomicUsize::new(0),
            tx,
        })
    }

    pub fn set_script(&self, script: SubscriptionScript) {
        *self.script.lock() = script;
    }

    pub fn set_reachable(&self, relay_url: &str, reachable: bool) {
        let mut set = self.reachable.lock();
        if reachable {
            set.insert(relay_url.to_string());
        } else {
            set.remove(relay_url);
        }
    }

    /// Simulate the relay dropping the socket.
    pub fn drop_relay(&self, relay_url: &str) {
        self.connected.lock().remove(relay_url);
        let _ = self.tx.send(TransportMessage::Disconnected {
            relay_url: relay_url.to_string(),
        });
    }

    pub fn connects(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

impl RelayTransport for MockTransport {
    fn connect<'a>(
        &'a self,
        relay_url: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let reachable = self.reachable.lock().contains(relay_url);
            if !reachable {
                tokio::time::sleep(timeout).await;
                return Err(TransportError::Timeout(timeout.as_millis() as u64));
            }
            self.connected.lock().insert(relay_url.to_string());
            let _ = self.tx.send(TransportMessage::Connected {
                relay_url: relay_url.to_string(),
            });
            Ok(())
        }
        .boxed()
    }

    fn disconnect<'a>(&'a self, relay_url: &'a str) -> BoxFuture<'a, ()> {
        async move {
            self.connected.lock().remove(relay_url);
        }
        .boxed()
    }

    fn subscribe<'a>(
        &'a self,
        relay_urls: &'a [String],
        subscription_id: SubscriptionId,
        _filter: Filter,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        async move {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            let script = self.script.lock().clone();
            let tx = self.tx.clone();
            let relays = relay_urls.to_vec();
            tokio::spawn(async move {
                for event in &script.events {
                    for relay_url in &relays {
                        let _ = tx.send(TransportMessage::Event {
                            relay_url: relay_url.clone(),
                            subscription_id: subscription_id.clone(),
                            event: Box::new(event.clone()),
                        });
                    }
                    if !script.event_interval.is_zero() {
                        tokio::time::sleep(script.event_interval).await;
                    }
                }
                if script.send_eose {
                    for relay_url in &relays {
                        let _ = tx.send(TransportMessage::EndOfStoredEvents {
                            relay_url: relay_url.clone(),
                            subscription_id: subscription_id.clone(),
                        });
                    }
                }
            });
            Ok(())
        }
        .boxed()
    }

    fn unsubscribe<'a>(&'a self, _subscription_id: &'a SubscriptionId) -> BoxFuture<'a, ()> {
        async move {
            self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    fn publish<'a>(
        &'a self,
        relay_urls: &'a [String],
        _event: Event,
    ) -> BoxFuture<'a, Result<PublishOutcome, TransportError>> {
        async move {
            self.publish_calls.fetch_add(1, Ordering::SeqCst);
            let connected = self.connected.lock().clone();
            let mut outcome = PublishOutcome::default();
            for relay_url in relay_urls {
                if connected.contains(relay_url) {
                    outcome.accepted.push(relay_url.clone());
                } else {
                    outcome
                        .rejected
                        .push((relay_url.clone(), "not connected".to_string()));
                }
            }
            Ok(outcome)
        }
        .boxed()
    }

    fn messages(&self) -> broadcast::Receiver<TransportMessage> {
        self.tx.subscribe()
    }
}
