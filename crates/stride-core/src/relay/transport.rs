//! Relay transport boundary.
//!
//! The core never speaks the wire protocol itself. A transport opens
//! connections, forwards filters and publishes events, and pushes everything
//! it hears back onto a broadcast channel of [`TransportMessage`]s. The pool
//! manager and the subscription runner are consumers of that channel.

use futures::future::BoxFuture;
use nostr_sdk::{Event, EventId, Filter, SubscriptionId};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::TransportError;

/// Everything a transport reports, tagged with the relay it came from.
#[derive(Debug, Clone)]
pub enum TransportMessage {
    Event {
        relay_url: String,
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    EndOfStoredEvents {
        relay_url: String,
        subscription_id: SubscriptionId,
    },
    Notice {
        relay_url: String,
        message: String,
    },
    PublishResult {
        relay_url: String,
        event_id: EventId,
        accepted: bool,
        message: String,
    },
    Connected {
        relay_url: String,
    },
    Disconnected {
        relay_url: String,
    },
}

impl TransportMessage {
    pub fn relay_url(&self) -> &str {
        match self {
            TransportMessage::Event { relay_url, .. }
            | TransportMessage::EndOfStoredEvents { relay_url, .. }
            | TransportMessage::Notice { relay_url, .. }
            | TransportMessage::PublishResult { relay_url, .. }
            | TransportMessage::Connected { relay_url }
            | TransportMessage::Disconnected { relay_url } => relay_url,
        }
    }
}

/// Per-relay publish acknowledgements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<(String, String)>,
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        !self.accepted.is_empty()
    }
}

pub trait RelayTransport: Send + Sync + 'static {
    /// Open (or re-open) the connection to one relay, giving up after `timeout`.
    fn connect<'a>(
        &'a self,
        relay_url: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn disconnect<'a>(&'a self, relay_url: &'a str) -> BoxFuture<'a, ()>;

    /// Send `filter` under `subscription_id` to each relay in `relay_urls`.
    /// Results arrive on [`RelayTransport::messages`].
    fn subscribe<'a>(
        &'a self,
        relay_urls: &'a [String],
        subscription_id: SubscriptionId,
        filter: Filter,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn unsubscribe<'a>(&'a self, subscription_id: &'a SubscriptionId) -> BoxFuture<'a, ()>;

    fn publish<'a>(
        &'a self,
        relay_urls: &'a [String],
        event: Event,
    ) -> BoxFuture<'a, Result<PublishOutcome, TransportError>>;

    /// A fresh receiver; only messages sent after this call are observed.
    fn messages(&self) -> broadcast::Receiver<TransportMessage>;
}
