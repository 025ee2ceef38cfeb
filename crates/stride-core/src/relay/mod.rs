pub mod nostr_client;
pub mod pool;
pub mod subscription;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use nostr_client::NostrSdkTransport;
pub use pool::{ConnectionState, PoolStatus, RelayEndpoint, RelayPool, RelayPoolManager};
pub use subscription::{
    QueryResolution, QueryResult, RunOptions, StandingSubscription, SubscriptionRunner,
};
pub use transport::{PublishOutcome, RelayTransport, TransportMessage};
