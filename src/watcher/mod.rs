//! Address activity watcher.
//!
//! Tracks a set of wallet addresses, receives their activity either by polling
//! or through a push subscription, and emits each new transaction exactly once
//! to a `Notifier`, surviving disconnects along the way.

pub mod backoff;
pub mod dedupe;
pub mod error;
pub mod feed;
pub mod manager;
pub mod pubsub;
pub mod rpc;
pub mod state;
pub mod transport;
pub mod types;


pub use error::{NotifyError, WatchError};
pub use feed::{ActivityFeed, FeedSource, Notifier, PushConnector, PushSession};
pub use manager::{WatchManager, WatcherSettings};
pub use pubsub::LogsPubsub;
pub use rpc::RpcActivityFeed;
pub use state::WatchState;
pub use transport::{ReconnectingTransport, TransportEvent, TransportSettings};
pub use types::{
    ActivityRecord, AddOutcome, ConnectionState, FeedMode, NotificationEvent, PushedActivity,
    RemoveOutcome, WatchedAddress,
};
