//! Seams between the watcher core and the outside world.
//!
//! `ActivityFeed` is the address-keyed recent-activity query behind every
//! poll and catch-up. `PushConnector`/`PushSession` are the live subscription
//! primitive. `Notifier` is the outbound sink.

use std::sync::Arc;

use async_trait::async_trait;

use crate::watcher::error::{NotifyError, WatchError};
use crate::watcher::types::{ActivityRecord, FeedMode, NotificationEvent, PushedActivity};

#[async_trait]
pub trait ActivityFeed: Send + Sync {
    /// Up to `limit` most recent records for `address`, newest first.
    async fn fetch_recent(&self, address: &str, limit: usize) -> Result<Vec<ActivityRecord>, WatchError>;
}

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PushSession>, WatchError>;
}

/// One live push connection.
#[async_trait]
pub trait PushSession: Send {
    /// Replace the subscription with exactly `addresses`.
    async fn subscribe(&mut self, addresses: &[String]) -> Result<(), WatchError>;

    /// Best-effort keep-alive. Only a send failure is an error.
    async fn ping(&mut self) -> Result<(), WatchError>;

    /// Next activity, `Some(Err)` on a socket error, `None` when the upstream
    /// closed the connection. Must be cancel-safe.
    async fn next_activity(&mut self) -> Option<Result<PushedActivity, WatchError>>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError>;

    /// Plain-text operator alert (e.g. permanent transport loss).
    async fn alert(&self, text: &str) -> Result<(), NotifyError>;
}

/// Live delivery mechanism, chosen by configuration.
#[derive(Clone)]
pub enum FeedSource {
    Polling,
    Push(Arc<dyn PushConnector>),
}

impl FeedSource {
    pub fn mode(&self) -> FeedMode {
        match self {
            Self::Polling => FeedMode::Polling,
            Self::Push(_) => FeedMode::Push,
        }
    }
}
