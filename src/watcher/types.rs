//! Core data types shared by the watcher components.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

/// An address in the active watch set.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedAddress {
    pub address: String,
    /// Most recent activity id already processed for this address.
    pub last_seen_id: Option<String>,
    pub added_at: DateTime<Utc>,
    /// Set once the cursor has been bootstrapped, even if history was empty.
    pub primed: bool,
}

impl WatchedAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            last_seen_id: None,
            added_at: Utc::now(),
            primed: false,
        }
    }
}

/// One piece of on-chain activity. Identity is `id` (the transaction signature),
/// regardless of whether it arrived by polling or by push.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub id: String,
    pub address: String,
    pub timestamp: DateTime<Utc>,
    pub raw: serde_json::Value,
}

impl ActivityRecord {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            timestamp: Utc::now(),
            raw: serde_json::Value::Null,
        }
    }
}

impl PartialEq for ActivityRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ActivityRecord {}

/// A deduplicated record together with every watched address it touches.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub addresses: BTreeSet<String>,
    pub record: ActivityRecord,
}

/// A record delivered by a push subscription, before address matching.
#[derive(Debug, Clone, PartialEq)]
pub struct PushedActivity {
    pub id: String,
    /// Addresses whose subscription delivered this notification.
    pub addresses: Vec<String>,
    pub logs: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// Lifecycle of the transport's single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; reached only through an explicit stop.
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyWatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotWatched,
}

/// How live activity reaches the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Polling,
    Push,
}

impl fmt::Display for FeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Polling => f.write_str("polling"),
            Self::Push => f.write_str("push"),
        }
    }
}
