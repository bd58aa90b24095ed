use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by the watcher core and its collaborators.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    /// Connect/send/close failure; retried per the backoff policy.
    #[error("transport error: {0}")]
    Transport(String),
    /// A single fetch failed; skipped until the next tick.
    #[error("upstream query failed: {0}")]
    UpstreamQuery(String),
    #[error("notifier error: {0}")]
    Notifier(#[from] NotifyError),
    #[error("transport lost after {attempts} reconnect attempts")]
    TransportLost { attempts: u32 },
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },
}

impl WatchError {
    pub fn invalid(address: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("delivery failed: {0}")]
    Failed(String),
}
