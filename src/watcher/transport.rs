//! One logical subscription to "all currently watched addresses", kept alive
//! across failures.
//!
//! The transport runs as a single tokio task. Whether it polls or holds a push
//! socket is decided by the `FeedSource`; either way it reports activity to
//! the manager as `TransportEvent`s and reconnects with bounded exponential
//! backoff. The address set arrives through a `watch` channel so a reconnect
//! always subscribes with the latest set.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::watcher::backoff::Backoff;
use crate::watcher::error::WatchError;
use crate::watcher::feed::{ActivityFeed, FeedSource, PushConnector};
use crate::watcher::types::{ActivityRecord, ConnectionState, PushedActivity};

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub poll_interval: Duration,
    /// Records requested per address on each fetch.
    pub fetch_limit: usize,
    /// Consecutive all-failed poll ticks before the session counts as lost.
    pub poll_failure_threshold: u32,
    pub reconnect_base: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    /// Upper bound on every network call.
    pub request_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            fetch_limit: 10,
            poll_failure_threshold: 3,
            reconnect_base: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            max_reconnect_attempts: 5,
            ping_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of fetching one address during a poll tick.
#[derive(Debug)]
pub struct PolledBatch {
    pub address: String,
    /// Newest first.
    pub records: Vec<ActivityRecord>,
}

#[derive(Debug)]
pub enum TransportEvent {
    /// One poll tick; only addresses whose fetch succeeded are present.
    Polled(Vec<PolledBatch>),
    Pushed(PushedActivity),
    /// Connected again after at least one disconnect.
    Reconnected,
    /// Backoff budget exhausted; the transport task has exited.
    TransportLost { attempts: u32 },
}

/// Run `fut` with an upper bound, mapping expiry to `WatchError::Timeout`.
pub async fn bounded<T, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T, WatchError>
where
    F: Future<Output = Result<T, WatchError>>,
{
    match time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(WatchError::Timeout { operation, after: limit }),
    }
}

pub struct ReconnectingTransport {
    addresses: watch::Sender<Vec<String>>,
    state: Arc<watch::Sender<ConnectionState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingTransport {
    /// Spawn the transport task. The initial state is `Connecting`.
    pub fn start(
        source: FeedSource,
        feed: Arc<dyn ActivityFeed>,
        settings: TransportSettings,
        addresses: Vec<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self::spawn(source, feed, settings, addresses, events, false)
    }

    /// Like `start`, for a transport replacing one that was lost: the first
    /// connect already emits `Reconnected`.
    pub fn resume(
        source: FeedSource,
        feed: Arc<dyn ActivityFeed>,
        settings: TransportSettings,
        addresses: Vec<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self::spawn(source, feed, settings, addresses, events, true)
    }

    fn spawn(
        source: FeedSource,
        feed: Arc<dyn ActivityFeed>,
        settings: TransportSettings,
        addresses: Vec<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
        connected_before: bool,
    ) -> Self {
        let (addresses_tx, addresses_rx) = watch::channel(addresses);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state_tx);

        let backoff = Backoff::new(
            settings.reconnect_base,
            settings.reconnect_max_delay,
            settings.max_reconnect_attempts,
        );
        info!(mode = %source.mode(), "starting transport");

        let runner = Runner {
            source,
            feed,
            settings,
            addresses: addresses_rx,
            state: state.clone(),
            events,
            backoff,
            connected_before,
        };
        let task = tokio::spawn(runner.run());

        Self {
            addresses: addresses_tx,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Replace the subscribed address set.
    ///
    /// A live push session re-sends its subscription immediately; otherwise
    /// the next connect (or poll tick) reads the new set.
    pub fn update_subscription(&self, addresses: Vec<String>) {
        debug!(addresses = addresses.len(), "subscription set updated");
        self.addresses.send_replace(addresses);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Abort the connection task and enter `Stopped`. Idempotent.
    pub fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
            info!("transport stopped");
        }
        self.state.send_replace(ConnectionState::Stopped);
    }
}

impl Drop for ReconnectingTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Runner {
    source: FeedSource,
    feed: Arc<dyn ActivityFeed>,
    settings: TransportSettings,
    addresses: watch::Receiver<Vec<String>>,
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    backoff: Backoff,
    connected_before: bool,
}

impl Runner {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);

            let source = self.source.clone();
            let outcome = match source {
                FeedSource::Polling => self.poll_session().await,
                FeedSource::Push(connector) => self.push_session(connector.as_ref()).await,
            };

            // Ok means the manager went away.
            let err = match outcome {
                Ok(()) => {
                    debug!("transport owner gone, exiting");
                    return;
                }
                Err(e) => e,
            };
            self.set_state(ConnectionState::Disconnected);

            match self.backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        error = %err,
                        attempt = self.backoff.failures(),
                        max_attempts = self.backoff.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "transport session failed, reconnecting"
                    );
                    time::sleep(delay).await;
                }
                None => {
                    let attempts = self.backoff.max_attempts();
                    error!(error = %err, attempts, "transport lost, no further reconnect attempts");
                    let _ = self.events.send(TransportEvent::TransportLost { attempts });
                    return;
                }
            }
        }
    }

    /// `Stopped` is terminal even if this task races an abort.
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Stopped || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Returns false if the manager is gone.
    fn mark_connected(&mut self) -> bool {
        self.set_state(ConnectionState::Connected);
        self.backoff.reset();
        if self.connected_before {
            info!("transport reconnected");
            self.events.send(TransportEvent::Reconnected).is_ok()
        } else {
            self.connected_before = true;
            info!("transport connected");
            true
        }
    }

    /// Poll every watched address on a fixed interval. The session is
    /// Connected after its first tick with at least one successful fetch.
    async fn poll_session(&mut self) -> Result<(), WatchError> {
        let limit = self.settings.fetch_limit;
        let timeout = self.settings.request_timeout;
        let threshold = self.settings.poll_failure_threshold.max(1);
        let feed = self.feed.clone();

        let mut ticker = time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failed_ticks = 0u32;
        let mut connected = false;

        loop {
            ticker.tick().await;
            if self.events.is_closed() {
                return Ok(());
            }

            let addresses = self.addresses.borrow().clone();
            let results = join_all(
                addresses
                    .iter()
                    .map(|address| bounded(timeout, "fetch_recent", feed.fetch_recent(address, limit))),
            )
            .await;

            let mut batches = Vec::with_capacity(addresses.len());
            let mut last_error = None;
            for (address, result) in addresses.into_iter().zip(results) {
                match result {
                    Ok(records) => batches.push(PolledBatch { address, records }),
                    Err(e) => {
                        warn!(address = %address, error = %e, "activity fetch failed, retrying next tick");
                        last_error = Some(e);
                    }
                }
            }

            if let Some(e) = last_error.filter(|_| batches.is_empty()) {
                failed_ticks += 1;
                if failed_ticks >= threshold {
                    return Err(WatchError::Transport(format!(
                        "{failed_ticks} consecutive poll ticks failed, last error: {e}"
                    )));
                }
                continue;
            }
            failed_ticks = 0;

            if !connected {
                connected = true;
                if !self.mark_connected() {
                    return Ok(());
                }
            }

            if !batches.is_empty() && self.events.send(TransportEvent::Polled(batches)).is_err() {
                return Ok(());
            }
        }
    }

    /// Hold one push connection: subscribe with the current set, resubscribe
    /// on every set change, ping on an interval, forward activity.
    async fn push_session(&mut self, connector: &dyn PushConnector) -> Result<(), WatchError> {
        let timeout = self.settings.request_timeout;
        let mut session = bounded(timeout, "connect", connector.connect()).await?;

        let current = self.addresses.borrow_and_update().clone();
        bounded(timeout, "subscribe", session.subscribe(&current)).await?;
        info!(addresses = current.len(), "push subscription sent");

        if !self.mark_connected() {
            return Ok(());
        }

        let period = self.settings.ping_interval;
        let mut ping = time::interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = self.addresses.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let current = self.addresses.borrow_and_update().clone();
                    bounded(timeout, "subscribe", session.subscribe(&current)).await?;
                    info!(addresses = current.len(), "push subscription replaced");
                }
                _ = ping.tick() => {
                    bounded(timeout, "ping", session.ping()).await?;
                    debug!("keep-alive ping sent");
                }
                next = session.next_activity() => match next {
                    Some(Ok(activity)) => {
                        if self.events.send(TransportEvent::Pushed(activity)).is_err() {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Err(WatchError::Transport("connection closed by upstream".into())),
                },
            }
        }
    }
}
