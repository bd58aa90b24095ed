//! Watch manager: owns the watch set and the transport, turns transport
//! events into deduplicated notifications.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use regex::Regex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::watcher::dedupe::SeenIds;
use crate::watcher::error::WatchError;
use crate::watcher::feed::{ActivityFeed, FeedSource, Notifier};
use crate::watcher::state::WatchState;
use crate::watcher::transport::{
    bounded, PolledBatch, ReconnectingTransport, TransportEvent, TransportSettings,
};
use crate::watcher::types::{
    ActivityRecord, AddOutcome, ConnectionState, FeedMode, NotificationEvent, PushedActivity,
    RemoveOutcome, WatchedAddress,
};

/// Base58, 32 to 44 characters: the shape of a Solana public key.
pub const DEFAULT_ADDRESS_PATTERN: &str = r"^[1-9A-HJ-NP-Za-km-z]{32,44}$";

pub fn default_address_pattern() -> Regex {
    Regex::new(DEFAULT_ADDRESS_PATTERN).expect("default address pattern compiles")
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub transport: TransportSettings,
    /// In push mode, poll every address after a reconnect to recover
    /// activity missed while disconnected.
    pub backfill_on_reconnect: bool,
    /// How many notified ids to remember for cross-path dedupe.
    pub seen_capacity: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            transport: TransportSettings::default(),
            backfill_on_reconnect: true,
            seen_capacity: 4096,
        }
    }
}

/// State shared between the command path and the dispatcher task.
struct Core {
    state: WatchState,
    feed: Arc<dyn ActivityFeed>,
    notifier: Arc<dyn Notifier>,
    seen: Mutex<SeenIds>,
    mode: FeedMode,
    settings: WatcherSettings,
    transport_lost: AtomicBool,
}

struct Running {
    transport: ReconnectingTransport,
    dispatcher: JoinHandle<()>,
}

impl Running {
    fn stop(self) {
        self.transport.stop();
        self.dispatcher.abort();
    }
}

pub struct WatchManager {
    core: Arc<Core>,
    source: FeedSource,
    validator: Regex,
    running: Mutex<Option<Running>>,
    stopped: AtomicBool,
}

impl WatchManager {
    pub fn new(
        feed: Arc<dyn ActivityFeed>,
        source: FeedSource,
        notifier: Arc<dyn Notifier>,
        settings: WatcherSettings,
    ) -> Self {
        let core = Core {
            state: WatchState::new(),
            feed,
            notifier,
            seen: Mutex::new(SeenIds::new(settings.seen_capacity)),
            mode: source.mode(),
            settings,
            transport_lost: AtomicBool::new(false),
        };
        Self {
            core: Arc::new(core),
            source,
            validator: default_address_pattern(),
            running: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Replace the address format check.
    pub fn with_validator(mut self, validator: Regex) -> Self {
        self.validator = validator;
        self
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn validate(&self, address: &str) -> Result<String, WatchError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(WatchError::invalid(address, "address is empty"));
        }
        if !self.validator.is_match(address) {
            return Err(WatchError::invalid(address, "not a recognised wallet address"));
        }
        Ok(address.to_string())
    }

    /// Register `initial` addresses, bootstrap their cursors, and start the
    /// transport. Invalid entries are skipped with a warning.
    pub async fn start(&self, initial: Vec<String>) {
        for address in initial {
            match self.validate(&address) {
                Ok(address) => {
                    self.core.state.add(&address);
                }
                Err(e) => warn!(error = %e, "skipping stored address"),
            }
        }

        let addresses = self.core.state.addresses();
        join_all(addresses.iter().map(|a| self.core.bootstrap(a))).await;
        info!(addresses = addresses.len(), mode = %self.core.mode, "watcher starting");
        self.spawn_runtime(false);
    }

    /// Start a fresh transport, e.g. after `TransportLost`. Cursors and the
    /// watch set are kept, and its first connect counts as a reconnect so the
    /// outage is caught up on.
    pub fn restart(&self) {
        info!("restarting watcher transport");
        self.spawn_runtime(true);
    }

    /// Restart unless the transport is connected or still retrying. Returns
    /// whether a restart happened.
    pub fn recover(&self) -> bool {
        match self.connection_state() {
            ConnectionState::Connected | ConnectionState::Connecting if !self.transport_lost() => false,
            _ => {
                self.restart();
                true
            }
        }
    }

    pub fn stop(&self) {
        if let Some(running) = self.running().take() {
            running.stop();
            self.stopped.store(true, Ordering::SeqCst);
            info!("watcher stopped");
        }
    }

    fn spawn_runtime(&self, resume: bool) {
        let mut running = self.running();
        if let Some(previous) = running.take() {
            previous.stop();
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let source = self.source.clone();
        let feed = self.core.feed.clone();
        let settings = self.core.settings.transport.clone();
        let addresses = self.core.state.addresses();
        let transport = if resume {
            ReconnectingTransport::resume(source, feed, settings, addresses, events_tx)
        } else {
            ReconnectingTransport::start(source, feed, settings, addresses, events_tx)
        };
        let dispatcher = tokio::spawn(dispatch_loop(self.core.clone(), events_rx));
        self.core.transport_lost.store(false, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);
        *running = Some(Running { transport, dispatcher });
    }

    pub async fn add_address(&self, address: &str) -> Result<AddOutcome, WatchError> {
        let address = self.validate(address)?;
        if !self.core.state.add(&address) {
            debug!(address = %address, "already watched");
            return Ok(AddOutcome::AlreadyWatched);
        }
        info!(address = %address, "watching address");
        self.push_subscription();
        self.core.bootstrap(&address).await;
        Ok(AddOutcome::Added)
    }

    pub async fn remove_address(&self, address: &str) -> Result<RemoveOutcome, WatchError> {
        let address = self.validate(address)?;
        if !self.core.state.remove(&address) {
            return Ok(RemoveOutcome::NotWatched);
        }
        info!(address = %address, "stopped watching address");
        self.push_subscription();
        Ok(RemoveOutcome::Removed)
    }

    pub fn list_addresses(&self) -> Vec<String> {
        self.core.state.addresses()
    }

    pub fn watched(&self) -> Vec<WatchedAddress> {
        self.core.state.list()
    }

    pub fn cursor(&self, address: &str) -> Option<String> {
        self.core.state.cursor(address)
    }

    pub fn mode(&self) -> FeedMode {
        self.core.mode
    }

    /// `Disconnected` before the first start, `Stopped` after `stop`.
    pub fn connection_state(&self) -> ConnectionState {
        match self.running().as_ref() {
            Some(running) => running.transport.state(),
            None if self.stopped.load(Ordering::SeqCst) => ConnectionState::Stopped,
            None => ConnectionState::Disconnected,
        }
    }

    pub fn subscribe_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.running().as_ref().map(|r| r.transport.subscribe_state())
    }

    /// True once the backoff budget ran out, until the next restart.
    pub fn transport_lost(&self) -> bool {
        self.core.transport_lost.load(Ordering::SeqCst)
    }

    // The read of the address set happens under the same lock as the send so
    // concurrent add/remove calls cannot deliver a stale set last.
    fn push_subscription(&self) {
        let running = self.running();
        if let Some(running) = running.as_ref() {
            running.transport.update_subscription(self.core.state.addresses());
        }
    }
}

impl Drop for WatchManager {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn dispatch_loop(core: Arc<Core>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Polled(batches) => {
                let notifications = core.collect_polled(batches);
                core.deliver(notifications).await;
            }
            TransportEvent::Pushed(activity) => {
                if let Some(notification) = core.collect_pushed(activity) {
                    core.deliver(vec![notification]).await;
                }
            }
            TransportEvent::Reconnected => {
                if core.mode == FeedMode::Push && core.settings.backfill_on_reconnect {
                    core.catch_up().await;
                }
            }
            TransportEvent::TransportLost { attempts } => core.transport_lost(attempts).await,
        }
    }
    debug!("dispatcher exiting");
}

impl Core {
    /// Prime the cursor of a newly watched address without notifying.
    async fn bootstrap(&self, address: &str) {
        let timeout = self.settings.transport.request_timeout;
        match bounded(timeout, "fetch_recent", self.feed.fetch_recent(address, 1)).await {
            Ok(records) => {
                let newest = records.first().map(|r| r.id.as_str());
                if self.state.prime(address, newest) {
                    info!(address = %address, cursor = ?newest, "cursor bootstrapped");
                }
            }
            Err(e) => {
                warn!(address = %address, error = %e, "cursor bootstrap failed, next fetch will prime it");
            }
        }
    }

    /// Advance cursors over one poll tick and build the new notifications.
    ///
    /// A record seen under several addresses in the same tick becomes a single
    /// event listing all of them.
    fn collect_polled(&self, batches: Vec<PolledBatch>) -> Vec<NotificationEvent> {
        let mut events: Vec<NotificationEvent> = Vec::new();
        for batch in batches {
            let Some(fresh) = self.state.advance(&batch.address, &batch.records) else {
                debug!(address = %batch.address, "address removed mid-tick, dropping batch");
                continue;
            };
            for record in fresh {
                match events.iter_mut().find(|e| e.record.id == record.id) {
                    Some(existing) => {
                        existing.addresses.insert(batch.address.clone());
                    }
                    None => events.push(NotificationEvent {
                        addresses: BTreeSet::from([batch.address.clone()]),
                        record,
                    }),
                }
            }
        }

        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        events.retain(|e| seen.insert(&e.record.id));
        events
    }

    /// Match a pushed activity against the watch set and advance cursors.
    ///
    /// Only addresses whose own subscription delivered the activity move
    /// their cursor; the signature is not in the history of an address that
    /// merely appears in the log text. An id already seen leaves every cursor
    /// untouched so a late duplicate cannot move one backwards.
    fn collect_pushed(&self, activity: PushedActivity) -> Option<NotificationEvent> {
        let logs = activity.logs.join("\n");
        let addresses: BTreeSet<String> = self
            .state
            .matching(|a| activity.addresses.iter().any(|s| s == a) || logs.contains(a))
            .into_iter()
            .collect();

        let Some(primary) = addresses.iter().next().cloned() else {
            debug!(id = %activity.id, "pushed activity matches no watched address");
            return None;
        };

        {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            if !seen.insert(&activity.id) {
                debug!(id = %activity.id, "duplicate activity suppressed");
                return None;
            }
        }

        for address in addresses.iter().filter(|a| activity.addresses.contains(*a)) {
            self.state.set_cursor(address, &activity.id);
        }

        Some(NotificationEvent {
            addresses,
            record: ActivityRecord {
                id: activity.id,
                address: primary,
                timestamp: activity.timestamp,
                raw: activity.raw,
            },
        })
    }

    /// Poll every address once to recover activity missed while the push
    /// connection was down.
    async fn catch_up(&self) {
        let limit = self.settings.transport.fetch_limit;
        let timeout = self.settings.transport.request_timeout;
        let addresses = self.state.addresses();
        info!(addresses = addresses.len(), "reconnected, catching up on missed activity");

        let results = join_all(
            addresses
                .iter()
                .map(|a| bounded(timeout, "fetch_recent", self.feed.fetch_recent(a, limit))),
        )
        .await;

        let mut batches = Vec::with_capacity(addresses.len());
        for (address, result) in addresses.into_iter().zip(results) {
            match result {
                Ok(records) => batches.push(PolledBatch { address, records }),
                Err(e) => warn!(address = %address, error = %e, "catch-up fetch failed"),
            }
        }

        let notifications = self.collect_polled(batches);
        if !notifications.is_empty() {
            info!(recovered = notifications.len(), "recovered activity missed during disconnect");
        }
        self.deliver(notifications).await;
    }

    /// Hand events to the notifier in order. Failures are logged only.
    async fn deliver(&self, events: Vec<NotificationEvent>) {
        let timeout = self.settings.transport.request_timeout;
        for event in events {
            match time::timeout(timeout, self.notifier.notify(&event)).await {
                Ok(Ok(())) => {
                    info!(id = %event.record.id, addresses = ?event.addresses, "notification sent");
                }
                Ok(Err(e)) => {
                    warn!(id = %event.record.id, error = %e, "notification failed");
                }
                Err(_) => {
                    warn!(id = %event.record.id, "notification timed out");
                }
            }
        }
    }

    async fn transport_lost(&self, attempts: u32) {
        self.transport_lost.store(true, Ordering::SeqCst);
        let err = WatchError::TransportLost { attempts };
        error!(error = %err, "watcher paused until restarted");

        let text = format!(
            "Wallet watcher lost its upstream connection after {attempts} reconnect attempts. \
             Watching is paused until restarted."
        );
        if let Err(e) = self.notifier.alert(&text).await {
            warn!(error = %e, "failed to deliver transport-lost alert");
        }
    }
}
