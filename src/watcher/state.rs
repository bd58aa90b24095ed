//! Active watch set with per-address cursors.
//!
//! The command path (add/remove) and the dispatcher (cursor advance) both go
//! through the same mutex, so an add racing an in-flight poll tick cannot lose
//! an update.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::watcher::dedupe::new_since_cursor;
use crate::watcher::types::{ActivityRecord, WatchedAddress};

#[derive(Default)]
pub struct WatchState {
    entries: Mutex<Vec<WatchedAddress>>,
}

impl WatchState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<WatchedAddress>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false if the address is already watched.
    pub fn add(&self, address: &str) -> bool {
        let mut entries = self.lock();
        if entries.iter().any(|w| w.address == address) {
            return false;
        }
        entries.push(WatchedAddress::new(address));
        true
    }

    /// Returns false if the address was not watched. Drops its cursor.
    pub fn remove(&self, address: &str) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|w| w.address != address);
        entries.len() != before
    }

    /// Snapshot in insertion order.
    pub fn list(&self) -> Vec<WatchedAddress> {
        self.lock().clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.lock().iter().map(|w| w.address.clone()).collect()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lock().iter().any(|w| w.address == address)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn cursor(&self, address: &str) -> Option<String> {
        self.lock()
            .iter()
            .find(|w| w.address == address)
            .and_then(|w| w.last_seen_id.clone())
    }

    /// Returns false if the address is not watched.
    pub fn set_cursor(&self, address: &str, id: &str) -> bool {
        let mut entries = self.lock();
        match entries.iter_mut().find(|w| w.address == address) {
            Some(w) => {
                w.last_seen_id = Some(id.to_string());
                w.primed = true;
                true
            }
            None => false,
        }
    }

    /// Bootstrap the cursor of an address that has not been primed yet.
    ///
    /// `newest` is the newest id currently visible upstream, or `None` if the
    /// address has no history. Returns false if the address is unknown or was
    /// already primed (e.g. by a poll tick that beat the bootstrap fetch).
    pub fn prime(&self, address: &str, newest: Option<&str>) -> bool {
        let mut entries = self.lock();
        match entries.iter_mut().find(|w| w.address == address) {
            Some(w) if !w.primed => {
                w.last_seen_id = newest.map(str::to_string);
                w.primed = true;
                true
            }
            _ => false,
        }
    }

    /// Advance the cursor of `address` over a newest-first fetch result.
    ///
    /// Returns the records not seen before, oldest first, or `None` if the
    /// address is no longer watched. An unprimed address is bootstrapped
    /// instead: its cursor is set to the newest record and nothing is returned.
    /// An empty fetch leaves the cursor unchanged.
    pub fn advance(&self, address: &str, records: &[ActivityRecord]) -> Option<Vec<ActivityRecord>> {
        let mut entries = self.lock();
        let entry = entries.iter_mut().find(|w| w.address == address)?;

        if !entry.primed {
            entry.primed = true;
            entry.last_seen_id = records.first().map(|r| r.id.clone());
            return Some(Vec::new());
        }

        let fresh = new_since_cursor(records, entry.last_seen_id.as_deref());
        if let Some(newest) = records.first() {
            entry.last_seen_id = Some(newest.id.clone());
        }
        Some(fresh)
    }

    /// Watched addresses for which `pred` holds, in insertion order.
    pub fn matching<F>(&self, mut pred: F) -> Vec<String>
    where
        F: FnMut(&str) -> bool,
    {
        self.lock()
            .iter()
            .filter(|w| pred(&w.address))
            .map(|w| w.address.clone())
            .collect()
    }
}
