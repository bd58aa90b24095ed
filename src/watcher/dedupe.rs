//! Signature dedupe: the cursor walk used by polling and a bounded memory of
//! ids already notified, shared by every delivery path.

use std::collections::{HashSet, VecDeque};

use crate::watcher::types::ActivityRecord;

/// Records newer than `cursor`, oldest first.
///
/// `records` must be newest first. The walk stops at the first record whose id
/// equals the cursor; if the cursor is absent from the window every record is
/// treated as new.
pub fn new_since_cursor(records: &[ActivityRecord], cursor: Option<&str>) -> Vec<ActivityRecord> {
    let mut fresh: Vec<ActivityRecord> = records
        .iter()
        .take_while(|r| Some(r.id.as_str()) != cursor)
        .cloned()
        .collect();
    fresh.reverse();
    fresh
}

/// FIFO-bounded set of recently notified ids.
pub struct SeenIds {
    capacity: usize,
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    /// Returns false if the id was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.set.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
