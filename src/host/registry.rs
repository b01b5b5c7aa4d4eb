//! Beacon table for one page on the privileged side

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::beacon::Beacon;
use crate::host::callback::ForwardingCallback;
use crate::host::worker::Worker;

/// What a beacon names on the privileged side
pub(crate) enum Entry {
    /// A worker, owned by the registry alone
    Worker(Arc<dyn Worker>),
    /// A forwarding callback, kept alive by whoever listens with it
    Callback(Weak<ForwardingCallback>),
}

/// Beacon → live object map; each beacon maps to at most one entry
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<Beacon, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a worker if the beacon is free, returning whether it was inserted
    pub fn insert_worker(&mut self, beacon: Beacon, worker: Arc<dyn Worker>) -> bool {
        if self.entries.contains_key(&beacon) {
            return false;
        }
        self.entries.insert(beacon, Entry::Worker(worker));
        true
    }

    pub fn insert_callback(&mut self, beacon: Beacon, callback: &Arc<ForwardingCallback>) {
        self.entries
            .insert(beacon, Entry::Callback(Arc::downgrade(callback)));
    }

    pub fn get(&self, beacon: &Beacon) -> Option<&Entry> {
        self.entries.get(beacon)
    }

    pub fn worker(&self, beacon: &Beacon) -> Option<Arc<dyn Worker>> {
        match self.entries.get(beacon)? {
            Entry::Worker(worker) => Some(Arc::clone(worker)),
            Entry::Callback(_) => None,
        }
    }

    /// Remove an entry; the caller drops it outside any lock
    pub fn remove(&mut self, beacon: &Beacon) -> Option<Entry> {
        self.entries.remove(beacon)
    }

    /// Remove a callback entry whose callback has been dropped
    ///
    /// A beacon re-bound to a fresh callback since it was queued is left alone.
    pub fn remove_dead_callback(&mut self, beacon: &Beacon) -> bool {
        let dead = matches!(
            self.entries.get(beacon),
            Some(Entry::Callback(weak)) if weak.strong_count() == 0
        );
        if dead {
            self.entries.remove(beacon);
        }
        dead
    }

    pub fn contains(&self, beacon: &Beacon) -> bool {
        self.entries.contains_key(beacon)
    }

    pub fn beacons(&self) -> Vec<Beacon> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
