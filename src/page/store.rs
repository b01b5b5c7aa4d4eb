//! Sandboxed-side beacon table

use std::collections::HashMap;
use std::sync::Arc;

use crate::beacon::{Beacon, BeaconAllocator};
use crate::marshal::{Callback, callback_identity};

/// What a page-side beacon names
#[derive(Clone)]
pub(crate) enum Slot {
    /// A page function exported to the host
    Function(Callback),
    /// A worker created by this page; the worker itself lives on the host
    Worker,
}

/// Beacon → page object, plus the reverse map that makes export idempotent
///
/// The store owns the canonical function; its identity is only stable while the
/// store holds it, which is exactly as long as the reverse entry exists.
#[derive(Default)]
pub(crate) struct Store {
    slots: HashMap<Beacon, Slot>,
    exported: HashMap<usize, Beacon>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Beacon for `callback`, minting and recording one on first export
    pub fn export(&mut self, callback: &Callback, beacons: &BeaconAllocator) -> Beacon {
        let identity = callback_identity(callback);
        if let Some(beacon) = self.exported.get(&identity) {
            return beacon.clone();
        }

        let beacon = beacons.allocate();
        self.slots
            .insert(beacon.clone(), Slot::Function(Arc::clone(callback)));
        self.exported.insert(identity, beacon.clone());
        beacon
    }

    pub fn insert_worker(&mut self, beacon: Beacon) {
        self.slots.insert(beacon, Slot::Worker);
    }

    pub fn function(&self, beacon: &Beacon) -> Option<Callback> {
        match self.slots.get(beacon)? {
            Slot::Function(callback) => Some(Arc::clone(callback)),
            Slot::Worker => None,
        }
    }

    /// Whether `callback` is currently exported
    pub fn exported(&self, callback: &Callback) -> Option<Beacon> {
        self.exported.get(&callback_identity(callback)).cloned()
    }

    /// Remove a slot together with its reverse entry
    pub fn delete(&mut self, beacon: &Beacon) -> Option<Slot> {
        let slot = self.slots.remove(beacon)?;
        if let Slot::Function(callback) = &slot {
            self.exported.remove(&callback_identity(callback));
        }
        Some(slot)
    }

    pub fn contains(&self, beacon: &Beacon) -> bool {
        self.slots.contains_key(beacon)
    }

    pub fn beacons(&self) -> Vec<Beacon> {
        self.slots.keys().cloned().collect()
    }

    /// Empty the store, handing back what it held
    pub fn clear(&mut self) -> Vec<Slot> {
        self.exported.clear();
        self.slots.drain().map(|(_, slot)| slot).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn callback() -> Callback {
        Arc::new(|_args: Vec<Value>| {})
    }

    #[test]
    fn test_export_is_idempotent_per_function() {
        let beacons = BeaconAllocator::with_prefix("page");
        let mut store = Store::new();
        let f = callback();
        let g = callback();

        let first = store.export(&f, &beacons);
        let again = store.export(&Arc::clone(&f), &beacons);
        let other = store.export(&g, &beacons);

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_delete_forgets_reverse_entry() {
        let beacons = BeaconAllocator::with_prefix("page");
        let mut store = Store::new();
        let f = callback();

        let first = store.export(&f, &beacons);
        assert!(matches!(store.delete(&first), Some(Slot::Function(_))));
        assert!(store.exported(&f).is_none());

        let second = store.export(&f, &beacons);
        assert_ne!(first, second);
        assert!(store.function(&second).is_some());
    }

    #[test]
    fn test_workers_are_not_functions() {
        let mut store = Store::new();
        let beacon = Beacon::from("page/7");
        store.insert_worker(beacon.clone());

        assert!(store.contains(&beacon));
        assert!(store.function(&beacon).is_none());
        assert_eq!(store.clear().len(), 1);
        assert_eq!(store.len(), 0);
    }
}
