//! Opaque handles for objects that cross the trust boundary

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque identifier naming a worker or callback on one side of the bridge
///
/// A beacon is only meaningful to the registry of the side that minted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Beacon(String);

impl Beacon {
    /// Wrap an existing identifier received over the wire
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Beacon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Beacon {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Mints beacons of the form `<prefix>/<sequence>`
///
/// The random prefix keeps beacons from two allocators (or two page loads)
/// apart; the sequence never repeats for the allocator's lifetime.
#[derive(Debug)]
pub struct BeaconAllocator {
    prefix: String,
    next: AtomicU64,
}

impl BeaconAllocator {
    pub fn new() -> Self {
        let prefix: u64 = rand::thread_rng().r#gen();
        Self::with_prefix(format!("{prefix:016x}"))
    }

    /// Create an allocator with a fixed prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(0),
        }
    }

    pub fn allocate(&self) -> Beacon {
        let sequence = self.next.fetch_add(1, Ordering::Relaxed);
        Beacon(format!("{}/{}", self.prefix, sequence))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for BeaconAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_allocate_is_monotonic() {
        let allocator = BeaconAllocator::with_prefix("page");

        assert_eq!(allocator.allocate().as_str(), "page/0");
        assert_eq!(allocator.allocate().as_str(), "page/1");
        assert_eq!(allocator.allocate().as_str(), "page/2");
    }

    #[test]
    fn test_allocate_never_collides() {
        let allocator = BeaconAllocator::new();
        let beacons: HashSet<Beacon> = (0..1000).map(|_| allocator.allocate()).collect();

        assert_eq!(beacons.len(), 1000);
    }

    #[test]
    fn test_independent_allocators_use_distinct_prefixes() {
        let a = BeaconAllocator::new();
        let b = BeaconAllocator::new();

        assert_ne!(a.prefix(), b.prefix());
        assert_ne!(a.allocate(), b.allocate());
    }

    #[test]
    fn test_beacon_serializes_as_plain_string() {
        let beacon = Beacon::from("abc/7");
        let json = serde_json::to_value(&beacon).unwrap();

        assert_eq!(json, serde_json::json!("abc/7"));
    }
}
