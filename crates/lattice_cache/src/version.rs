//! Version domain for ordering concurrent updates.
//!
//! Every committed write carries a `CacheVersion` assigned by the primary at
//! apply time. Versions produced in the same data center are totally ordered;
//! versions from different data centers are not comparable and are settled by
//! a [`ConflictResolver`].

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};

/// Totally-ordered (within one data center) write stamp.
///
/// Ordering is lexicographic on `(topology_version, order, node_order)`;
/// `order` is a strictly increasing per-node counter and `node_order` is the
/// ordinal of the producing node in the membership at that topology version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheVersion {
    pub topology_version: u64,
    pub order: u64,
    pub node_order: u32,
    pub data_center_id: u8,
}

impl CacheVersion {
    /// Sentinel for "no version assigned yet".
    pub const ZERO: CacheVersion = CacheVersion {
        topology_version: 0,
        order: 0,
        node_order: 0,
        data_center_id: 0,
    };

    pub fn is_zero(&self) -> bool {
        self.topology_version == 0 && self.order == 0 && self.node_order == 0
    }

    /// Compare against another version from the same data center.
    ///
    /// Returns `None` when the data centers differ; the caller must consult
    /// the conflict resolver in that case.
    pub fn try_cmp(&self, other: &CacheVersion) -> Option<Ordering> {
        if self.data_center_id != other.data_center_id {
            return None;
        }
        Some(
            self.topology_version
                .cmp(&other.topology_version)
                .then(self.order.cmp(&other.order))
                .then(self.node_order.cmp(&other.node_order)),
        )
    }
}

impl PartialOrd for CacheVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.try_cmp(other)
    }
}

/// Per-node monotonic version generator.
pub struct VersionSource {
    order: AtomicU64,
    node_order: AtomicU32,
    data_center_id: u8,
}

impl VersionSource {
    pub fn new(data_center_id: u8) -> Self {
        Self {
            order: AtomicU64::new(0),
            node_order: AtomicU32::new(0),
            data_center_id,
        }
    }

    /// Produce the next version for an update mapped at `topology_version`.
    pub fn next(&self, topology_version: u64) -> CacheVersion {
        CacheVersion {
            topology_version,
            order: self.order.fetch_add(1, AtomicOrdering::Relaxed) + 1,
            node_order: self.node_order.load(AtomicOrdering::Relaxed),
            data_center_id: self.data_center_id,
        }
    }

    /// Record the local node's ordinal after a membership change.
    pub fn set_node_order(&self, node_order: u32) {
        self.node_order.store(node_order, AtomicOrdering::Relaxed);
    }

    pub fn data_center_id(&self) -> u8 {
        self.data_center_id
    }
}

/// Outcome of a cross-data-center conflict decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    UseIncoming,
    KeepCurrent,
}

/// Decides between two non-comparable versions for the same key.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, current: &CacheVersion, incoming: &CacheVersion) -> ConflictDecision;
}

/// Default resolver: the incoming write wins.
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn resolve(&self, _current: &CacheVersion, _incoming: &CacheVersion) -> ConflictDecision {
        ConflictDecision::UseIncoming
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ver(top: u64, order: u64, node: u32) -> CacheVersion {
        CacheVersion {
            topology_version: top,
            order,
            node_order: node,
            data_center_id: 0,
        }
    }

    #[test]
    fn lexicographic_ordering() {
        assert!(ver(1, 5, 0) < ver(2, 1, 0));
        assert!(ver(2, 1, 0) < ver(2, 2, 0));
        assert!(ver(2, 2, 1) > ver(2, 2, 0));
        assert_eq!(ver(3, 4, 5).try_cmp(&ver(3, 4, 5)), Some(Ordering::Equal));
    }

    #[test]
    fn cross_dc_versions_are_not_comparable() {
        let a = ver(1, 1, 0);
        let mut b = ver(1, 2, 0);
        b.data_center_id = 1;
        assert_eq!(a.try_cmp(&b), None);
        assert_eq!(a.partial_cmp(&b), None);
    }

    #[test]
    fn source_is_strictly_increasing() {
        let src = VersionSource::new(0);
        src.set_node_order(3);
        let a = src.next(7);
        let b = src.next(7);
        assert!(a < b);
        assert_eq!(a.node_order, 3);
        assert_eq!(a.topology_version, 7);
    }
}
