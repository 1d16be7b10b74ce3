//! Partition topology: affinity, versioned ownership snapshots, and the
//! rebalance (preloader) gate.
//!
//! Ownership is computed deterministically from the member set, so every
//! node derives the same assignment for a given topology version without
//! coordination. Snapshots are `Arc`-shared: an in-flight update that read
//! topology at version `T` keeps the tables for `T` even while the listener
//! installs `T+1`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::NodeId;

/// Hash a key for partition selection.
pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Maps keys to partitions.
#[derive(Debug, Clone, Copy)]
pub struct Affinity {
    partition_count: u32,
}

impl Affinity {
    pub fn new(partition_count: u32) -> Self {
        Self { partition_count }
    }

    pub fn partition(&self, key: &[u8]) -> u32 {
        (hash_key(key) % u64::from(self.partition_count)) as u32
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }
}

/// Immutable ownership table for one topology version.
pub struct TopologySnapshot {
    pub version: u64,
    /// Sorted member ids; a node's index here is its `node_order`.
    pub members: Vec<NodeId>,
    assignments: Vec<Vec<NodeId>>,
}

impl TopologySnapshot {
    fn build(version: u64, mut members: Vec<NodeId>, partition_count: u32, backups: usize) -> Self {
        members.sort_unstable();
        members.dedup();
        let owners_per_part = (1 + backups).min(members.len().max(1));
        let mut assignments = Vec::with_capacity(partition_count as usize);
        for part in 0..partition_count {
            // Rendezvous ranking: every node scores each partition, the
            // highest scores own it. Stable under membership changes.
            let mut ranked: Vec<(u64, NodeId)> = members
                .iter()
                .map(|&node| {
                    let mut hasher = DefaultHasher::new();
                    node.hash(&mut hasher);
                    part.hash(&mut hasher);
                    (hasher.finish(), node)
                })
                .collect();
            ranked.sort_unstable_by(|a, b| b.cmp(a));
            assignments.push(ranked.into_iter().take(owners_per_part).map(|(_, n)| n).collect());
        }
        Self {
            version,
            members,
            assignments,
        }
    }

    /// Owning nodes of a partition, primary first.
    pub fn owners(&self, partition: u32) -> &[NodeId] {
        &self.assignments[partition as usize]
    }

    pub fn primary(&self, partition: u32) -> Option<NodeId> {
        self.assignments[partition as usize].first().copied()
    }

    pub fn is_owner(&self, partition: u32, node: NodeId) -> bool {
        self.assignments[partition as usize].contains(&node)
    }

    pub fn is_primary(&self, partition: u32, node: NodeId) -> bool {
        self.primary(partition) == Some(node)
    }

    /// Ordinal of `node` in the sorted membership.
    pub fn node_order(&self, node: NodeId) -> Option<u32> {
        self.members.binary_search(&node).ok().map(|i| i as u32)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.binary_search(&node).is_ok()
    }
}

/// Shared, versioned partition topology.
///
/// Readers take the read lock only long enough to clone the current snapshot
/// Arc; the membership listener holds the write lock only long enough to swap
/// in the next snapshot.
pub struct PartitionTopology {
    inner: RwLock<Arc<TopologySnapshot>>,
    version_tx: watch::Sender<u64>,
    partition_count: u32,
    backups: usize,
}

impl PartitionTopology {
    pub fn new(members: Vec<NodeId>, partition_count: u32, backups: usize) -> Self {
        let snapshot = Arc::new(TopologySnapshot::build(1, members, partition_count, backups));
        let (version_tx, _) = watch::channel(snapshot.version);
        Self {
            inner: RwLock::new(snapshot),
            version_tx,
            partition_count,
            backups,
        }
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Install the next topology version for an updated member set.
    /// Returns `(previous, current)` snapshots.
    pub fn rebuild(&self, members: Vec<NodeId>) -> (Arc<TopologySnapshot>, Arc<TopologySnapshot>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let previous = guard.clone();
        let next = Arc::new(TopologySnapshot::build(
            previous.version + 1,
            members,
            self.partition_count,
            self.backups,
        ));
        *guard = next.clone();
        drop(guard);
        let _ = self.version_tx.send(next.version);
        (previous, next)
    }

    pub fn watch_version(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Wait until the topology version exceeds `version`.
    pub async fn wait_version_above(&self, version: u64) {
        let mut rx = self.version_tx.subscribe();
        loop {
            if *rx.borrow() > version {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Gate that holds updates to partitions whose ownership is in flux.
///
/// The engine waits here before locking entries; the wait holds no locks.
/// Data motion itself is the preloader collaborator's business — this type
/// only tracks which partitions are not yet serviceable.
pub struct Preloader {
    moving: Mutex<HashSet<u32>>,
    notify: Notify,
}

impl Preloader {
    pub fn new() -> Self {
        Self {
            moving: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    /// Mark partitions as rebalancing; updates touching them are deferred.
    pub fn hold<I: IntoIterator<Item = u32>>(&self, partitions: I) {
        self.moving.lock().extend(partitions);
    }

    /// Mark partitions as serviceable again and wake waiters.
    pub fn release<I: IntoIterator<Item = u32>>(&self, partitions: I) {
        let mut moving = self.moving.lock();
        for part in partitions {
            moving.remove(&part);
        }
        drop(moving);
        self.notify.notify_waiters();
    }

    pub fn release_all(&self) {
        self.moving.lock().clear();
        self.notify.notify_waiters();
    }

    /// Suspend until none of `partitions` is rebalancing.
    pub async fn wait_ready(&self, partitions: &[u32]) {
        loop {
            let notified = self.notify.notified();
            {
                let moving = self.moving.lock();
                if partitions.iter().all(|p| !moving.contains(p)) {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl Default for Preloader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_is_deterministic_and_primary_first() {
        let a = TopologySnapshot::build(1, vec![3, 1, 2], 64, 2);
        let b = TopologySnapshot::build(1, vec![2, 3, 1], 64, 2);
        for part in 0..64 {
            assert_eq!(a.owners(part), b.owners(part));
            assert_eq!(a.owners(part).len(), 3);
            assert_eq!(a.primary(part), a.owners(part).first().copied());
            // No duplicate owners for one partition.
            let set: HashSet<_> = a.owners(part).iter().collect();
            assert_eq!(set.len(), a.owners(part).len());
        }
    }

    #[test]
    fn owner_count_is_capped_by_cluster_size() {
        let snap = TopologySnapshot::build(1, vec![1], 16, 2);
        for part in 0..16 {
            assert_eq!(snap.owners(part), &[1]);
        }
    }

    #[test]
    fn node_order_follows_sorted_members() {
        let snap = TopologySnapshot::build(1, vec![30, 10, 20], 4, 1);
        assert_eq!(snap.node_order(10), Some(0));
        assert_eq!(snap.node_order(20), Some(1));
        assert_eq!(snap.node_order(30), Some(2));
        assert_eq!(snap.node_order(99), None);
    }

    #[test]
    fn rebuild_advances_version() {
        let topo = PartitionTopology::new(vec![1, 2], 16, 1);
        assert_eq!(topo.version(), 1);
        let (prev, next) = topo.rebuild(vec![1, 2, 3]);
        assert_eq!(prev.version, 1);
        assert_eq!(next.version, 2);
        assert_eq!(topo.version(), 2);
        // The previous snapshot stays usable for in-flight readers.
        assert_eq!(prev.members, vec![1, 2]);
    }

    #[test]
    fn membership_change_moves_bounded_ownership() {
        let before = TopologySnapshot::build(1, vec![1, 2, 3], 256, 1);
        let after = TopologySnapshot::build(2, vec![1, 2, 3, 4], 256, 1);
        let moved = (0..256)
            .filter(|&p| before.primary(p) != after.primary(p))
            .count();
        // Rendezvous hashing only moves primaries onto the new node.
        for part in 0..256 {
            if before.primary(part) != after.primary(part) {
                assert_eq!(after.primary(part), Some(4));
            }
        }
        assert!(moved > 0 && moved < 256);
    }

    #[tokio::test]
    async fn preloader_gates_until_release() {
        let preloader = Arc::new(Preloader::new());
        preloader.hold([7u32]);

        let gate = preloader.clone();
        let waiter = tokio::spawn(async move { gate.wait_ready(&[7]).await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        preloader.release([7u32]);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("gate released")
            .unwrap();
    }
}
