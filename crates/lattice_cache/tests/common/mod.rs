//! Shared helpers for integration tests: an in-process cluster over the
//! loopback wire with injectable membership events.

use std::sync::Arc;
use std::time::Duration;

use lattice_cache::cache::AtomicCache;
use lattice_cache::cluster::Discovery;
use lattice_cache::config::{CacheConfig, MemberAddr};
use lattice_cache::store::{CacheStore, MemStore};
use lattice_cache::transport::LoopbackWire;
use lattice_cache::version::CacheVersion;
use lattice_cache::NodeId;

pub struct TestNode {
    pub id: NodeId,
    pub cache: AtomicCache,
    pub store: Arc<MemStore>,
}

pub struct TestCluster {
    pub wire: Arc<LoopbackWire>,
    pub discovery: Arc<Discovery>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `n` nodes (ids `1..=n`) sharing one wire and discovery service.
    pub fn start(n: usize, config: CacheConfig) -> TestCluster {
        let wire = LoopbackWire::new();
        let members: Vec<MemberAddr> = (1..=n as NodeId)
            .map(|node_id| MemberAddr {
                node_id,
                addr: "127.0.0.1:0".parse().unwrap(),
            })
            .collect();
        let discovery = Arc::new(Discovery::new(&members));

        let nodes = members
            .iter()
            .map(|m| {
                let (transport, inbound) = wire.attach(m.node_id);
                let store = MemStore::new();
                let store_dyn: Arc<dyn CacheStore> = store.clone();
                let cache = AtomicCache::start(
                    m.node_id,
                    config.clone(),
                    transport,
                    inbound,
                    &discovery,
                    Some(store_dyn),
                )
                .expect("start cache");
                TestNode {
                    id: m.node_id,
                    cache,
                    store,
                }
            })
            .collect();

        TestCluster {
            wire,
            discovery,
            nodes,
        }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes.iter().find(|n| n.id == id).expect("node exists")
    }

    /// A node that is not an owner of `key`, if the cluster has one.
    pub fn non_owner_of(&self, key: &[u8]) -> Option<&TestNode> {
        let owners = self.owners_of(key);
        self.nodes.iter().find(|n| !owners.contains(&n.id))
    }

    pub fn primary_of(&self, key: &[u8]) -> NodeId {
        let ctx = self.nodes[0].cache.context();
        let part = ctx.affinity.partition(key);
        ctx.topology.snapshot().primary(part).expect("primary exists")
    }

    pub fn owners_of(&self, key: &[u8]) -> Vec<NodeId> {
        let ctx = self.nodes[0].cache.context();
        let part = ctx.affinity.partition(key);
        ctx.topology.snapshot().owners(part).to_vec()
    }

    pub fn partition_of(&self, key: &[u8]) -> u32 {
        self.nodes[0].cache.context().affinity.partition(key)
    }

    /// Generate a key whose primary is `primary`.
    pub fn key_with_primary(&self, primary: NodeId, tag: &str) -> Vec<u8> {
        for i in 0..100_000u32 {
            let key = format!("{tag}-{i}").into_bytes();
            if self.primary_of(&key) == primary {
                return key;
            }
        }
        panic!("no key found with primary {primary}");
    }

    /// Generate a key with the given primary and a specific backup owner.
    pub fn key_with_owners(&self, primary: NodeId, backup: NodeId, tag: &str) -> Vec<u8> {
        for i in 0..100_000u32 {
            let key = format!("{tag}-{i}").into_bytes();
            let owners = self.owners_of(&key);
            if owners.first() == Some(&primary) && owners[1..].contains(&backup) {
                return key;
            }
        }
        panic!("no key found with primary {primary} and backup {backup}");
    }

    /// Simulate a crash: cut the node off the wire and raise the failure.
    pub fn kill(&self, id: NodeId) {
        self.wire.detach(id);
        self.discovery.node_failed(id);
    }

    /// Value as seen locally on one node.
    pub fn value_on(&self, id: NodeId, key: &[u8]) -> Option<Vec<u8>> {
        self.node(id).cache.local_peek(key)
    }

    /// Committed entry version on one node, if an entry exists.
    pub fn version_on(&self, id: NodeId, key: &[u8]) -> Option<CacheVersion> {
        let ctx = self.node(id).cache.context();
        let part = ctx.affinity.partition(key);
        ctx.entries.peek(key, part).map(|e| e.state.lock().version)
    }

    /// Let async fan-out drain.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Config tuned for fast tests.
pub fn test_config() -> CacheConfig {
    CacheConfig {
        backups: 1,
        partition_count: 64,
        store_enabled: false,
        network_timeout: Duration::from_secs(5),
        ..CacheConfig::default()
    }
}
