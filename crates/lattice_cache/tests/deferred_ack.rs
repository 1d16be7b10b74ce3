//! Deferred-ack coalescing between backups and primaries.

mod common;

use std::time::Duration;

use common::{test_config, TestCluster};
use lattice_cache::config::{WriteOrder, WriteSync};
use lattice_cache::metrics::CacheMetrics;

async fn wait_registry_empty(cluster: &TestCluster, node: u64) {
    for _ in 0..100 {
        if cluster.node(node).cache.context().registry.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "registry on node {node} still holds {} pending ops",
        cluster.node(node).cache.context().registry.len()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn primary_sync_acks_coalesce_at_the_buffer_threshold() {
    let mut config = test_config();
    config.write_sync = WriteSync::PrimarySync;
    config.write_order = WriteOrder::Clock;
    let cluster = TestCluster::start(2, config);

    // 260 updates whose primary is node 1; node 2 is the backup owing acks.
    let keys: Vec<Vec<u8>> = (0..260)
        .map(|i| cluster.key_with_primary(1, &format!("ack{i}")))
        .collect();
    for key in &keys {
        cluster.node(1).cache.put(key, b"v").await.unwrap();
    }

    // Crossing the 256 threshold flushes one coalesced datagram well before
    // the 500 ms timer.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let backup_metrics = cluster.node(2).cache.metrics();
    assert!(
        CacheMetrics::get(&backup_metrics.deferred_flushes) >= 1,
        "capacity flush should have happened before the timer"
    );

    // The stragglers ship with the timer flush; every pending backup future
    // on the primary then drains.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(CacheMetrics::get(&backup_metrics.deferred_flushes) >= 2);
    wait_registry_empty(&cluster, 1).await;

    // All replicas converged.
    for key in &keys {
        let owners = cluster.owners_of(key);
        for &owner in &owners {
            assert_eq!(cluster.value_on(owner, key).as_deref(), Some(b"v".as_ref()));
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn full_sync_backups_respond_directly() {
    let mut config = test_config();
    config.write_sync = WriteSync::FullSync;
    config.write_order = WriteOrder::Primary;
    let cluster = TestCluster::start(2, config);

    for i in 0..20 {
        let key = cluster.key_with_primary(1, &format!("direct{i}"));
        cluster.node(1).cache.put(&key, b"v").await.unwrap();
    }
    cluster.settle().await;

    // Direct responses, no coalescing.
    let backup_metrics = cluster.node(2).cache.metrics();
    assert_eq!(CacheMetrics::get(&backup_metrics.deferred_flushes), 0);
    wait_registry_empty(&cluster, 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn timer_flush_drains_sparse_traffic() {
    let mut config = test_config();
    config.write_sync = WriteSync::PrimarySync;
    config.write_order = WriteOrder::Clock;
    config.deferred_ack_timeout = Duration::from_millis(200);
    let cluster = TestCluster::start(2, config);

    let key = cluster.key_with_primary(1, "sparse");
    cluster.node(1).cache.put(&key, b"v").await.unwrap();

    // One lone ack never reaches the buffer threshold; only the timer can
    // ship it and release the primary's pending future.
    wait_registry_empty(&cluster, 1).await;
    let backup_metrics = cluster.node(2).cache.metrics();
    assert!(CacheMetrics::get(&backup_metrics.deferred_flushes) >= 1);
}
