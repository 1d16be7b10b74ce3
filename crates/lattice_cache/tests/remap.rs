//! Remap and membership-change behavior of the update pipeline.

mod common;

use std::time::Duration;

use common::{test_config, TestCluster};
use lattice_cache::config::{WriteOrder, WriteSync};
use lattice_cache::error::CacheError;
use lattice_cache::messages::{Message, NearUpdateRequest};
use lattice_cache::transport::Transport;
use lattice_cache::version::CacheVersion;

fn primary_mode_config() -> lattice_cache::config::CacheConfig {
    let mut config = test_config();
    config.write_sync = WriteSync::FullSync;
    config.write_order = WriteOrder::Primary;
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_topology_request_is_bounced_for_remap() {
    let cluster = TestCluster::start(2, primary_mode_config());
    let key = cluster.key_with_primary(1, "stale");

    // Pose as an external client mapped at an old topology version.
    let (client, mut client_rx) = cluster.wire.attach(99);
    let future_version = CacheVersion {
        topology_version: 0,
        order: 999,
        node_order: 0,
        data_center_id: 0,
    };
    let req = NearUpdateRequest {
        future_version,
        // Current topology is 1; this request was mapped before that.
        topology_version: 0,
        sync_mode: WriteSync::FullSync,
        order_mode: WriteOrder::Primary,
        operation: lattice_cache::messages::Operation::Update,
        keys: vec![key.clone()],
        values: vec![Some(b"v".to_vec())],
        transforms: vec![],
        filter: None,
        ttl_ms: -1,
        return_value: false,
        fast_map: false,
        write_version: None,
        conflict: vec![],
        hops: 0,
    };
    client.send(1, Message::NearUpdateRequest(req)).await.unwrap();

    let (from, msg) = tokio::time::timeout(Duration::from_secs(5), client_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, 1);
    let Message::NearUpdateResponse(res) = msg else {
        panic!("expected near update response, got {msg:?}");
    };
    assert_eq!(res.future_version, future_version);
    assert_eq!(res.remap_keys, vec![key.clone()]);
    assert!(res.failed_keys.is_empty());
    // Nothing was written.
    assert_eq!(cluster.value_on(1, &key), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn preloader_gate_defers_updates_until_release() {
    let cluster = TestCluster::start(2, test_config());
    let key = cluster.key_with_primary(1, "gated");
    let part = cluster.partition_of(&key);

    cluster.node(1).cache.context().preloader.hold([part]);

    let cache = cluster.node(2).cache.clone();
    let put_key = key.clone();
    let handle = tokio::spawn(async move { cache.put(&put_key, b"deferred").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished(), "update must wait for the preloader");

    cluster.node(1).cache.context().preloader.release([part]);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("released")
        .unwrap()
        .unwrap();
    assert_eq!(cluster.value_on(1, &key).as_deref(), Some(b"deferred".as_ref()));
}

#[tokio::test(flavor = "multi_thread")]
async fn topology_change_during_parked_update_triggers_remap_and_retry() {
    let cluster = TestCluster::start(3, primary_mode_config());
    // A key served by nodes 1 and 2; node 3 is uninvolved.
    let key = cluster.key_with_owners(1, 2, "parked");
    let part = cluster.partition_of(&key);

    // Park the request on the primary, then change the topology under it.
    cluster.node(1).cache.context().preloader.hold([part]);

    let cache = cluster.node(2).cache.clone();
    let put_key = key.clone();
    let handle = tokio::spawn(async move { cache.put(&put_key, b"survives").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());

    cluster.kill(3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    cluster.node(1).cache.context().preloader.release([part]);

    // The primary answers with remap keys; the coordinator re-reads the
    // advanced topology and retries successfully.
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("completes after remap")
        .unwrap()
        .unwrap();
    let primary = cluster.primary_of(&key);
    assert_eq!(cluster.value_on(primary, &key).as_deref(), Some(b"survives".as_ref()));
}

#[tokio::test(flavor = "multi_thread")]
async fn primary_departure_remaps_pending_keys() {
    let cluster = TestCluster::start(3, primary_mode_config());
    let key = cluster.key_with_owners(1, 2, "failover");

    // The primary receives nothing; the client's request stays pending
    // until the failure event remaps it.
    cluster.wire.hold(1);

    let cache = cluster.node(3).cache.clone();
    let put_key = key.clone();
    let handle = tokio::spawn(async move { cache.put(&put_key, b"rerouted").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());

    cluster.kill(1);
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("completes after failover")
        .unwrap()
        .unwrap();

    let primary = cluster.primary_of(&key);
    assert_ne!(primary, 1);
    assert_eq!(cluster.value_on(primary, &key).as_deref(), Some(b"rerouted".as_ref()));
}

#[tokio::test(flavor = "multi_thread")]
async fn backup_departure_mid_full_sync_completes_with_failed_keys() {
    let cluster = TestCluster::start(3, primary_mode_config());
    let key = cluster.key_with_owners(1, 2, "halfsync");

    // The backup receives the DHT update but never processes it.
    cluster.wire.hold(2);

    let cache = cluster.node(1).cache.clone();
    let put_key = key.clone();
    let handle =
        tokio::spawn(async move { cache.put_all(vec![(put_key, b"partial".to_vec())]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished(), "FULL_SYNC must wait for the backup ack");

    cluster.kill(2);
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("completes after backup failure")
        .unwrap()
        .unwrap();

    // The write stuck on the primary; the backup's keys are reported failed
    // with a topology error.
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].0, key);
    assert!(matches!(result.failed[0].1, CacheError::Topology(_)));
    assert_eq!(cluster.value_on(1, &key).as_deref(), Some(b"partial".as_ref()));
}
