//! Cache assembly: the engine context handle, the public operation surface,
//! inbound message dispatch, and membership integration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backup;
use crate::cluster::{Discovery, MembershipEvent, MembershipEventKind};
use crate::config::CacheConfig;
use crate::entry::{now_ms, EntryMap};
use crate::error::{CacheError, Result};
use crate::messages::{
    EntryFilter, FailedKey, GetRequest, GetResponse, Message, Operation, TransformSpec,
};
use crate::metrics::CacheMetrics;
use crate::near::{NearParams, NearUpdateFuture, UpdateResult};
use crate::primary;
use crate::registry::{FutureRegistry, PendingGet, PendingOp};
use crate::store::CacheStore;
use crate::timer::TimerService;
use crate::topology::{Affinity, PartitionTopology, Preloader};
use crate::transport::Transport;
use crate::version::{ConflictResolver, LastWriterWins, VersionSource};
use crate::NodeId;

/// Ordered-topic name for forwarded reads.
const GET_TOPIC: &str = "get";

/// User transform: current value and argument in, new value out; `None`
/// converts the operation into a remove.
pub type TransformFn = dyn Fn(Option<&[u8]>, &[u8]) -> Option<Vec<u8>> + Send + Sync;

/// Named transforms deployable on every node. A transform arriving by name
/// that is not registered fails that key with a deployment error.
#[derive(Default)]
pub struct TransformRegistry {
    inner: RwLock<HashMap<String, Arc<TransformFn>>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: &str, transform: F)
    where
        F: Fn(Option<&[u8]>, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::new(transform));
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<TransformFn>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}

/// Engine handle passed down to every operation. Owns the stopping flag and
/// all collaborator references; there is no process-wide state.
pub struct CacheContext {
    pub node_id: NodeId,
    pub config: CacheConfig,
    pub affinity: Affinity,
    pub entries: EntryMap,
    pub versions: VersionSource,
    pub topology: PartitionTopology,
    pub preloader: Preloader,
    pub registry: FutureRegistry,
    pub deferred_acks: Arc<crate::deferred::DeferredAckPool>,
    pub transforms: TransformRegistry,
    pub store: Option<Arc<dyn CacheStore>>,
    pub resolver: Arc<dyn ConflictResolver>,
    pub transport: Arc<dyn Transport>,
    pub timer: Arc<TimerService>,
    pub metrics: Arc<CacheMetrics>,
    stopping: AtomicBool,
}

impl CacheContext {
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn check_stopping(&self) -> Result<()> {
        if self.is_stopping() {
            return Err(CacheError::Interrupted("node stopping".into()));
        }
        Ok(())
    }

    pub fn store_enabled(&self) -> bool {
        self.config.store_enabled && self.store.is_some()
    }

    pub fn batch_store_update(&self) -> bool {
        self.store_enabled() && self.config.batch_update_on_commit
    }
}

/// One node's atomic partitioned cache. Cheap to clone; clones share the
/// same engine context.
#[derive(Clone)]
pub struct AtomicCache {
    ctx: Arc<CacheContext>,
}

impl AtomicCache {
    /// Assemble and start the cache on this node: build the topology from
    /// the discovery snapshot, wire the collaborators, and spawn the inbound
    /// dispatch and membership listener tasks.
    pub fn start(
        node_id: NodeId,
        config: CacheConfig,
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<(NodeId, Message)>,
        discovery: &Discovery,
        store: Option<Arc<dyn CacheStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let (members, events) = discovery.subscribe();
        if !members.contains(&node_id) {
            return Err(CacheError::Config(format!(
                "node {node_id} is not in the initial member list"
            )));
        }

        let topology = PartitionTopology::new(members, config.partition_count, config.backups);
        let versions = VersionSource::new(config.data_center_id);
        if let Some(order) = topology.snapshot().node_order(node_id) {
            versions.set_node_order(order);
        }
        let timer = TimerService::new();
        let metrics = Arc::new(CacheMetrics::new());
        let deferred_acks = crate::deferred::DeferredAckPool::new(
            Arc::clone(&transport),
            Arc::clone(&timer),
            Arc::clone(&metrics),
            config.deferred_ack_buffer_size,
            config.deferred_ack_timeout,
        );

        let ctx = Arc::new(CacheContext {
            node_id,
            affinity: Affinity::new(config.partition_count),
            entries: EntryMap::new(config.partition_count),
            versions,
            topology,
            preloader: Preloader::new(),
            registry: FutureRegistry::new(),
            deferred_acks,
            transforms: TransformRegistry::new(),
            store,
            resolver: Arc::new(LastWriterWins),
            transport,
            timer,
            metrics,
            stopping: AtomicBool::new(false),
            config,
        });

        // Inbound dispatch: one task per message so a slow primary apply
        // cannot head-of-line block acks and responses.
        let dispatch_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let mut inbound = inbound;
            while let Some((from, msg)) = inbound.recv().await {
                let ctx = Arc::clone(&dispatch_ctx);
                tokio::spawn(async move {
                    handle_message(&ctx, from, msg).await;
                });
            }
        });

        let member_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                on_membership_event(&member_ctx, event).await;
            }
        });

        // Deferred-delete sweep: tombstones older than the hold window are
        // discarded partition by partition, so low-churn partitions do not
        // retain them forever waiting for the overflow eviction.
        let sweep_ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let hold = sweep_ctx.config.deferred_delete_hold;
            let mut ticker = tokio::time::interval((hold / 4).max(Duration::from_millis(50)));
            loop {
                ticker.tick().await;
                if sweep_ctx.is_stopping() {
                    break;
                }
                let cutoff = now_ms() - hold.as_millis().min(i64::MAX as u128) as i64;
                let mut swept = 0usize;
                for partition in 0..sweep_ctx.config.partition_count {
                    swept += sweep_ctx.entries.sweep_deferred_deletes(partition, cutoff);
                }
                if swept > 0 {
                    debug!(swept, "discarded deferred-delete tombstones");
                    CacheMetrics::add(&sweep_ctx.metrics.tombstones_swept, swept as u64);
                }
            }
        });

        info!(node = node_id, "atomic cache started");
        Ok(Self { ctx })
    }

    pub fn context(&self) -> &Arc<CacheContext> {
        &self.ctx
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.ctx.metrics
    }

    pub fn register_transform<F>(&self, name: &str, transform: F)
    where
        F: Fn(Option<&[u8]>, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.ctx.transforms.register(name, transform);
    }

    fn base_params(&self, operation: Operation, keys: Vec<Vec<u8>>) -> NearParams {
        NearParams {
            operation,
            keys,
            values: Vec::new(),
            transforms: Vec::new(),
            conflict: Vec::new(),
            filter: None,
            ttl_ms: -1,
            return_value: false,
            sync_mode: self.ctx.config.write_sync,
            hops: 0,
        }
    }

    /// Run one update batch to completion.
    async fn update(&self, params: NearParams) -> Result<UpdateResult> {
        self.ctx.check_stopping()?;
        if params.keys.is_empty() {
            return Ok(UpdateResult::succeeded());
        }
        debug_assert!(
            !params.return_value || params.keys.len() == 1,
            "return value requires a single key"
        );
        let (fut, rx) = NearUpdateFuture::start(&self.ctx, params);
        fut.map(&self.ctx).await;
        rx.await
            .map_err(|_| CacheError::Interrupted("update future dropped".into()))
    }

    /// Single-key wrapper: a failure of the one key surfaces as the error.
    async fn update_single_key(&self, params: NearParams) -> Result<UpdateResult> {
        let result = self.update(params).await?;
        if let Some((_, err)) = result.failed.first() {
            return Err(err.clone());
        }
        Ok(result)
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut params = self.base_params(Operation::Update, vec![key.to_vec()]);
        params.values = vec![Some(value.to_vec())];
        self.update_single_key(params).await.map(|_| ())
    }

    pub async fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        let mut params = self.base_params(Operation::Update, vec![key.to_vec()]);
        params.values = vec![Some(value.to_vec())];
        params.ttl_ms = ttl.as_millis().min(i64::MAX as u128) as i64;
        self.update_single_key(params).await.map(|_| ())
    }

    /// Put returning the previous value.
    pub async fn get_and_put(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut params = self.base_params(Operation::Update, vec![key.to_vec()]);
        params.values = vec![Some(value.to_vec())];
        params.return_value = true;
        self.update_single_key(params).await.map(|r| r.value)
    }

    pub async fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut params = self.base_params(Operation::Update, vec![key.to_vec()]);
        params.values = vec![Some(value.to_vec())];
        params.filter = Some(EntryFilter::NoValue);
        params.return_value = true;
        self.update_single_key(params).await.map(|r| r.success)
    }

    pub async fn replace(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut params = self.base_params(Operation::Update, vec![key.to_vec()]);
        params.values = vec![Some(value.to_vec())];
        params.filter = Some(EntryFilter::HasValue);
        params.return_value = true;
        self.update_single_key(params).await.map(|r| r.success)
    }

    pub async fn replace_if_equals(
        &self,
        key: &[u8],
        expected: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let mut params = self.base_params(Operation::Update, vec![key.to_vec()]);
        params.values = vec![Some(value.to_vec())];
        params.filter = Some(EntryFilter::ValueEquals(expected.to_vec()));
        params.return_value = true;
        self.update_single_key(params).await.map(|r| r.success)
    }

    pub async fn remove(&self, key: &[u8]) -> Result<bool> {
        let mut params = self.base_params(Operation::Delete, vec![key.to_vec()]);
        params.return_value = true;
        self.update_single_key(params).await.map(|r| r.success)
    }

    pub async fn remove_if_equals(&self, key: &[u8], expected: &[u8]) -> Result<bool> {
        let mut params = self.base_params(Operation::Delete, vec![key.to_vec()]);
        params.filter = Some(EntryFilter::ValueEquals(expected.to_vec()));
        params.return_value = true;
        self.update_single_key(params).await.map(|r| r.success)
    }

    pub async fn get_and_remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut params = self.base_params(Operation::Delete, vec![key.to_vec()]);
        params.return_value = true;
        self.update_single_key(params).await.map(|r| r.value)
    }

    pub async fn put_all(&self, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<UpdateResult> {
        let (keys, values): (Vec<_>, Vec<_>) =
            pairs.into_iter().map(|(k, v)| (k, Some(v))).unzip();
        let mut params = self.base_params(Operation::Update, keys);
        params.values = values;
        self.update(params).await
    }

    pub async fn remove_all(&self, keys: Vec<Vec<u8>>) -> Result<UpdateResult> {
        let params = self.base_params(Operation::Delete, keys);
        self.update(params).await
    }

    /// Read-modify-write: the named transform runs on the primary under the
    /// entry lock.
    pub async fn transform(&self, key: &[u8], name: &str, arg: &[u8]) -> Result<()> {
        let mut params = self.base_params(Operation::Transform, vec![key.to_vec()]);
        params.transforms = vec![TransformSpec {
            name: name.to_string(),
            arg: arg.to_vec(),
        }];
        self.update_single_key(params).await.map(|_| ())
    }

    pub async fn transform_all(
        &self,
        entries: Vec<(Vec<u8>, TransformSpec)>,
    ) -> Result<UpdateResult> {
        let (keys, transforms): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        let mut params = self.base_params(Operation::Transform, keys);
        params.transforms = transforms;
        self.update(params).await
    }

    /// Read one key: served locally when this node owns the partition,
    /// otherwise forwarded to the primary.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ctx.check_stopping()?;
        CacheMetrics::incr(&self.ctx.metrics.gets);
        let partition = self.ctx.affinity.partition(key);
        let snapshot = self.ctx.topology.snapshot();

        if snapshot.is_owner(partition, self.ctx.node_id) {
            let value = self.ctx.entries.peek_value(key, partition, now_ms());
            match value {
                Some(_) => CacheMetrics::incr(&self.ctx.metrics.hits),
                None => CacheMetrics::incr(&self.ctx.metrics.misses),
            }
            return Ok(value);
        }

        let Some(primary) = snapshot.primary(partition) else {
            return Err(CacheError::Topology("no owners for partition".into()));
        };
        let future_version = self.ctx.versions.next(snapshot.version);
        let (pending, rx) = PendingGet::new();
        self.ctx
            .registry
            .register(future_version, PendingOp::Get(pending));

        let req = Message::GetRequest(GetRequest {
            future_version,
            key: key.to_vec(),
        });
        if let Err(err) = self
            .ctx
            .transport
            .send_ordered(primary, GET_TOPIC, req, self.ctx.config.network_timeout)
            .await
        {
            self.ctx.registry.remove(&future_version);
            return Err(err);
        }

        let res = tokio::time::timeout(self.ctx.config.network_timeout, rx).await;
        self.ctx.registry.remove(&future_version);
        match res {
            Err(_) => Err(CacheError::Rejected("get request timed out".into())),
            Ok(Err(_)) => Err(CacheError::Interrupted("get future dropped".into())),
            Ok(Ok(res)) => match res.error {
                Some(failed) => Err(failed.error()),
                None => Ok(res.value),
            },
        }
    }

    pub async fn get_all(&self, keys: &[Vec<u8>]) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push((key.clone(), self.get(key).await?));
        }
        Ok(out)
    }

    /// Local read without routing; `None` when this node holds nothing.
    pub fn local_peek(&self, key: &[u8]) -> Option<Vec<u8>> {
        let partition = self.ctx.affinity.partition(key);
        self.ctx.entries.peek_value(key, partition, now_ms())
    }

    /// Stop the engine: new operations are refused, waiters exit with an
    /// interruption error, pending deferred acks flush best effort and the
    /// remaining tombstones are discarded.
    pub async fn stop(&self) {
        self.ctx.stopping.store(true, Ordering::SeqCst);
        self.ctx.preloader.release_all();
        self.ctx.deferred_acks.flush_all();
        for op in self.ctx.registry.snapshot() {
            if let PendingOp::Near(fut) = op {
                fut.on_stop(&self.ctx);
            }
        }
        for partition in 0..self.ctx.config.partition_count {
            self.ctx.entries.drain_deferred_deletes(partition);
        }
        info!(node = self.ctx.node_id, "atomic cache stopped");
    }
}

/// Inbound message dispatch.
async fn handle_message(ctx: &Arc<CacheContext>, from: NodeId, msg: Message) {
    match msg {
        Message::NearUpdateRequest(req) => {
            primary::process_near_update(ctx, from, req).await;
        }
        Message::NearUpdateResponse(res) => {
            if let Some(fut) = ctx.registry.near(&res.future_version) {
                fut.on_response(ctx, from, res).await;
            } else {
                debug!(future = ?res.future_version, "no near future for update response");
            }
        }
        Message::DhtUpdateRequest(req) => {
            backup::process_dht_update(ctx, from, req).await;
        }
        Message::DhtUpdateResponse(res) => {
            if let Some(fut) = ctx.registry.dht(&res.future_version) {
                fut.on_result(ctx, from, res).await;
            } else {
                debug!(future = ?res.future_version, "no dht future for update response");
            }
        }
        Message::DhtDeferredAck(ack) => {
            for version in ack.future_versions {
                if let Some(fut) = ctx.registry.dht(&version) {
                    fut.on_deferred_ack(ctx, from).await;
                } else {
                    debug!(future = ?version, "no dht future for deferred ack");
                }
            }
        }
        Message::GetRequest(req) => {
            handle_get_request(ctx, from, req).await;
        }
        Message::GetResponse(res) => {
            if let Some(pending) = ctx.registry.get(&res.future_version) {
                ctx.registry.remove(&res.future_version);
                pending.complete(res);
            }
        }
    }
}

async fn handle_get_request(ctx: &Arc<CacheContext>, from: NodeId, req: GetRequest) {
    let partition = ctx.affinity.partition(&req.key);
    let snapshot = ctx.topology.snapshot();
    let res = if snapshot.is_owner(partition, ctx.node_id) {
        GetResponse {
            future_version: req.future_version,
            value: ctx.entries.peek_value(&req.key, partition, now_ms()),
            error: None,
        }
    } else {
        GetResponse {
            future_version: req.future_version,
            value: None,
            error: Some(FailedKey::new(
                req.key.clone(),
                &CacheError::InvalidPartition(partition),
            )),
        }
    };
    if let Err(err) = ctx
        .transport
        .send_ordered(from, GET_TOPIC, Message::GetResponse(res), ctx.config.network_timeout)
        .await
    {
        warn!(error = ?err, peer = from, "failed to send get response");
    }
}

/// Membership integration: bump the topology under its write lock, refresh
/// the local node ordinal, and sweep pending futures for the departed node.
/// Establishing data on newly-assigned owners is the preloader
/// collaborator's business; the gate is driven externally.
async fn on_membership_event(ctx: &Arc<CacheContext>, event: MembershipEvent) {
    info!(kind = ?event.kind, node = event.node, members = ?event.members, "membership changed");
    let (_previous, next) = ctx.topology.rebuild(event.members);
    if let Some(order) = next.node_order(ctx.node_id) {
        ctx.versions.set_node_order(order);
    }

    if matches!(
        event.kind,
        MembershipEventKind::Left | MembershipEventKind::Failed
    ) {
        for op in ctx.registry.snapshot() {
            match op {
                PendingOp::Dht(fut) => fut.on_node_left(ctx, event.node).await,
                PendingOp::Near(fut) => fut.on_node_left(ctx, event.node).await,
                PendingOp::Get(_) => {}
            }
        }
    }
}
