//! Client (near) update coordination on the request-originating node.
//!
//! Partitions the user batch by primary owner, dispatches one request per
//! node, merges responses, and assembles one future result. Remap responses
//! are not failures: the affected keys wait for the topology to advance past
//! the version they were mapped at, then re-dispatch, bounded by the remap
//! attempt limit. Primary departure and request timeout feed the same paths.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::CacheContext;
use crate::config::{WriteOrder, WriteSync};
use crate::error::CacheError;
use crate::messages::{
    CacheReturn, ConflictInfo, EntryFilter, FailedKey, Message, NearUpdateRequest,
    NearUpdateResponse, Operation, TransformSpec,
};
use crate::primary;
use crate::registry::PendingOp;
use crate::timer::TimerId;
use crate::version::CacheVersion;
use crate::NodeId;

/// User-facing inputs of one update batch.
#[derive(Debug, Clone)]
pub struct NearParams {
    pub operation: Operation,
    pub keys: Vec<Vec<u8>>,
    /// Parallel to `keys` for `Update`.
    pub values: Vec<Option<Vec<u8>>>,
    /// Parallel to `keys` for `Transform`.
    pub transforms: Vec<TransformSpec>,
    /// Parallel to `keys`, or empty.
    pub conflict: Vec<Option<ConflictInfo>>,
    pub filter: Option<EntryFilter>,
    pub ttl_ms: i64,
    pub return_value: bool,
    pub sync_mode: WriteSync,
    pub hops: u8,
}

/// Merged outcome of one update batch. Per-key failures populate `failed`;
/// the future itself only errors when the request could not be routed at all.
#[derive(Debug)]
pub struct UpdateResult {
    pub value: Option<Vec<u8>>,
    pub success: bool,
    pub failed: Vec<(Vec<u8>, CacheError)>,
}

impl UpdateResult {
    pub(crate) fn succeeded() -> Self {
        Self {
            value: None,
            success: true,
            failed: Vec::new(),
        }
    }
}

struct NearFutState {
    /// Topology version of the latest dispatch.
    mapped_version: u64,
    /// Key indices awaiting a response, per node.
    pending: HashMap<NodeId, Vec<usize>>,
    /// Remap dispatches scheduled but not yet re-mapped.
    remapping: usize,
    remap_attempts: u32,
    merged_value: Option<CacheReturn>,
    failed: Vec<FailedKey>,
    timer_id: Option<TimerId>,
    done_tx: Option<oneshot::Sender<UpdateResult>>,
    completed: bool,
}

/// One in-flight update batch on the originating node.
pub struct NearUpdateFuture {
    pub future_version: CacheVersion,
    params: NearParams,
    order_mode: WriteOrder,
    fast_map: bool,
    key_index: HashMap<Vec<u8>, usize>,
    state: Mutex<NearFutState>,
}

/// Fire-and-forget near future used by the FULL_ASYNC primary-side remap.
pub(crate) fn spawn_detached(ctx: &Arc<CacheContext>, params: NearParams) {
    let fut = NearUpdateFuture::create(ctx, params, None);
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        fut.map(&ctx).await;
    });
}

impl NearUpdateFuture {
    /// Register a new future and its completion receiver.
    pub fn start(
        ctx: &Arc<CacheContext>,
        params: NearParams,
    ) -> (Arc<Self>, oneshot::Receiver<UpdateResult>) {
        let (tx, rx) = oneshot::channel();
        (Self::create(ctx, params, Some(tx)), rx)
    }

    fn create(
        ctx: &Arc<CacheContext>,
        params: NearParams,
        done_tx: Option<oneshot::Sender<UpdateResult>>,
    ) -> Arc<Self> {
        let mapped_version = ctx.topology.version();
        let future_version = ctx.versions.next(mapped_version);

        // Fast map: write every owner directly with a client-assigned
        // version. Only sound when version comparison settles races.
        let fast_map = ctx.config.write_order == WriteOrder::Clock
            && params.sync_mode == WriteSync::FullSync
            && params.filter.is_none()
            && params.operation != Operation::Transform
            && params.conflict.iter().all(|c| c.is_none());

        let key_index = params
            .keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), i))
            .collect();

        let fut = Arc::new(Self {
            future_version,
            order_mode: ctx.config.write_order,
            fast_map,
            key_index,
            params,
            state: Mutex::new(NearFutState {
                mapped_version,
                pending: HashMap::new(),
                remapping: 0,
                remap_attempts: 0,
                merged_value: None,
                failed: Vec::new(),
                timer_id: None,
                done_tx,
                completed: false,
            }),
        });
        ctx.registry
            .register(future_version, PendingOp::Near(fut.clone()));

        // Every outstanding request has an end time; expiry turns the still
        // pending keys into rejected failures.
        let me = fut.clone();
        let timer_ctx = Arc::clone(ctx);
        let timer_id = ctx
            .timer
            .schedule(Instant::now() + ctx.config.network_timeout, move || {
                me.on_timeout(&timer_ctx);
            });
        fut.state.lock().timer_id = Some(timer_id);
        fut
    }

    /// Initial mapping of the whole batch.
    pub async fn map(self: &Arc<Self>, ctx: &Arc<CacheContext>) {
        let indices: Vec<usize> = (0..self.params.keys.len()).collect();
        self.dispatch(ctx, indices, false).await;

        if self.params.sync_mode == WriteSync::FullAsync {
            // The user future completes right after dispatch; the remaining
            // bookkeeping (remaps, failure logging) continues internally.
            let tx = self.state.lock().done_tx.take();
            if let Some(tx) = tx {
                let _ = tx.send(UpdateResult::succeeded());
            }
        }
        self.try_complete(ctx);
    }

    /// Group `indices` by target node at the current topology and send.
    async fn dispatch(self: &Arc<Self>, ctx: &Arc<CacheContext>, indices: Vec<usize>, from_remap: bool) {
        let snapshot = ctx.topology.snapshot();
        let mut groups: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut unroutable: Vec<usize> = Vec::new();

        for idx in indices {
            let part = ctx.affinity.partition(&self.params.keys[idx]);
            let targets: Vec<NodeId> = if self.fast_map {
                snapshot.owners(part).to_vec()
            } else {
                snapshot.primary(part).into_iter().collect()
            };
            if targets.is_empty() {
                unroutable.push(idx);
                continue;
            }
            for node in targets {
                groups.entry(node).or_default().push(idx);
            }
        }

        let write_version = if self.fast_map {
            Some(ctx.versions.next(snapshot.version))
        } else {
            None
        };

        {
            let mut state = self.state.lock();
            if from_remap {
                state.remapping = state.remapping.saturating_sub(1);
            }
            if state.completed {
                return;
            }
            state.mapped_version = snapshot.version;
            let err = CacheError::Topology("no owners for partition".into());
            for idx in unroutable {
                state
                    .failed
                    .push(FailedKey::new(self.params.keys[idx].clone(), &err));
            }
            for (node, idxs) in &groups {
                state
                    .pending
                    .entry(*node)
                    .or_default()
                    .extend(idxs.iter().copied());
            }
        }

        for (node, idxs) in groups {
            let req = self.build_request(&idxs, snapshot.version, write_version);
            if node == ctx.node_id {
                // Local primary: run the engine directly.
                let local_ctx = Arc::clone(ctx);
                tokio::spawn(async move {
                    primary::process_near_update(&local_ctx, local_ctx.node_id, req).await;
                });
            } else if let Err(err) = ctx
                .transport
                .send(node, Message::NearUpdateRequest(req))
                .await
            {
                warn!(error = ?err, peer = node, "failed to send near update request");
                let remap = {
                    let mut state = self.state.lock();
                    if state.completed {
                        continue;
                    }
                    let stranded = state.pending.remove(&node).unwrap_or_default();
                    self.queue_remap_locked(ctx, &mut state, stranded)
                };
                self.spawn_remap(ctx, remap);
            }
        }
    }

    /// Subset the batch arrays for one node group.
    fn build_request(
        &self,
        indices: &[usize],
        topology_version: u64,
        write_version: Option<CacheVersion>,
    ) -> NearUpdateRequest {
        let keys = indices.iter().map(|&i| self.params.keys[i].clone()).collect();
        let values = match self.params.operation {
            Operation::Update => indices
                .iter()
                .map(|&i| self.params.values[i].clone())
                .collect(),
            _ => Vec::new(),
        };
        let transforms = match self.params.operation {
            Operation::Transform => indices
                .iter()
                .map(|&i| self.params.transforms[i].clone())
                .collect(),
            _ => Vec::new(),
        };
        let conflict = if self.params.conflict.iter().any(|c| c.is_some()) {
            indices
                .iter()
                .map(|&i| self.params.conflict[i])
                .collect()
        } else {
            Vec::new()
        };
        NearUpdateRequest {
            future_version: self.future_version,
            topology_version,
            sync_mode: self.params.sync_mode,
            order_mode: self.order_mode,
            operation: self.params.operation,
            keys,
            values,
            transforms,
            filter: self.params.filter.clone(),
            ttl_ms: self.params.ttl_ms,
            return_value: self.params.return_value,
            fast_map: self.fast_map,
            write_version,
            conflict,
            hops: self.params.hops,
        }
    }

    /// Merge one primary response.
    pub async fn on_response(
        self: &Arc<Self>,
        ctx: &Arc<CacheContext>,
        from: NodeId,
        res: NearUpdateResponse,
    ) {
        let remap = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.pending.remove(&from);
            if let Some(ret) = res.return_value {
                if state.merged_value.is_none() {
                    state.merged_value = Some(ret);
                }
            }
            state.failed.extend(res.failed_keys);
            let mut to_remap: Vec<usize> = Vec::new();
            for key in &res.remap_keys {
                if let Some(&idx) = self.key_index.get(key) {
                    to_remap.push(idx);
                }
            }
            debug!(peer = from, remap = to_remap.len(), "merged near update response");
            self.queue_remap_locked(ctx, &mut state, to_remap)
        };
        self.spawn_remap(ctx, remap);
        self.try_complete(ctx);
    }

    /// A node we are waiting on departed: its keys re-map at the topology
    /// the membership change installed.
    pub async fn on_node_left(self: &Arc<Self>, ctx: &Arc<CacheContext>, node: NodeId) {
        let remap = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            let stranded = state.pending.remove(&node).unwrap_or_default();
            if stranded.is_empty() {
                return;
            }
            debug!(peer = node, keys = stranded.len(), "remapping keys of departed node");
            self.queue_remap_locked(ctx, &mut state, stranded)
        };
        self.spawn_remap(ctx, remap);
        self.try_complete(ctx);
    }

    /// Register a remap while the state lock is held, so a concurrent
    /// response cannot complete the future before the remap is accounted
    /// for. Returns the wait version and indices for [`Self::spawn_remap`].
    fn queue_remap_locked(
        &self,
        ctx: &Arc<CacheContext>,
        state: &mut NearFutState,
        indices: Vec<usize>,
    ) -> Option<(u64, Vec<usize>)> {
        if indices.is_empty() {
            return None;
        }
        state.remap_attempts += 1;
        if state.remap_attempts > ctx.config.remap_attempt_limit {
            let err = CacheError::Rejected("remap attempts exhausted".into());
            for idx in indices {
                state
                    .failed
                    .push(FailedKey::new(self.params.keys[idx].clone(), &err));
            }
            return None;
        }
        state.remapping += 1;
        Some((state.mapped_version, indices))
    }

    /// Run a queued re-dispatch once the topology advances past the version
    /// the stale mapping was taken at; the request timer bounds the wait if
    /// no change ever arrives.
    fn spawn_remap(self: &Arc<Self>, ctx: &Arc<CacheContext>, remap: Option<(u64, Vec<usize>)>) {
        let Some((mapped_version, indices)) = remap else {
            return;
        };
        let me = self.clone();
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            ctx.topology.wait_version_above(mapped_version).await;
            me.dispatch(&ctx, indices, true).await;
            me.try_complete(&ctx);
        });
    }

    /// The request end time passed: every still-pending key fails.
    pub fn on_timeout(self: &Arc<Self>, ctx: &Arc<CacheContext>) {
        {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            let err = CacheError::Rejected("update request timed out".into());
            let outstanding: HashSet<usize> =
                state.pending.values().flatten().copied().collect();
            for idx in outstanding {
                state
                    .failed
                    .push(FailedKey::new(self.params.keys[idx].clone(), &err));
            }
            state.pending.clear();
            state.remapping = 0;
        }
        self.try_complete(ctx);
    }

    /// Engine shutdown: pending keys fail with an interruption error and the
    /// response goes out best effort.
    pub fn on_stop(self: &Arc<Self>, ctx: &Arc<CacheContext>) {
        {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            let err = CacheError::Interrupted("node stopping".into());
            let outstanding: HashSet<usize> =
                state.pending.values().flatten().copied().collect();
            for idx in outstanding {
                state
                    .failed
                    .push(FailedKey::new(self.params.keys[idx].clone(), &err));
            }
            state.pending.clear();
            state.remapping = 0;
        }
        self.try_complete(ctx);
    }

    fn try_complete(self: &Arc<Self>, ctx: &Arc<CacheContext>) {
        let finished = {
            let mut state = self.state.lock();
            if state.completed || !state.pending.is_empty() || state.remapping > 0 {
                None
            } else {
                state.completed = true;
                let result = UpdateResult {
                    value: state.merged_value.as_ref().and_then(|r| r.value.clone()),
                    success: state.merged_value.as_ref().map(|r| r.success).unwrap_or(true),
                    failed: state
                        .failed
                        .iter()
                        .map(|f| (f.key.clone(), f.error()))
                        .collect(),
                };
                Some((result, state.done_tx.take(), state.timer_id.take()))
            }
        };

        let Some((result, done_tx, timer_id)) = finished else {
            return;
        };
        if let Some(id) = timer_id {
            ctx.timer.cancel(id);
        }
        ctx.registry.remove(&self.future_version);
        match done_tx {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                if !result.failed.is_empty() {
                    warn!(
                        failed = result.failed.len(),
                        "detached update batch finished with failed keys"
                    );
                }
            }
        }
    }
}
