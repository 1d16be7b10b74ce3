//! Primary-update engine.
//!
//! Executes a near update request on the node that owns the target keys:
//! wait out the preloader, lock the entries in key-list order, validate
//! topology under the read lock, assign the write version, apply through the
//! entry update rule (batched or single write-through path), build the
//! per-backup fan-out, then unlock and hand off to the backup coordinator.
//! Entry locks are only held inside the synchronous region; every suspension
//! point sits outside it.

use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::cache::CacheContext;
use crate::config::{WriteOrder, WriteSync};
use crate::entry::{
    self, filter_passes, lock_in_order, now_ms, ApplyOutcome, CacheEntry, EntryState,
    MAX_LOCK_RETRIES,
};
use crate::error::CacheError;
use crate::messages::{
    CacheReturn, ConflictInfo, Message, NearUpdateRequest, NearUpdateResponse, Operation,
};
use crate::metrics::CacheMetrics;
use crate::near::{self, NearParams};
use crate::registry::PendingOp;
use crate::topology::TopologySnapshot;
use crate::version::CacheVersion;
use crate::NodeId;
use crate::backup::DhtUpdateFuture;

/// Tombstones produced by a batch: `(partition, key, version)`.
type Deleted = Vec<(u32, Vec<u8>, CacheVersion)>;

enum BatchOutcome {
    Applied {
        dht: Option<Arc<DhtUpdateFuture>>,
        deleted: Deleted,
    },
    /// Topology or ownership disagreed with the request; the whole key set
    /// goes back to the originator for remapping. Not an error.
    Remap,
}

/// Entry point for a near update request arriving on this node.
pub(crate) async fn process_near_update(
    ctx: &Arc<CacheContext>,
    origin: NodeId,
    req: NearUpdateRequest,
) {
    if ctx.is_stopping() {
        reply_interrupted(ctx, origin, req).await;
        return;
    }

    // Suspension point: wait for rebalancing partitions without holding locks.
    let mut parts: Vec<u32> = req.keys.iter().map(|k| ctx.affinity.partition(k)).collect();
    parts.sort_unstable();
    parts.dedup();
    ctx.preloader.wait_ready(&parts).await;

    if ctx.is_stopping() {
        reply_interrupted(ctx, origin, req).await;
        return;
    }

    let mut res = NearUpdateResponse::new(req.future_version);
    match apply_batch(ctx, origin, &req, &mut res) {
        Err(err) => {
            warn!(error = ?err, "update batch failed");
            res.add_failed_all(req.keys.iter().cloned(), &err);
            CacheMetrics::add(&ctx.metrics.failed_keys, req.keys.len() as u64);
            reply_near(ctx, origin, req, res).await;
        }
        Ok(BatchOutcome::Remap) => {
            debug!(topology = req.topology_version, "remapping update request");
            CacheMetrics::incr(&ctx.metrics.remaps);
            res.remap_keys = req.keys.clone();
            reply_near(ctx, origin, req, res).await;
        }
        Ok(BatchOutcome::Applied { dht, deleted }) => {
            // Tombstones enqueue outside the lock region.
            for (part, key, version) in deleted {
                ctx.entries.enqueue_deferred_delete(part, key, version);
            }
            match dht {
                Some(fut) => {
                    ctx.registry
                        .register(fut.future_version, PendingOp::Dht(fut.clone()));
                    fut.map(ctx, req, res).await;
                }
                None => reply_near(ctx, origin, req, res).await,
            }
        }
    }
}

async fn reply_interrupted(ctx: &Arc<CacheContext>, origin: NodeId, req: NearUpdateRequest) {
    let mut res = NearUpdateResponse::new(req.future_version);
    let err = CacheError::Interrupted("node stopping".into());
    res.add_failed_all(req.keys.iter().cloned(), &err);
    reply_near(ctx, origin, req, res).await;
}

/// The synchronous locked region: resolve and lock entries, check topology,
/// assign the version, apply, write through, and build the backup buckets.
fn apply_batch(
    ctx: &Arc<CacheContext>,
    origin: NodeId,
    req: &NearUpdateRequest,
    res: &mut NearUpdateResponse,
) -> crate::error::Result<BatchOutcome> {
    let now = now_ms();
    let mut attempts = 0;

    'retry: loop {
        attempts += 1;
        if attempts > MAX_LOCK_RETRIES {
            return Err(CacheError::EntryRemoved);
        }

        // Resolve entries, probing partition ownership as we go.
        let probe = ctx.topology.snapshot();
        let mut entries: Vec<Arc<CacheEntry>> = Vec::with_capacity(req.keys.len());
        for key in &req.keys {
            let part = ctx.affinity.partition(key);
            if !probe.is_owner(part, ctx.node_id) {
                return Ok(BatchOutcome::Remap);
            }
            entries.push(ctx.entries.entry_or_create(key, part));
        }

        // Acquire the entry locks in key-list order; an obsolete entry in
        // the prefix releases everything and restarts.
        let Some(mut guards) = lock_in_order(&entries) else {
            continue 'retry;
        };

        let snapshot = ctx.topology.snapshot();
        // In PRIMARY mode a stale request is bounced back for remapping; in
        // CLOCK mode the version comparison rejects stale writes per entry.
        if snapshot.version != req.topology_version && req.order_mode == WriteOrder::Primary {
            return Ok(BatchOutcome::Remap);
        }

        // Assign the write version inside the entry lock region.
        let write_version = req
            .write_version
            .unwrap_or_else(|| ctx.versions.next(req.topology_version));
        debug!(version = ?write_version, keys = req.keys.len(), "applying update batch");

        let dht = if ctx.config.backups > 0 && !req.fast_map && snapshot.members.len() > 1 {
            Some(Arc::new(DhtUpdateFuture::new(
                ctx,
                origin,
                write_version,
                req.sync_mode,
                req.topology_version,
                req.ttl_ms,
            )))
        } else {
            None
        };

        let mut deleted: Deleted = Vec::new();
        let use_batch = ctx.batch_store_update()
            && req.keys.len() > 1
            && !req.has_conflict_info()
            && !req.return_value;
        if use_batch {
            update_with_batch(
                ctx, req, res, &entries, &mut guards, write_version, dht.as_deref(), &snapshot,
                &mut deleted, now,
            );
        } else {
            update_single(
                ctx, req, res, &entries, &mut guards, write_version, dht.as_deref(), &snapshot,
                &mut deleted, now,
            );
        }

        drop(guards);
        return Ok(BatchOutcome::Applied { dht, deleted });
    }
}

/// Resolve the concrete operation and value for key `i`, evaluating
/// transforms against the locked entry state. A transform returning `None`
/// converts to a delete; `Some` converts to an update.
fn resolve_operation(
    ctx: &CacheContext,
    req: &NearUpdateRequest,
    state: &EntryState,
    i: usize,
    now: i64,
) -> crate::error::Result<(Operation, Option<Vec<u8>>)> {
    match req.operation {
        Operation::Update => Ok((Operation::Update, req.values[i].clone())),
        Operation::Delete => Ok((Operation::Delete, None)),
        Operation::Transform => {
            let spec = &req.transforms[i];
            let Some(transform) = ctx.transforms.resolve(&spec.name) else {
                return Err(CacheError::Deployment(spec.name.clone()));
            };
            CacheMetrics::incr(&ctx.metrics.transforms);
            let current = state.visible_value(now).cloned();
            match transform(current.as_deref(), &spec.arg) {
                Some(value) => Ok((Operation::Update, Some(value))),
                None => Ok((Operation::Delete, None)),
            }
        }
    }
}

fn conflict_parts(
    req: &NearUpdateRequest,
    i: usize,
    write_version: CacheVersion,
) -> (CacheVersion, i64, i64, Option<ConflictInfo>) {
    match req.conflict.get(i).copied().flatten() {
        Some(c) => (c.version, c.ttl_ms, c.expire_time_ms, Some(c)),
        None => (write_version, req.ttl_ms, -1, None),
    }
}

/// Whether this node writes `partition` through to the store for `req`.
/// Fast-mapped requests reach every owner, so only the primary touches the
/// store; regular requests only ever run on the primary.
fn writes_through(
    ctx: &CacheContext,
    req: &NearUpdateRequest,
    snapshot: &TopologySnapshot,
    partition: u32,
) -> bool {
    ctx.store_enabled() && (!req.fast_map || snapshot.is_primary(partition, ctx.node_id))
}

/// Single write-through path: per-entry store calls, per-entry apply.
#[allow(clippy::too_many_arguments)]
fn update_single(
    ctx: &CacheContext,
    req: &NearUpdateRequest,
    res: &mut NearUpdateResponse,
    entries: &[Arc<CacheEntry>],
    guards: &mut [MutexGuard<'_, EntryState>],
    write_version: CacheVersion,
    dht: Option<&DhtUpdateFuture>,
    snapshot: &TopologySnapshot,
    deleted: &mut Deleted,
    now: i64,
) {
    let mut ret: Option<CacheReturn> = None;
    let check_version = req.order_mode == WriteOrder::Clock;

    for i in 0..req.keys.len() {
        let key = &req.keys[i];
        let partition = entries[i].partition;
        let state: &mut EntryState = &mut guards[i];

        if !filter_passes(state, req.filter.as_ref(), now) {
            if ret.is_none() {
                ret = Some(CacheReturn {
                    value: if req.return_value {
                        state.visible_value(now).cloned()
                    } else {
                        None
                    },
                    success: false,
                });
            }
            continue;
        }

        let (op, value) = match resolve_operation(ctx, req, state, i, now) {
            Ok(pair) => pair,
            Err(err) => {
                res.add_failed(key.clone(), &err);
                continue;
            }
        };
        let (version, ttl_ms, expire_ms, conflict) = conflict_parts(req, i, write_version);

        // Write through before stamping the entry; a subsumed write must not
        // reach the store.
        let accepts = !check_version || entry::version_accepts(state, &version, ctx.resolver.as_ref());
        if accepts && writes_through(ctx, req, snapshot, partition) {
            let store = ctx.store.as_ref().expect("store enabled");
            let store_res = match op {
                Operation::Update => store.put_all(&[(
                    key.clone(),
                    value.clone().expect("update carries a value"),
                    version,
                )]),
                _ => store.remove_all(&[key.clone()]),
            };
            if let Err(err) = store_res {
                res.add_failed(key.clone(), &err);
                continue;
            }
        }

        let outcome = entry::apply_update(
            state,
            op,
            value,
            version,
            ttl_ms,
            expire_ms,
            check_version,
            ctx.resolver.as_ref(),
            req.return_value,
            now,
        );
        record_outcome(
            ctx, req, key, partition, &outcome, conflict, dht, snapshot, deleted,
        );
        if ret.is_none() {
            ret = Some(CacheReturn {
                value: outcome.old_value,
                success: outcome.success,
            });
        }
    }

    res.return_value = Some(ret.unwrap_or(CacheReturn {
        value: None,
        success: true,
    }));
}

/// Batched write-through path: one store call per homogeneous sub-batch.
/// Transform conversions split the batch — accumulated puts flush before a
/// delete starts collecting and vice versa.
#[allow(clippy::too_many_arguments)]
fn update_with_batch(
    ctx: &CacheContext,
    req: &NearUpdateRequest,
    res: &mut NearUpdateResponse,
    entries: &[Arc<CacheEntry>],
    guards: &mut [MutexGuard<'_, EntryState>],
    write_version: CacheVersion,
    dht: Option<&DhtUpdateFuture>,
    snapshot: &TopologySnapshot,
    deleted: &mut Deleted,
    now: i64,
) {
    debug_assert!(!req.return_value, "batched path never returns values");

    // Current homogeneous sub-batch: entry index plus the value to write
    // (`None` in a delete batch).
    let mut put_batch: Vec<(usize, Vec<u8>)> = Vec::new();
    let mut rmv_batch: Vec<usize> = Vec::new();

    for i in 0..req.keys.len() {
        let state: &EntryState = &guards[i];
        if !filter_passes(state, req.filter.as_ref(), now) {
            continue;
        }

        let (op, value) = match resolve_operation(ctx, req, state, i, now) {
            Ok(pair) => pair,
            Err(err) => {
                res.add_failed(req.keys[i].clone(), &err);
                continue;
            }
        };

        match op {
            Operation::Update => {
                if !rmv_batch.is_empty() {
                    flush_partial_batch(
                        ctx, req, res, entries, guards, write_version, dht, snapshot, deleted,
                        now, Operation::Delete, std::mem::take(&mut rmv_batch), Vec::new(),
                    );
                }
                put_batch.push((i, value.expect("update carries a value")));
            }
            _ => {
                if !put_batch.is_empty() {
                    flush_partial_batch(
                        ctx, req, res, entries, guards, write_version, dht, snapshot, deleted,
                        now, Operation::Update, Vec::new(), std::mem::take(&mut put_batch),
                    );
                }
                rmv_batch.push(i);
            }
        }
    }

    if !put_batch.is_empty() {
        flush_partial_batch(
            ctx, req, res, entries, guards, write_version, dht, snapshot, deleted, now,
            Operation::Update, Vec::new(), put_batch,
        );
    }
    if !rmv_batch.is_empty() {
        flush_partial_batch(
            ctx, req, res, entries, guards, write_version, dht, snapshot, deleted, now,
            Operation::Delete, rmv_batch, Vec::new(),
        );
    }
}

/// Write one homogeneous sub-batch through the store, then apply its
/// entries. A store failure fails every key of the sub-batch and applies
/// nothing.
#[allow(clippy::too_many_arguments)]
fn flush_partial_batch(
    ctx: &CacheContext,
    req: &NearUpdateRequest,
    res: &mut NearUpdateResponse,
    entries: &[Arc<CacheEntry>],
    guards: &mut [MutexGuard<'_, EntryState>],
    write_version: CacheVersion,
    dht: Option<&DhtUpdateFuture>,
    snapshot: &TopologySnapshot,
    deleted: &mut Deleted,
    now: i64,
    op: Operation,
    rmv_batch: Vec<usize>,
    put_batch: Vec<(usize, Vec<u8>)>,
) {
    let check_version = req.order_mode == WriteOrder::Clock;

    if ctx.store_enabled() {
        let store = ctx.store.as_ref().expect("store enabled");
        let store_res = match op {
            Operation::Update => {
                let writes: Vec<(Vec<u8>, Vec<u8>, CacheVersion)> = put_batch
                    .iter()
                    .filter(|(i, _)| writes_through(ctx, req, snapshot, entries[*i].partition))
                    .map(|(i, v)| (req.keys[*i].clone(), v.clone(), write_version))
                    .collect();
                store.put_all(&writes)
            }
            _ => {
                let removes: Vec<Vec<u8>> = rmv_batch
                    .iter()
                    .filter(|i| writes_through(ctx, req, snapshot, entries[**i].partition))
                    .map(|i| req.keys[*i].clone())
                    .collect();
                store.remove_all(&removes)
            }
        };
        if let Err(err) = store_res {
            let failed: Vec<usize> = match op {
                Operation::Update => put_batch.iter().map(|(i, _)| *i).collect(),
                _ => rmv_batch,
            };
            for i in failed {
                res.add_failed(req.keys[i].clone(), &err);
            }
            CacheMetrics::incr(&ctx.metrics.failed_keys);
            return;
        }
    }

    let items: Vec<(usize, Option<Vec<u8>>)> = match op {
        Operation::Update => put_batch.into_iter().map(|(i, v)| (i, Some(v))).collect(),
        _ => rmv_batch.into_iter().map(|i| (i, None)).collect(),
    };

    for (i, value) in items {
        let key = &req.keys[i];
        let partition = entries[i].partition;
        let state: &mut EntryState = &mut guards[i];
        let (version, ttl_ms, expire_ms, conflict) = conflict_parts(req, i, write_version);
        let outcome = entry::apply_update(
            state,
            op,
            value,
            version,
            ttl_ms,
            expire_ms,
            check_version,
            ctx.resolver.as_ref(),
            false,
            now,
        );
        record_outcome(
            ctx, req, key, partition, &outcome, conflict, dht, snapshot, deleted,
        );
    }
}

/// Fold one apply outcome into the backup fan-out and the tombstone list.
#[allow(clippy::too_many_arguments)]
fn record_outcome(
    ctx: &CacheContext,
    req: &NearUpdateRequest,
    key: &[u8],
    partition: u32,
    outcome: &ApplyOutcome,
    conflict: Option<ConflictInfo>,
    dht: Option<&DhtUpdateFuture>,
    snapshot: &TopologySnapshot,
    deleted: &mut Deleted,
) {
    match req.operation {
        Operation::Delete => CacheMetrics::incr(&ctx.metrics.removes),
        _ => CacheMetrics::incr(&ctx.metrics.puts),
    }
    if let Some(dht) = dht {
        if outcome.send_backup() {
            dht.add_write_entry(
                snapshot,
                ctx.node_id,
                partition,
                key,
                outcome.new_value.clone(),
                conflict,
            );
        } else {
            debug!(partition, "entry skipped by filter or conflict resolution, no backup write");
        }
    }
    if let Some(tombstone) = outcome.tombstone {
        deleted.push((partition, key.to_vec(), tombstone));
    }
}

/// Route a finished near response back to its originator.
///
/// CLOCK mode always replies. PRIMARY mode replies unless the request was
/// FULL_ASYNC, in which case a remap outcome is re-issued from this node
/// toward the new primary and plain failures are logged.
pub(crate) async fn reply_near(
    ctx: &Arc<CacheContext>,
    origin: NodeId,
    req: NearUpdateRequest,
    res: NearUpdateResponse,
) {
    let deliver = match req.order_mode {
        WriteOrder::Clock => true,
        WriteOrder::Primary => req.sync_mode != WriteSync::FullAsync,
    };

    if deliver {
        if origin == ctx.node_id {
            if let Some(fut) = ctx.registry.near(&res.future_version) {
                fut.on_response(ctx, origin, res).await;
            } else {
                debug!(future = ?res.future_version, "no near future for update reply");
            }
        } else if let Err(err) = ctx
            .transport
            .send(origin, Message::NearUpdateResponse(res))
            .await
        {
            warn!(error = ?err, peer = origin, "failed to send near update reply");
        }
        return;
    }

    if !res.remap_keys.is_empty() {
        remap_to_new_primary(ctx, req).await;
    } else if !res.failed_keys.is_empty() {
        warn!(
            failed = res.failed_keys.len(),
            "failed to process FULL_ASYNC update request"
        );
    }
}

/// FULL_ASYNC remap re-issued from the primary, bounded by a hop counter so
/// a flapping topology cannot loop the request forever.
async fn remap_to_new_primary(ctx: &Arc<CacheContext>, req: NearUpdateRequest) {
    if req.hops >= ctx.config.max_remap_hops {
        warn!(
            hops = req.hops,
            keys = req.keys.len(),
            "dropping FULL_ASYNC update request after too many remap hops"
        );
        return;
    }
    debug!(hops = req.hops + 1, "remapping FULL_ASYNC update request locally");
    CacheMetrics::incr(&ctx.metrics.remaps);
    near::spawn_detached(
        ctx,
        NearParams {
            operation: req.operation,
            keys: req.keys,
            values: req.values,
            transforms: req.transforms,
            conflict: req.conflict,
            filter: req.filter,
            ttl_ms: req.ttl_ms,
            return_value: false,
            sync_mode: WriteSync::FullAsync,
            hops: req.hops + 1,
        },
    );
}
