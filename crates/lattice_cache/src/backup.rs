//! Backup-update coordination.
//!
//! Primary side: after the engine applies a batch, a short-lived
//! [`DhtUpdateFuture`] carries one request per backup node that owns written
//! partitions and tracks which backups have not acknowledged yet. Under
//! FULL_SYNC the near reply is deferred until that set empties or a
//! membership event removes a node from it; other modes reply immediately
//! after dispatch.
//!
//! Backup side: entries apply under the per-entry lock with version checking
//! always on. Backups never write through to the store. A direct response is
//! sent when keys failed or the request was FULL_SYNC; otherwise the ack is
//! fed to the deferred-ack aggregator.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::CacheContext;
use crate::config::WriteSync;
use crate::entry::{self, now_ms, MAX_LOCK_RETRIES};
use crate::error::CacheError;
use crate::messages::{
    ConflictInfo, DhtUpdateEntry, DhtUpdateRequest, DhtUpdateResponse, Message, NearUpdateRequest,
    NearUpdateResponse, Operation,
};
use crate::metrics::CacheMetrics;
use crate::primary;
use crate::topology::TopologySnapshot;
use crate::version::CacheVersion;
use crate::NodeId;

struct DhtFutState {
    /// Outstanding request per backup node; removal means acknowledged.
    mappings: HashMap<NodeId, DhtUpdateRequest>,
    near_req: Option<NearUpdateRequest>,
    near_res: Option<NearUpdateResponse>,
    replied: bool,
    done: bool,
}

/// Primary-side future tracking one batch's backup fan-out.
pub struct DhtUpdateFuture {
    pub future_version: CacheVersion,
    pub write_version: CacheVersion,
    origin: NodeId,
    sync_mode: WriteSync,
    topology_version: u64,
    ttl_ms: i64,
    state: Mutex<DhtFutState>,
}

impl DhtUpdateFuture {
    pub fn new(
        ctx: &CacheContext,
        origin: NodeId,
        write_version: CacheVersion,
        sync_mode: WriteSync,
        topology_version: u64,
        ttl_ms: i64,
    ) -> Self {
        Self {
            future_version: ctx.versions.next(topology_version),
            write_version,
            origin,
            sync_mode,
            topology_version,
            ttl_ms,
            state: Mutex::new(DhtFutState {
                mappings: HashMap::new(),
                near_req: None,
                near_res: None,
                replied: false,
                done: false,
            }),
        }
    }

    /// Record one applied entry for fan-out. Called while the entry locks
    /// are held; buckets the write per remote owner of the partition.
    pub fn add_write_entry(
        &self,
        snapshot: &TopologySnapshot,
        local: NodeId,
        partition: u32,
        key: &[u8],
        value: Option<Vec<u8>>,
        conflict: Option<ConflictInfo>,
    ) {
        let mut state = self.state.lock();
        for &node in snapshot.owners(partition) {
            if node == local {
                continue;
            }
            let req = state.mappings.entry(node).or_insert_with(|| DhtUpdateRequest {
                future_version: self.future_version,
                write_version: self.write_version,
                sync_mode: self.sync_mode,
                topology_version: self.topology_version,
                ttl_ms: self.ttl_ms,
                entries: Vec::new(),
            });
            req.entries.push(DhtUpdateEntry {
                key: key.to_vec(),
                value: value.clone(),
                conflict,
            });
        }
    }

    pub fn has_mappings(&self) -> bool {
        !self.state.lock().mappings.is_empty()
    }

    /// Send the backup requests and route the near reply per sync mode.
    pub async fn map(
        self: &Arc<Self>,
        ctx: &Arc<CacheContext>,
        near_req: NearUpdateRequest,
        near_res: NearUpdateResponse,
    ) {
        let requests: Vec<(NodeId, DhtUpdateRequest)> = {
            let mut state = self.state.lock();
            state.near_req = Some(near_req);
            state.near_res = Some(near_res);
            state.mappings.iter().map(|(n, r)| (*n, r.clone())).collect()
        };

        let sends = requests.into_iter().map(|(node, req)| {
            let transport = Arc::clone(&ctx.transport);
            async move {
                debug!(peer = node, "sending backup update request");
                (node, transport.send(node, Message::DhtUpdateRequest(req)).await)
            }
        });
        let mut unreachable = Vec::new();
        for (node, sent) in join_all(sends).await {
            if let Err(err) = sent {
                warn!(error = ?err, peer = node, "failed to send backup update request");
                unreachable.push(node);
            }
        }
        if !unreachable.is_empty() {
            let mut state = self.state.lock();
            for node in unreachable {
                state.mappings.remove(&node);
            }
        }

        // Reply right away unless every backup must acknowledge first.
        if self.sync_mode != WriteSync::FullSync {
            let replied = {
                let mut state = self.state.lock();
                if state.replied {
                    None
                } else {
                    state.replied = true;
                    Some((
                        state.near_req.clone().expect("mapped"),
                        state.near_res.clone().expect("mapped"),
                    ))
                }
            };
            if let Some((req, res)) = replied {
                primary::reply_near(ctx, self.origin, req, res).await;
            }
        }

        self.check_complete(ctx).await;
    }

    /// Direct backup response.
    pub async fn on_result(self: &Arc<Self>, ctx: &Arc<CacheContext>, node: NodeId, res: DhtUpdateResponse) {
        {
            let mut state = self.state.lock();
            if !res.failed_keys.is_empty() {
                if state.replied {
                    warn!(peer = node, failed = res.failed_keys.len(), "backup reported failed keys after reply");
                } else if let Some(near_res) = state.near_res.as_mut() {
                    near_res.failed_keys.extend(res.failed_keys);
                }
            }
            state.mappings.remove(&node);
        }
        self.check_complete(ctx).await;
    }

    /// Ack that arrived through the deferred-ack aggregator.
    pub async fn on_deferred_ack(self: &Arc<Self>, ctx: &Arc<CacheContext>, node: NodeId) {
        self.state.lock().mappings.remove(&node);
        self.check_complete(ctx).await;
    }

    /// A backup left the cluster before acknowledging: its keys become
    /// failed with a topology error and the wait continues without it.
    pub async fn on_node_left(self: &Arc<Self>, ctx: &Arc<CacheContext>, node: NodeId) {
        {
            let mut state = self.state.lock();
            let Some(req) = state.mappings.remove(&node) else {
                return;
            };
            let err = CacheError::Topology(format!(
                "backup node {node} left before acknowledging the write"
            ));
            if state.replied {
                warn!(peer = node, "backup left after near reply was sent");
            } else if let Some(near_res) = state.near_res.as_mut() {
                for entry in req.entries {
                    near_res.add_failed(entry.key, &err);
                }
            }
        }
        self.check_complete(ctx).await;
    }

    async fn check_complete(self: &Arc<Self>, ctx: &Arc<CacheContext>) {
        let reply = {
            let mut state = self.state.lock();
            // Not mapped yet, or still waiting on backups.
            if state.done || state.near_res.is_none() || !state.mappings.is_empty() {
                return;
            }
            state.done = true;
            if !state.replied {
                state.replied = true;
                Some((
                    state.near_req.take().expect("mapped"),
                    state.near_res.take().expect("mapped"),
                ))
            } else {
                None
            }
        };
        ctx.registry.remove(&self.future_version);
        if let Some((req, res)) = reply {
            primary::reply_near(ctx, self.origin, req, res).await;
        }
    }
}

/// Backup-side processing of one incoming backup-update request.
pub(crate) async fn process_dht_update(ctx: &Arc<CacheContext>, from: NodeId, req: DhtUpdateRequest) {
    debug!(peer = from, future = ?req.future_version, entries = req.entries.len(),
        "processing backup update request");

    let mut res = DhtUpdateResponse {
        future_version: req.future_version,
        failed_keys: Vec::new(),
    };
    let now = now_ms();

    for wire_entry in &req.entries {
        let partition = ctx.affinity.partition(&wire_entry.key);
        let op = if wire_entry.value.is_some() {
            Operation::Update
        } else {
            Operation::Delete
        };
        let (version, ttl_ms, expire_ms) = match wire_entry.conflict {
            Some(c) => (c.version, c.ttl_ms, c.expire_time_ms),
            None => (req.write_version, req.ttl_ms, -1),
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            if attempts > MAX_LOCK_RETRIES {
                res.failed_keys.push(crate::messages::FailedKey::new(
                    wire_entry.key.clone(),
                    &CacheError::EntryRemoved,
                ));
                break;
            }
            let cache_entry = ctx.entries.entry_or_create(&wire_entry.key, partition);
            let outcome = {
                let mut state = cache_entry.state.lock();
                if state.obsolete {
                    continue;
                }
                // Always compare versions on backups.
                entry::apply_update(
                    &mut state,
                    op,
                    wire_entry.value.clone(),
                    version,
                    ttl_ms,
                    expire_ms,
                    true,
                    ctx.resolver.as_ref(),
                    false,
                    now,
                )
            };
            if let Some(tombstone) = outcome.tombstone {
                ctx.entries
                    .enqueue_deferred_delete(partition, wire_entry.key.clone(), tombstone);
            }
            CacheMetrics::incr(&ctx.metrics.backup_updates);
            break;
        }
    }

    if !res.failed_keys.is_empty() || req.sync_mode == WriteSync::FullSync {
        if let Err(err) = ctx
            .transport
            .send(from, Message::DhtUpdateResponse(res))
            .await
        {
            warn!(error = ?err, peer = from, "failed to send backup update response");
        }
    } else {
        // No failures and the originator is not waiting: coalesce the ack.
        ctx.deferred_acks.enqueue(from, req.future_version);
    }
}
