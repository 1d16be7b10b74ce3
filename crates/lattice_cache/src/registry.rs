//! Registry of pending operations keyed by future version.
//!
//! Responses and deferred acks demultiplex through this map. Lookups are
//! lock-free; every mutating operation is idempotent on its own key.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::backup::DhtUpdateFuture;
use crate::messages::GetResponse;
use crate::near::NearUpdateFuture;
use crate::version::CacheVersion;

/// A pending forwarded read.
pub struct PendingGet {
    tx: Mutex<Option<oneshot::Sender<GetResponse>>>,
}

impl PendingGet {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<GetResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Deliver the response; repeated completions are dropped.
    pub fn complete(&self, res: GetResponse) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(res);
        }
    }
}

/// One pending operation waiting on remote replies.
#[derive(Clone)]
pub enum PendingOp {
    Near(Arc<NearUpdateFuture>),
    Dht(Arc<DhtUpdateFuture>),
    Get(Arc<PendingGet>),
}

/// Concurrent map of pending operations.
#[derive(Default)]
pub struct FutureRegistry {
    inner: DashMap<CacheVersion, PendingOp>,
}

impl FutureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, version: CacheVersion, op: PendingOp) {
        self.inner.insert(version, op);
    }

    pub fn remove(&self, version: &CacheVersion) -> Option<PendingOp> {
        self.inner.remove(version).map(|(_, op)| op)
    }

    pub fn near(&self, version: &CacheVersion) -> Option<Arc<NearUpdateFuture>> {
        match self.inner.get(version).map(|e| e.value().clone()) {
            Some(PendingOp::Near(fut)) => Some(fut),
            _ => None,
        }
    }

    pub fn dht(&self, version: &CacheVersion) -> Option<Arc<DhtUpdateFuture>> {
        match self.inner.get(version).map(|e| e.value().clone()) {
            Some(PendingOp::Dht(fut)) => Some(fut),
            _ => None,
        }
    }

    pub fn get(&self, version: &CacheVersion) -> Option<Arc<PendingGet>> {
        match self.inner.get(version).map(|e| e.value().clone()) {
            Some(PendingOp::Get(fut)) => Some(fut),
            _ => None,
        }
    }

    /// Snapshot every pending op, for membership sweeps and shutdown. The
    /// shard locks are not held while the caller acts on the result.
    pub fn snapshot(&self) -> Vec<PendingOp> {
        self.inner.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
