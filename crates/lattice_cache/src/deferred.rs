//! Deferred-ack aggregation on backup nodes.
//!
//! Instead of one datagram per applied backup request, acks for the same
//! source node are coalesced into a buffer that flushes when it crosses a
//! size threshold or when its timer fires. The seal flag guarantees each
//! buffer flushes exactly once and that a flush cannot run concurrently
//! with additions: adders hold the read lock, the flusher takes the write
//! lock after sealing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::messages::{DhtDeferredAckResponse, Message};
use crate::metrics::CacheMetrics;
use crate::timer::{TimerId, TimerService};
use crate::transport::Transport;
use crate::version::CacheVersion;
use crate::NodeId;

/// Ordered-topic name for ack datagrams.
const ACK_TOPIC: &str = "deferred-ack";

enum AddResult {
    Added,
    AddedAndSealed,
    Sealed,
}

/// One pending ack buffer for a single remote node.
pub struct DeferredAckBuffer {
    sealed: AtomicBool,
    lock: RwLock<()>,
    versions: Mutex<Vec<CacheVersion>>,
    timer_id: AtomicU64,
}

impl DeferredAckBuffer {
    fn new() -> Self {
        Self {
            sealed: AtomicBool::new(false),
            lock: RwLock::new(()),
            versions: Mutex::new(Vec::new()),
            timer_id: AtomicU64::new(0),
        }
    }

    fn try_add(&self, version: CacheVersion, capacity: usize) -> AddResult {
        let _read = self.lock.read();
        if self.sealed.load(Ordering::Acquire) {
            return AddResult::Sealed;
        }
        let len = {
            let mut versions = self.versions.lock();
            versions.push(version);
            versions.len()
        };
        if len >= capacity && self.seal() {
            AddResult::AddedAndSealed
        } else {
            AddResult::Added
        }
    }

    /// Claim the one flush of this buffer.
    fn seal(&self) -> bool {
        self.sealed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drain the buffered versions. Caller must have sealed; the write lock
    /// waits out every in-flight adder.
    fn drain(&self) -> Vec<CacheVersion> {
        debug_assert!(self.sealed.load(Ordering::Acquire));
        let _write = self.lock.write();
        std::mem::take(&mut *self.versions.lock())
    }
}

/// Per-remote-node deferred-ack buffers of one cache node.
pub struct DeferredAckPool {
    transport: Arc<dyn Transport>,
    timer: Arc<TimerService>,
    metrics: Arc<CacheMetrics>,
    capacity: usize,
    flush_timeout: Duration,
    buffers: DashMap<NodeId, Arc<DeferredAckBuffer>>,
}

impl DeferredAckPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        timer: Arc<TimerService>,
        metrics: Arc<CacheMetrics>,
        capacity: usize,
        flush_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            timer,
            metrics,
            capacity,
            flush_timeout,
            buffers: DashMap::new(),
        })
    }

    /// Record that an ack for `version` is owed to `node`.
    pub fn enqueue(self: &Arc<Self>, node: NodeId, version: CacheVersion) {
        loop {
            let buf = self
                .buffers
                .entry(node)
                .or_insert_with(|| self.create_buffer(node))
                .clone();
            match buf.try_add(version, self.capacity) {
                AddResult::Added => return,
                AddResult::AddedAndSealed => {
                    self.flush(node, &buf);
                    return;
                }
                AddResult::Sealed => {
                    // Another thread is shipping the filled buffer; unlink it
                    // and start a fresh one.
                    self.buffers.remove_if(&node, |_, b| Arc::ptr_eq(b, &buf));
                }
            }
        }
    }

    fn create_buffer(self: &Arc<Self>, node: NodeId) -> Arc<DeferredAckBuffer> {
        let buf = Arc::new(DeferredAckBuffer::new());
        let pool = Arc::clone(self);
        let timer_buf = Arc::clone(&buf);
        let id = self.timer.schedule(Instant::now() + self.flush_timeout, move || {
            if timer_buf.seal() {
                pool.flush(node, &timer_buf);
            }
        });
        buf.timer_id.store(id, Ordering::Release);
        buf
    }

    /// Ship a sealed buffer and unlink it from the per-node map.
    fn flush(self: &Arc<Self>, node: NodeId, buf: &Arc<DeferredAckBuffer>) {
        let future_versions = buf.drain();
        self.buffers.remove_if(&node, |_, b| Arc::ptr_eq(b, buf));
        self.timer.cancel(buf.timer_id.load(Ordering::Acquire) as TimerId);
        if future_versions.is_empty() {
            return;
        }

        CacheMetrics::incr(&self.metrics.deferred_flushes);
        let transport = Arc::clone(&self.transport);
        let timeout = self.flush_timeout;
        tokio::spawn(async move {
            let msg = Message::DhtDeferredAck(DhtDeferredAckResponse { future_versions });
            if let Err(err) = transport.send_ordered(node, ACK_TOPIC, msg, timeout).await {
                tracing::debug!(error = ?err, peer = node, "failed to send deferred ack");
            }
        });
    }

    /// Seal and ship every pending buffer (shutdown path).
    pub fn flush_all(self: &Arc<Self>) {
        let nodes: Vec<(NodeId, Arc<DeferredAckBuffer>)> = self
            .buffers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (node, buf) in nodes {
            if buf.seal() {
                self.flush(node, &buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Transport stub that records every sent message.
    struct RecordingTransport {
        sent: Mutex<Vec<(NodeId, Message)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn acks(&self) -> Vec<Vec<CacheVersion>> {
            self.sent
                .lock()
                .iter()
                .map(|(_, m)| match m {
                    Message::DhtDeferredAck(ack) => ack.future_versions.clone(),
                    other => panic!("unexpected message {other:?}"),
                })
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, to: NodeId, msg: Message) -> crate::error::Result<()> {
            self.sent.lock().push((to, msg));
            Ok(())
        }

        async fn send_ordered(
            &self,
            to: NodeId,
            _topic: &str,
            msg: Message,
            _timeout: Duration,
        ) -> crate::error::Result<()> {
            self.sent.lock().push((to, msg));
            Ok(())
        }

        fn local_node(&self) -> NodeId {
            0
        }
    }

    fn ver(order: u64) -> CacheVersion {
        CacheVersion {
            topology_version: 1,
            order,
            node_order: 0,
            data_center_id: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_capacity_then_timer() {
        let transport = RecordingTransport::new();
        let pool = DeferredAckPool::new(
            transport.clone(),
            TimerService::new(),
            Arc::new(CacheMetrics::new()),
            256,
            Duration::from_millis(500),
        );

        for i in 0..260 {
            pool.enqueue(9, ver(i));
        }
        tokio::task::yield_now().await;
        let acks = transport.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].len(), 256);

        // The 4 stragglers go out with the timer flush.
        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        let acks = transport.acks();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[1].len(), 4);

        // Every version shipped exactly once.
        let mut all: Vec<u64> = acks.concat().iter().map(|v| v.order).collect();
        all.sort_unstable();
        assert_eq!(all, (0..260).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_flush_removes_buffer() {
        let transport = RecordingTransport::new();
        let pool = DeferredAckPool::new(
            transport.clone(),
            TimerService::new(),
            Arc::new(CacheMetrics::new()),
            256,
            Duration::from_millis(500),
        );
        pool.enqueue(3, ver(1));
        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.acks(), vec![vec![ver(1)]]);
        assert!(pool.buffers.is_empty());

        // A later ack opens a fresh buffer.
        pool.enqueue(3, ver(2));
        tokio::time::sleep(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.acks().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_ships_pending_acks() {
        let transport = RecordingTransport::new();
        let pool = DeferredAckPool::new(
            transport.clone(),
            TimerService::new(),
            Arc::new(CacheMetrics::new()),
            256,
            Duration::from_millis(500),
        );
        pool.enqueue(1, ver(1));
        pool.enqueue(2, ver(2));
        pool.flush_all();
        tokio::task::yield_now().await;
        assert_eq!(transport.acks().len(), 2);
    }
}
