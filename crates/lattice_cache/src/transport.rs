//! Message transport between cluster nodes.
//!
//! Two implementations: an in-process loopback wire for tests and embedded
//! clusters, and a TCP transport with one outbound queue task per peer.
//! Delivery is unordered across peers; `send_ordered` guarantees FIFO per
//! `(topic, node)`, which both implementations satisfy by funneling a peer's
//! traffic through one lane.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::MemberAddr;
use crate::error::{CacheError, Result};
use crate::messages::{Message, MAX_MESSAGE_SIZE};
use crate::NodeId;

/// Capacity of each per-peer outbound queue.
const PEER_QUEUE_CAPACITY: usize = 4096;

/// Sends typed messages to remote nodes by id.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Unordered delivery.
    async fn send(&self, to: NodeId, msg: Message) -> Result<()>;

    /// Delivery ordered per `(topic, node)` with a bounded enqueue wait.
    async fn send_ordered(
        &self,
        to: NodeId,
        topic: &str,
        msg: Message,
        timeout: Duration,
    ) -> Result<()>;

    fn local_node(&self) -> NodeId;
}

/// Shared in-process wire connecting the loopback transports of one cluster.
pub struct LoopbackWire {
    inboxes: Mutex<HashMap<NodeId, mpsc::UnboundedSender<(NodeId, Message)>>>,
    /// Messages parked for held nodes, in arrival order.
    held: Mutex<HashMap<NodeId, Vec<(NodeId, Message)>>>,
}

impl LoopbackWire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a node to the wire. Returns its transport and inbound stream.
    pub fn attach(
        self: &Arc<Self>,
        node: NodeId,
    ) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<(NodeId, Message)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().insert(node, tx);
        (
            Arc::new(LoopbackTransport {
                wire: Arc::clone(self),
                local: node,
            }),
            rx,
        )
    }

    /// Remove a node's inbox; subsequent sends to it fail like a dead peer.
    pub fn detach(&self, node: NodeId) {
        self.inboxes.lock().remove(&node);
        self.held.lock().remove(&node);
    }

    /// Park deliveries to `node` without failing the senders, simulating a
    /// reachable peer that has stopped processing.
    pub fn hold(&self, node: NodeId) {
        self.held.lock().entry(node).or_default();
    }

    /// Flush parked deliveries and resume normal delivery to `node`.
    pub fn release(&self, node: NodeId) {
        let parked = self.held.lock().remove(&node);
        if let Some(parked) = parked {
            let sender = self.inboxes.lock().get(&node).cloned();
            if let Some(sender) = sender {
                for item in parked {
                    let _ = sender.send(item);
                }
            }
        }
    }

    fn deliver(&self, from: NodeId, to: NodeId, msg: Message) -> Result<()> {
        // Round-trip through the codec so in-process clusters exercise the
        // same wire fidelity as TCP ones.
        let frame = msg.encode();
        let msg = Message::decode(&frame)?;
        {
            let mut held = self.held.lock();
            if let Some(parked) = held.get_mut(&to) {
                parked.push((from, msg));
                return Ok(());
            }
        }
        let sender = self
            .inboxes
            .lock()
            .get(&to)
            .cloned()
            .ok_or_else(|| CacheError::Transport(format!("node {to} is not reachable")))?;
        sender
            .send((from, msg))
            .map_err(|_| CacheError::Transport(format!("node {to} is not reachable")))
    }
}

/// In-process transport endpoint.
pub struct LoopbackTransport {
    wire: Arc<LoopbackWire>,
    local: NodeId,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, to: NodeId, msg: Message) -> Result<()> {
        self.wire.deliver(self.local, to, msg)
    }

    async fn send_ordered(
        &self,
        to: NodeId,
        _topic: &str,
        msg: Message,
        _timeout: Duration,
    ) -> Result<()> {
        // One FIFO inbox per node: per-topic order is implied.
        self.wire.deliver(self.local, to, msg)
    }

    fn local_node(&self) -> NodeId {
        self.local
    }
}

/// TCP transport with a lazily-connected outbound queue per peer.
pub struct TcpTransport {
    local: NodeId,
    addrs: HashMap<NodeId, SocketAddr>,
    peers: Arc<Mutex<HashMap<NodeId, mpsc::Sender<Bytes>>>>,
}

impl TcpTransport {
    /// Bind the listener and return the transport plus the inbound stream.
    pub async fn bind(
        local: NodeId,
        listen: SocketAddr,
        members: &[MemberAddr],
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<(NodeId, Message)>)> {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| CacheError::Transport(format!("bind {listen}: {e}")))?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            local,
            addrs: members.iter().map(|m| (m.node_id, m.addr)).collect(),
            peers: Arc::new(Mutex::new(HashMap::new())),
        });

        tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = ?err, "accept failed");
                        continue;
                    }
                };
                let inbound_tx = inbound_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = read_peer(stream, inbound_tx).await {
                        tracing::debug!(error = ?err, %remote, "inbound connection closed");
                    }
                });
            }
        });

        Ok((transport, inbound_rx))
    }

    fn peer_queue(&self, to: NodeId) -> Result<mpsc::Sender<Bytes>> {
        if let Some(tx) = self.peers.lock().get(&to).cloned() {
            return Ok(tx);
        }
        let addr = *self
            .addrs
            .get(&to)
            .ok_or_else(|| CacheError::Transport(format!("unknown peer {to}")))?;
        let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        let mut peers = self.peers.lock();
        // Another sender may have raced us here.
        if let Some(existing) = peers.get(&to).cloned() {
            return Ok(existing);
        }
        peers.insert(to, tx.clone());
        drop(peers);

        let local = self.local;
        let peer_map = Arc::clone(&self.peers);
        tokio::spawn(async move {
            if let Err(err) = write_peer(local, addr, rx).await {
                tracing::warn!(error = ?err, peer = to, "outbound connection failed");
            }
            // Drop the queue so the next send reconnects.
            peer_map.lock().remove(&to);
        });
        Ok(tx)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: NodeId, msg: Message) -> Result<()> {
        let queue = self.peer_queue(to)?;
        queue
            .send(Bytes::from(msg.encode()))
            .await
            .map_err(|_| CacheError::Transport(format!("peer {to} queue closed")))
    }

    async fn send_ordered(
        &self,
        to: NodeId,
        _topic: &str,
        msg: Message,
        timeout: Duration,
    ) -> Result<()> {
        // All traffic to one peer shares a single connection, so per-topic
        // FIFO holds; the timeout bounds the enqueue wait on backpressure.
        let queue = self.peer_queue(to)?;
        tokio::time::timeout(timeout, queue.send(Bytes::from(msg.encode())))
            .await
            .map_err(|_| CacheError::Rejected(format!("send to {to} timed out")))?
            .map_err(|_| CacheError::Transport(format!("peer {to} queue closed")))
    }

    fn local_node(&self) -> NodeId {
        self.local
    }
}

/// Inbound side: handshake (peer node id) then length-prefixed frames.
async fn read_peer(
    mut stream: TcpStream,
    inbound_tx: mpsc::UnboundedSender<(NodeId, Message)>,
) -> Result<()> {
    let mut id_buf = [0u8; 8];
    stream
        .read_exact(&mut id_buf)
        .await
        .map_err(|e| CacheError::Transport(e.to_string()))?;
    let peer = NodeId::from_le_bytes(id_buf);

    loop {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(CacheError::Protocol(format!("frame of {len} bytes exceeds limit")));
        }
        let mut frame = vec![0u8; len];
        stream
            .read_exact(&mut frame)
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?;
        let msg = Message::decode(&frame)?;
        if inbound_tx.send((peer, msg)).is_err() {
            return Ok(());
        }
    }
}

/// Outbound side: connect, send the handshake, then drain the queue.
async fn write_peer(
    local: NodeId,
    addr: SocketAddr,
    mut rx: mpsc::Receiver<Bytes>,
) -> Result<()> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| CacheError::Transport(format!("connect {addr}: {e}")))?;
    stream
        .write_all(&local.to_le_bytes())
        .await
        .map_err(|e| CacheError::Transport(e.to_string()))?;

    while let Some(frame) = rx.recv().await {
        stream
            .write_all(&(frame.len() as u32).to_le_bytes())
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| CacheError::Transport(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{GetRequest, Message};
    use crate::version::CacheVersion;

    fn probe(key: &[u8]) -> Message {
        Message::GetRequest(GetRequest {
            future_version: CacheVersion::ZERO,
            key: key.to_vec(),
        })
    }

    #[tokio::test]
    async fn loopback_delivers_and_detach_fails_sends() {
        let wire = LoopbackWire::new();
        let (t1, _rx1) = wire.attach(1);
        let (_t2, mut rx2) = wire.attach(2);

        t1.send(2, probe(b"hello")).await.unwrap();
        let (from, msg) = rx2.recv().await.unwrap();
        assert_eq!(from, 1);
        assert_eq!(msg, probe(b"hello"));

        wire.detach(2);
        assert!(t1.send(2, probe(b"gone")).await.is_err());
    }

    #[tokio::test]
    async fn loopback_ordered_is_fifo_per_peer() {
        let wire = LoopbackWire::new();
        let (t1, _rx1) = wire.attach(1);
        let (_t2, mut rx2) = wire.attach(2);

        for i in 0..10u8 {
            t1.send_ordered(2, "probe", probe(&[i]), Duration::from_secs(1))
                .await
                .unwrap();
        }
        for i in 0..10u8 {
            let (_, msg) = rx2.recv().await.unwrap();
            assert_eq!(msg, probe(&[i]));
        }
    }

    #[tokio::test]
    async fn tcp_roundtrip() {
        let addr1: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(addr1).await.unwrap();
        let bound1 = listener.local_addr().unwrap();
        drop(listener);
        let listener = TcpListener::bind(addr1).await.unwrap();
        let bound2 = listener.local_addr().unwrap();
        drop(listener);

        let members = vec![
            MemberAddr { node_id: 1, addr: bound1 },
            MemberAddr { node_id: 2, addr: bound2 },
        ];
        let (t1, _rx1) = TcpTransport::bind(1, bound1, &members).await.unwrap();
        let (_t2, mut rx2) = TcpTransport::bind(2, bound2, &members).await.unwrap();

        t1.send(2, probe(b"over tcp")).await.unwrap();
        let (from, msg) = tokio::time::timeout(Duration::from_secs(5), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, 1);
        assert_eq!(msg, probe(b"over tcp"));
    }
}
