//! Cluster membership and discovery events.
//!
//! The discovery service publishes the current member list and raises
//! join/left/failed events to subscribed caches. Membership here is static
//! or operator-driven; failure detection itself is a collaborator concern.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::MemberAddr;
use crate::NodeId;

/// Cluster member state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Active,
    Left,
    Failed,
}

/// Cluster member descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub node_id: NodeId,
    pub addr: Option<SocketAddr>,
    pub state: MemberState,
}

/// Kind of membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEventKind {
    Joined,
    Left,
    Failed,
}

/// A membership change plus the resulting active member set.
#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub kind: MembershipEventKind,
    pub node: NodeId,
    /// Active members after the event, sorted.
    pub members: Vec<NodeId>,
}

/// In-process discovery service shared by the nodes of one cluster.
pub struct Discovery {
    members: RwLock<BTreeMap<NodeId, MemberInfo>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<MembershipEvent>>>,
}

impl Discovery {
    pub fn new(initial: &[MemberAddr]) -> Self {
        let members = initial
            .iter()
            .map(|m| {
                (
                    m.node_id,
                    MemberInfo {
                        node_id: m.node_id,
                        addr: Some(m.addr),
                        state: MemberState::Active,
                    },
                )
            })
            .collect();
        Self {
            members: RwLock::new(members),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Active member ids, sorted.
    pub fn members(&self) -> Vec<NodeId> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|m| m.state == MemberState::Active)
            .map(|m| m.node_id)
            .collect()
    }

    pub fn member_addr(&self, node: NodeId) -> Option<SocketAddr> {
        self.members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&node)
            .and_then(|m| m.addr)
    }

    /// Subscribe to membership events. Returns the current active member set
    /// and the event stream.
    pub fn subscribe(&self) -> (Vec<NodeId>, mpsc::UnboundedReceiver<MembershipEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        // Snapshot under the listener lock so no event is lost between the
        // snapshot and the registration.
        let mut listeners = self.listeners.lock();
        let members = self.members();
        listeners.push(tx);
        (members, rx)
    }

    pub fn node_joined(&self, node: NodeId, addr: Option<SocketAddr>) {
        {
            let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
            members.insert(
                node,
                MemberInfo {
                    node_id: node,
                    addr,
                    state: MemberState::Active,
                },
            );
        }
        self.emit(MembershipEventKind::Joined, node);
    }

    pub fn node_left(&self, node: NodeId) {
        self.mark(node, MemberState::Left);
        self.emit(MembershipEventKind::Left, node);
    }

    pub fn node_failed(&self, node: NodeId) {
        self.mark(node, MemberState::Failed);
        self.emit(MembershipEventKind::Failed, node);
    }

    fn mark(&self, node: NodeId, state: MemberState) {
        let mut members = self.members.write().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = members.get_mut(&node) {
            info.state = state;
        }
    }

    fn emit(&self, kind: MembershipEventKind, node: NodeId) {
        let event = MembershipEvent {
            kind,
            node,
            members: self.members(),
        };
        let mut listeners = self.listeners.lock();
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// JSON dump of the member table for diagnostics.
    pub fn state_json(&self) -> String {
        let members: Vec<MemberInfo> = self
            .members
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        serde_json::to_string(&members).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[NodeId]) -> Vec<MemberAddr> {
        ids.iter()
            .map(|&node_id| MemberAddr {
                node_id,
                addr: "127.0.0.1:0".parse().unwrap(),
            })
            .collect()
    }

    #[tokio::test]
    async fn events_carry_resulting_member_set() {
        let discovery = Discovery::new(&members(&[1, 2, 3]));
        let (initial, mut rx) = discovery.subscribe();
        assert_eq!(initial, vec![1, 2, 3]);

        discovery.node_failed(2);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, MembershipEventKind::Failed);
        assert_eq!(event.node, 2);
        assert_eq!(event.members, vec![1, 3]);

        discovery.node_joined(4, None);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.members, vec![1, 3, 4]);
    }
}
