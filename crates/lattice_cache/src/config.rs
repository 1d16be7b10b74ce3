//! Cache and node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::NodeId;

/// How a write waits for its backup replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteSync {
    /// Reply to the caller only after every backup has acknowledged.
    FullSync,
    /// Reply after the primary write; backups acknowledge asynchronously.
    PrimarySync,
    /// Reply immediately after dispatch; failures are logged and retried internally.
    FullAsync,
}

/// How stale-topology requests are handled on the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOrder {
    /// Accept requests at any topology version; version comparison rejects
    /// stale writes at the entry level.
    Clock,
    /// Reject requests mapped at a stale topology and ask the client to remap.
    Primary,
}

/// Configuration of one atomic cache instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of backup copies per partition.
    pub backups: usize,
    /// Fixed partition count, chosen at cache creation.
    pub partition_count: u32,
    pub write_sync: WriteSync,
    pub write_order: WriteOrder,
    /// Deferred-ack flush threshold (entry count).
    pub deferred_ack_buffer_size: usize,
    /// Deferred-ack flush timeout.
    pub deferred_ack_timeout: Duration,
    /// How long a tombstone's version is retained for conflict resolution
    /// before the deferred-delete sweep discards it.
    pub deferred_delete_hold: Duration,
    /// Whether write-through to the persistence store is performed.
    pub store_enabled: bool,
    /// Enables the batched write-through path for multi-key requests.
    pub batch_update_on_commit: bool,
    /// Bound on session-level network waits.
    pub network_timeout: Duration,
    /// Bound on stale-topology remap loops.
    pub remap_attempt_limit: u32,
    /// Bound on primary-side FULL_ASYNC remap hops.
    pub max_remap_hops: u8,
    /// Data-center ordinal stamped into every version this node produces.
    pub data_center_id: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backups: 1,
            partition_count: 1024,
            write_sync: WriteSync::PrimarySync,
            write_order: WriteOrder::Clock,
            deferred_ack_buffer_size: 256,
            deferred_ack_timeout: Duration::from_millis(500),
            deferred_delete_hold: Duration::from_secs(10),
            store_enabled: false,
            batch_update_on_commit: true,
            network_timeout: Duration::from_secs(10),
            remap_attempt_limit: 100,
            max_remap_hops: 8,
            data_center_id: 0,
        }
    }
}

impl CacheConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.partition_count == 0 {
            return Err(CacheError::Config("partition_count must be positive".into()));
        }
        if self.deferred_ack_buffer_size == 0 {
            return Err(CacheError::Config(
                "deferred_ack_buffer_size must be positive".into(),
            ));
        }
        if self.deferred_ack_timeout.is_zero() {
            return Err(CacheError::Config(
                "deferred_ack_timeout must be positive".into(),
            ));
        }
        if self.deferred_delete_hold.is_zero() {
            return Err(CacheError::Config(
                "deferred_delete_hold must be positive".into(),
            ));
        }
        if self.network_timeout.is_zero() {
            return Err(CacheError::Config("network_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// One static cluster member, `id@host:port` on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberAddr {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

/// Parse a comma-separated member list like
/// `1@127.0.0.1:7400,2@127.0.0.1:7401,3@127.0.0.1:7402`.
pub fn parse_members(spec: &str) -> Result<Vec<MemberAddr>> {
    let mut out = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (id, addr) = part
            .split_once('@')
            .ok_or_else(|| CacheError::Config(format!("bad member entry {part:?}")))?;
        let node_id = id
            .parse::<NodeId>()
            .map_err(|_| CacheError::Config(format!("bad node id in {part:?}")))?;
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|_| CacheError::Config(format!("bad address in {part:?}")))?;
        out.push(MemberAddr { node_id, addr });
    }
    if out.is_empty() {
        return Err(CacheError::Config("empty member list".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_member_list() {
        let members = parse_members("1@127.0.0.1:7400, 2@127.0.0.1:7401").unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].node_id, 1);
        assert_eq!(members[1].addr.port(), 7401);
    }

    #[test]
    fn rejects_bad_member_entries() {
        assert!(parse_members("nope").is_err());
        assert!(parse_members("x@127.0.0.1:7400").is_err());
        assert!(parse_members("").is_err());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }
}
