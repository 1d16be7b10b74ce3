//! Error types for the atomic cache pipeline.
//!
//! Per-key failures are accumulated into responses and never abort a whole
//! batch, with one exception: `InvalidPartition` abandons the remaining work
//! and triggers a full remap on the originating node.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Unified error type for cache operations.
///
/// Variants carry owned strings so errors can be cloned into per-key failure
/// lists and shipped across the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Entry became obsolete during lock acquisition; retriable locally.
    #[error("cache entry was concurrently removed")]
    EntryRemoved,

    /// Partition is not owned by the local node; triggers a remap.
    #[error("partition {0} is not owned by the local node")]
    InvalidPartition(u32),

    /// A remote node left the cluster mid-request.
    #[error("topology changed: {0}")]
    Topology(String),

    /// Admission or timeout rejected the operation.
    #[error("operation rejected: {0}")]
    Rejected(String),

    /// A user transform could not be resolved on the primary.
    #[error("transform not deployed: {0}")]
    Deployment(String),

    /// Node is stopping or the operation was cancelled.
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// The write-through store failed.
    #[error("store failure: {0}")]
    Store(String),

    /// A wire frame could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport could not deliver a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Stable wire code for the error kind.
    pub fn code(&self) -> u8 {
        match self {
            CacheError::EntryRemoved => 1,
            CacheError::InvalidPartition(_) => 2,
            CacheError::Topology(_) => 3,
            CacheError::Rejected(_) => 4,
            CacheError::Deployment(_) => 5,
            CacheError::Interrupted(_) => 6,
            CacheError::Store(_) => 7,
            CacheError::Protocol(_) => 8,
            CacheError::Transport(_) => 9,
            CacheError::Config(_) => 10,
        }
    }

    /// Rebuild an error from its wire code and message.
    pub fn from_code(code: u8, msg: String) -> Self {
        match code {
            1 => CacheError::EntryRemoved,
            2 => CacheError::InvalidPartition(msg.parse().unwrap_or(0)),
            3 => CacheError::Topology(msg),
            4 => CacheError::Rejected(msg),
            5 => CacheError::Deployment(msg),
            6 => CacheError::Interrupted(msg),
            7 => CacheError::Store(msg),
            8 => CacheError::Protocol(msg),
            9 => CacheError::Transport(msg),
            _ => CacheError::Config(msg),
        }
    }

    /// Message payload carried next to the wire code.
    pub fn wire_message(&self) -> String {
        match self {
            CacheError::EntryRemoved => String::new(),
            CacheError::InvalidPartition(p) => p.to_string(),
            CacheError::Topology(m)
            | CacheError::Rejected(m)
            | CacheError::Deployment(m)
            | CacheError::Interrupted(m)
            | CacheError::Store(m)
            | CacheError::Protocol(m)
            | CacheError::Transport(m)
            | CacheError::Config(m) => m.clone(),
        }
    }
}
