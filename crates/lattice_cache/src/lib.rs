//! LatticeCache: an in-memory, partitioned, replicated key–value cache with
//! non-transactional atomic updates.
//!
//! Requests enter on any node, route to the primary owner of each key, apply
//! under per-entry exclusion against an ordered version domain, fan out to
//! backup replicas, and reply under one of three write-synchronization
//! contracts (`FULL_SYNC`, `PRIMARY_SYNC`, `FULL_ASYNC`).

pub mod backup;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod deferred;
pub mod entry;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod near;
pub mod primary;
pub mod registry;
pub mod store;
pub mod timer;
pub mod topology;
pub mod transport;
pub mod version;

/// Cluster-unique node identifier.
pub type NodeId = u64;

pub use cache::{AtomicCache, CacheContext, TransformRegistry};
pub use cluster::{Discovery, MembershipEvent, MembershipEventKind};
pub use config::{parse_members, CacheConfig, MemberAddr, WriteOrder, WriteSync};
pub use error::{CacheError, Result};
pub use messages::{EntryFilter, Message, Operation, TransformSpec};
pub use near::UpdateResult;
pub use store::{CacheStore, FjallStore, MemStore};
pub use transport::{LoopbackWire, TcpTransport, Transport};
pub use version::CacheVersion;
