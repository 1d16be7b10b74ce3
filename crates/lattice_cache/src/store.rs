//! Write-through persistence store collaborator.
//!
//! The store sits behind the primary only; backups never write through.
//! Calls are synchronous and batched — the engine issues one `put_all` /
//! `remove_all` per homogeneous sub-batch while holding the entry locks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use fjall::{Keyspace, PartitionCreateOptions};

use crate::error::{CacheError, Result};
use crate::version::CacheVersion;

/// Batched write-through store.
pub trait CacheStore: Send + Sync {
    fn put_all(&self, entries: &[(Vec<u8>, Vec<u8>, CacheVersion)]) -> Result<()>;
    fn remove_all(&self, keys: &[Vec<u8>]) -> Result<()>;
    /// Read back one stored value with its version.
    fn load(&self, key: &[u8]) -> Result<Option<(Vec<u8>, CacheVersion)>>;
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<HashMap<Vec<u8>, (Vec<u8>, CacheVersion)>>,
    fail_writes: AtomicBool,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent writes fail, for store-failure testing.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemStore {
    fn put_all(&self, entries: &[(Vec<u8>, Vec<u8>, CacheVersion)]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Store("injected write failure".into()));
        }
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for (key, value, version) in entries {
            map.insert(key.clone(), (value.clone(), *version));
        }
        Ok(())
    }

    fn remove_all(&self, keys: &[Vec<u8>]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Store("injected write failure".into()));
        }
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }

    fn load(&self, key: &[u8]) -> Result<Option<(Vec<u8>, CacheVersion)>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(key).cloned())
    }
}

/// Fjall-backed durable store.
pub struct FjallStore {
    keyspace: Keyspace,
    entries: fjall::PartitionHandle,
}

impl FjallStore {
    pub fn open(path: &Path) -> Result<Self> {
        let keyspace = fjall::Config::new(path)
            .open()
            .map_err(|e| CacheError::Store(e.to_string()))?;
        let entries = keyspace
            .open_partition("cache_store", PartitionCreateOptions::default())
            .map_err(|e| CacheError::Store(e.to_string()))?;
        Ok(Self { keyspace, entries })
    }
}

impl CacheStore for FjallStore {
    fn put_all(&self, entries: &[(Vec<u8>, Vec<u8>, CacheVersion)]) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for (key, value, version) in entries {
            batch.insert(&self.entries, key.clone(), encode_stored(value, version));
        }
        batch.commit().map_err(|e| CacheError::Store(e.to_string()))
    }

    fn remove_all(&self, keys: &[Vec<u8>]) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for key in keys {
            batch.remove(&self.entries, key.clone());
        }
        batch.commit().map_err(|e| CacheError::Store(e.to_string()))
    }

    fn load(&self, key: &[u8]) -> Result<Option<(Vec<u8>, CacheVersion)>> {
        let Some(bytes) = self
            .entries
            .get(key)
            .map_err(|e| CacheError::Store(e.to_string()))?
        else {
            return Ok(None);
        };
        decode_stored(&bytes).map(Some)
    }
}

/// Stored record: version (21 bytes) followed by the raw value.
fn encode_stored(value: &[u8], version: &CacheVersion) -> Vec<u8> {
    let mut out = Vec::with_capacity(21 + value.len());
    out.extend_from_slice(&version.topology_version.to_le_bytes());
    out.extend_from_slice(&version.order.to_le_bytes());
    out.extend_from_slice(&version.node_order.to_le_bytes());
    out.push(version.data_center_id);
    out.extend_from_slice(value);
    out
}

fn decode_stored(data: &[u8]) -> Result<(Vec<u8>, CacheVersion)> {
    if data.len() < 21 {
        return Err(CacheError::Store("short store record".into()));
    }
    let version = CacheVersion {
        topology_version: u64::from_le_bytes(data[0..8].try_into().unwrap()),
        order: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        node_order: u32::from_le_bytes(data[16..20].try_into().unwrap()),
        data_center_id: data[20],
    };
    Ok((data[21..].to_vec(), version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ver(order: u64) -> CacheVersion {
        CacheVersion {
            topology_version: 1,
            order,
            node_order: 0,
            data_center_id: 0,
        }
    }

    #[test]
    fn mem_store_put_remove_load() {
        let store = MemStore::new();
        store
            .put_all(&[(b"k".to_vec(), b"v".to_vec(), ver(1))])
            .unwrap();
        assert_eq!(store.load(b"k").unwrap(), Some((b"v".to_vec(), ver(1))));
        store.remove_all(&[b"k".to_vec()]).unwrap();
        assert_eq!(store.load(b"k").unwrap(), None);
    }

    #[test]
    fn mem_store_injected_failure() {
        let store = MemStore::new();
        store.set_fail_writes(true);
        assert!(store.put_all(&[(b"k".to_vec(), b"v".to_vec(), ver(1))]).is_err());
    }

    #[test]
    fn fjall_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FjallStore::open(dir.path()).unwrap();
        store
            .put_all(&[
                (b"a".to_vec(), b"1".to_vec(), ver(1)),
                (b"b".to_vec(), b"2".to_vec(), ver(2)),
            ])
            .unwrap();
        assert_eq!(store.load(b"a").unwrap(), Some((b"1".to_vec(), ver(1))));
        store.remove_all(&[b"a".to_vec()]).unwrap();
        assert_eq!(store.load(b"a").unwrap(), None);
        assert_eq!(store.load(b"b").unwrap(), Some((b"2".to_vec(), ver(2))));
    }
}
