//! Flat operation counters. Single-writer where possible, plain atomics
//! otherwise; no aggregation layer.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct CacheMetrics {
    pub puts: AtomicU64,
    pub removes: AtomicU64,
    pub transforms: AtomicU64,
    pub gets: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub remaps: AtomicU64,
    pub backup_updates: AtomicU64,
    pub deferred_flushes: AtomicU64,
    pub tombstones_swept: AtomicU64,
    pub failed_keys: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
