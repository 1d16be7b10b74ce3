//! Per-partition entry storage and the per-entry exclusion protocol.
//!
//! Every entry carries its own mutex. Updates acquire it before any state
//! change; multi-entry batches acquire in the order given by the request's
//! key list and restart from scratch if any entry turns obsolete while the
//! prefix is being locked. Locks are only ever held inside synchronous
//! regions, never across an await point.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};

use crate::messages::{EntryFilter, Operation};
use crate::version::{CacheVersion, ConflictDecision, ConflictResolver};

/// Bound on lock-acquisition restarts before the batch fails with
/// `EntryRemoved`. Obsolete transitions are monotonic, so in practice the
/// loop terminates long before this.
pub(crate) const MAX_LOCK_RETRIES: usize = 100;

/// Per-partition bound on retained tombstones. Overflow discards the oldest
/// tombstone even before its hold window elapses.
const DEFERRED_DELETE_QUEUE_CAP: usize = 2048;

/// Current epoch time in milliseconds (saturating).
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(i64::MAX as u128) as i64
}

/// Mutable entry state, guarded by the entry mutex.
#[derive(Debug)]
pub struct EntryState {
    pub value: Option<Vec<u8>>,
    pub version: CacheVersion,
    /// Time-to-live in ms, `-1` when unset.
    pub ttl_ms: i64,
    /// Absolute expiry in epoch ms, `-1` when unset.
    pub expire_time_ms: i64,
    /// Terminal flag: once set the entry is never reanimated; the key may be
    /// re-inserted only through a fresh entry.
    pub obsolete: bool,
    /// Tombstone flag: value is absent but the version is retained for
    /// conflict resolution until the deferred-delete queue discards it.
    pub deleted: bool,
}

impl EntryState {
    fn new() -> Self {
        Self {
            value: None,
            version: CacheVersion::ZERO,
            ttl_ms: -1,
            expire_time_ms: -1,
            obsolete: false,
            deleted: false,
        }
    }

    /// Value visible to readers at `now`: tombstones and expired values are
    /// absent.
    pub fn visible_value(&self, now: i64) -> Option<&Vec<u8>> {
        if self.deleted {
            return None;
        }
        if self.expire_time_ms >= 0 && now >= self.expire_time_ms {
            return None;
        }
        self.value.as_ref()
    }
}

/// One cache entry: immutable identity plus lock-guarded state.
pub struct CacheEntry {
    pub key: Vec<u8>,
    pub partition: u32,
    pub state: Mutex<EntryState>,
}

impl CacheEntry {
    fn new(key: Vec<u8>, partition: u32) -> Self {
        Self {
            key,
            partition,
            state: Mutex::new(EntryState::new()),
        }
    }
}

/// What the entry update rule did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    /// The write was stamped onto the entry.
    Applied,
    /// A newer (or equal) version already holds the entry; the write was
    /// discarded but is reported as successful because it has been subsumed.
    Subsumed,
    /// The request filter rejected the current entry state.
    FilterRejected,
}

/// Result of one entry update.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub status: ApplyStatus,
    pub old_value: Option<Vec<u8>>,
    /// Value after the update, `None` for a tombstone.
    pub new_value: Option<Vec<u8>>,
    /// Set when the update produced a tombstone that must be enqueued for
    /// deferred delete after the lock region.
    pub tombstone: Option<CacheVersion>,
    pub success: bool,
}

impl ApplyOutcome {
    /// Whether this outcome produces a backup write. Subsumed and filtered
    /// entries contribute nothing to the fan-out.
    pub fn send_backup(&self) -> bool {
        self.status == ApplyStatus::Applied
    }
}

/// Evaluate the request filter against locked entry state.
pub fn filter_passes(state: &EntryState, filter: Option<&EntryFilter>, now: i64) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let visible = state.visible_value(now);
    match filter {
        EntryFilter::HasValue => visible.is_some(),
        EntryFilter::NoValue => visible.is_none(),
        EntryFilter::ValueEquals(expected) => visible.map(|v| v == expected).unwrap_or(false),
    }
}

/// Whether an incoming version would be accepted against the current entry
/// state. Write-through consults this before the store call so a subsumed
/// write never reaches the store.
pub fn version_accepts(
    state: &EntryState,
    incoming: &CacheVersion,
    resolver: &dyn ConflictResolver,
) -> bool {
    if state.version.is_zero() {
        return true;
    }
    match state.version.try_cmp(incoming) {
        Some(ord) => ord == std::cmp::Ordering::Less,
        None => resolver.resolve(&state.version, incoming) == ConflictDecision::UseIncoming,
    }
}

/// The entry update rule.
///
/// With `check_version` set, an incoming version that does not exceed the
/// current one is discarded; the entry is left untouched and the outcome
/// reports success with the current value, because from the writer's view
/// the write has been subsumed. Non-comparable versions are settled by the
/// resolver.
#[allow(clippy::too_many_arguments)]
pub fn apply_update(
    state: &mut EntryState,
    op: Operation,
    new_value: Option<Vec<u8>>,
    version: CacheVersion,
    ttl_ms: i64,
    explicit_expire_ms: i64,
    check_version: bool,
    resolver: &dyn ConflictResolver,
    read_old: bool,
    now: i64,
) -> ApplyOutcome {
    debug_assert!(op != Operation::Transform, "transforms are resolved before apply");

    let old_value = if read_old {
        state.visible_value(now).cloned()
    } else {
        None
    };

    if check_version && !version_accepts(state, &version, resolver) {
        return ApplyOutcome {
            status: ApplyStatus::Subsumed,
            old_value,
            new_value: None,
            tombstone: None,
            success: true,
        };
    }

    match op {
        Operation::Update => {
            let value = new_value.expect("update carries a value");
            state.deleted = false;
            state.value = Some(value.clone());
            state.version = version;
            if explicit_expire_ms >= 0 {
                state.ttl_ms = ttl_ms;
                state.expire_time_ms = explicit_expire_ms;
            } else if ttl_ms >= 0 {
                state.ttl_ms = ttl_ms;
                state.expire_time_ms = now + ttl_ms;
            }
            ApplyOutcome {
                status: ApplyStatus::Applied,
                old_value,
                new_value: Some(value),
                tombstone: None,
                success: true,
            }
        }
        Operation::Delete => {
            let had_value = state.visible_value(now).is_some();
            state.value = None;
            state.deleted = true;
            state.ttl_ms = -1;
            state.expire_time_ms = -1;
            state.version = version;
            ApplyOutcome {
                status: ApplyStatus::Applied,
                old_value,
                new_value: None,
                tombstone: Some(version),
                success: had_value,
            }
        }
        Operation::Transform => unreachable!(),
    }
}

struct PartitionEntries {
    map: RwLock<HashMap<Vec<u8>, Arc<CacheEntry>>>,
    /// Deferred-delete queue: `(key, tombstone version, enqueued at)` held
    /// until the sweep discards them.
    rmv_queue: Mutex<VecDeque<(Vec<u8>, CacheVersion, i64)>>,
}

impl PartitionEntries {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            rmv_queue: Mutex::new(VecDeque::new()),
        }
    }
}

/// Key → entry maps, one per partition.
pub struct EntryMap {
    partitions: Vec<PartitionEntries>,
}

impl EntryMap {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partitions: (0..partition_count).map(|_| PartitionEntries::new()).collect(),
        }
    }

    fn part(&self, partition: u32) -> &PartitionEntries {
        &self.partitions[partition as usize]
    }

    /// Resolve the live entry for `key`, creating one if absent or replacing
    /// an obsolete one.
    pub fn entry_or_create(&self, key: &[u8], partition: u32) -> Arc<CacheEntry> {
        let part = self.part(partition);
        loop {
            let existing = {
                let map = part.map.read().unwrap_or_else(|e| e.into_inner());
                map.get(key).cloned()
            };
            if let Some(entry) = existing {
                if !entry.state.lock().obsolete {
                    return entry;
                }
                // Obsolete entries are unlinked and replaced by fresh ones.
                let mut map = part.map.write().unwrap_or_else(|e| e.into_inner());
                if let Some(current) = map.get(key) {
                    if Arc::ptr_eq(current, &entry) {
                        map.remove(key);
                    }
                }
                continue;
            }
            let mut map = part.map.write().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = map.get(key) {
                if !current.state.lock().obsolete {
                    return current.clone();
                }
                map.remove(key);
            }
            let entry = Arc::new(CacheEntry::new(key.to_vec(), partition));
            map.insert(key.to_vec(), entry.clone());
            return entry;
        }
    }

    /// Look up the entry for `key` without creating one.
    pub fn peek(&self, key: &[u8], partition: u32) -> Option<Arc<CacheEntry>> {
        let map = self.part(partition).map.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned()
    }

    /// Read the visible value for `key` without creating an entry.
    pub fn peek_value(&self, key: &[u8], partition: u32, now: i64) -> Option<Vec<u8>> {
        let entry = self.peek(key, partition)?;
        let state = entry.state.lock();
        state.visible_value(now).cloned()
    }

    /// Enqueue a tombstone for deferred delete. Must be called outside the
    /// entry lock region. When the queue overflows, the oldest tombstone is
    /// discarded: marked obsolete and unlinked if its version still matches.
    pub fn enqueue_deferred_delete(&self, partition: u32, key: Vec<u8>, version: CacheVersion) {
        let part = self.part(partition);
        let overflow = {
            let mut queue = part.rmv_queue.lock();
            queue.push_back((key, version, now_ms()));
            if queue.len() > DEFERRED_DELETE_QUEUE_CAP {
                queue.pop_front()
            } else {
                None
            }
        };
        if let Some((key, version, _)) = overflow {
            self.discard_tombstone(partition, &key, version);
        }
    }

    /// Discard every tombstone enqueued at or before `cutoff_ms`. The queue
    /// is FIFO, so the scan stops at the first entry still inside its hold
    /// window. Returns the number of tombstones discarded.
    pub fn sweep_deferred_deletes(&self, partition: u32, cutoff_ms: i64) -> usize {
        let part = self.part(partition);
        let mut discarded = 0;
        loop {
            let next = {
                let mut queue = part.rmv_queue.lock();
                let due = queue
                    .front()
                    .map_or(false, |(_, _, enqueued_at)| *enqueued_at <= cutoff_ms);
                if due {
                    queue.pop_front()
                } else {
                    None
                }
            };
            let Some((key, version, _)) = next else {
                break;
            };
            self.discard_tombstone(partition, &key, version);
            discarded += 1;
        }
        discarded
    }

    /// Drain the deferred-delete queue for a partition regardless of age,
    /// discarding every tombstone whose version still matches. Shutdown
    /// path.
    pub fn drain_deferred_deletes(&self, partition: u32) {
        loop {
            let next = self.part(partition).rmv_queue.lock().pop_front();
            let Some((key, version, _)) = next else {
                break;
            };
            self.discard_tombstone(partition, &key, version);
        }
    }

    fn discard_tombstone(&self, partition: u32, key: &[u8], version: CacheVersion) {
        let part = self.part(partition);
        let Some(entry) = self.peek(key, partition) else {
            return;
        };
        {
            let mut state = entry.state.lock();
            // The tombstone may have been overwritten by a newer update.
            if !state.deleted || state.version != version {
                return;
            }
            state.obsolete = true;
        }
        let mut map = part.map.write().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = map.get(key) {
            if Arc::ptr_eq(current, &entry) {
                map.remove(key);
            }
        }
    }

    /// Number of live (non-tombstone, unexpired) entries in a partition.
    pub fn live_entries(&self, partition: u32, now: i64) -> usize {
        let map = self.part(partition).map.read().unwrap_or_else(|e| e.into_inner());
        map.values()
            .filter(|e| {
                let state = e.state.lock();
                !state.obsolete && state.visible_value(now).is_some()
            })
            .count()
    }
}

/// Acquire the mutexes of `entries` in list order.
///
/// Returns `None` if any entry turned obsolete mid-acquisition; all locks
/// taken so far are released (guards drop) and the caller must re-resolve
/// the entries and retry.
pub fn lock_in_order<'a>(entries: &'a [Arc<CacheEntry>]) -> Option<Vec<MutexGuard<'a, EntryState>>> {
    let mut guards = Vec::with_capacity(entries.len());
    for entry in entries {
        let guard = entry.state.lock();
        if guard.obsolete {
            return None;
        }
        guards.push(guard);
    }
    Some(guards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::LastWriterWins;

    fn ver(order: u64) -> CacheVersion {
        CacheVersion {
            topology_version: 1,
            order,
            node_order: 0,
            data_center_id: 0,
        }
    }

    #[test]
    fn update_then_stale_write_is_subsumed() {
        let mut state = EntryState::new();
        let out = apply_update(
            &mut state,
            Operation::Update,
            Some(b"v2".to_vec()),
            ver(2),
            -1,
            -1,
            true,
            &LastWriterWins,
            true,
            now_ms(),
        );
        assert_eq!(out.status, ApplyStatus::Applied);
        assert!(out.success);

        let stale = apply_update(
            &mut state,
            Operation::Update,
            Some(b"v1".to_vec()),
            ver(1),
            -1,
            -1,
            true,
            &LastWriterWins,
            true,
            now_ms(),
        );
        assert_eq!(stale.status, ApplyStatus::Subsumed);
        assert!(stale.success);
        assert_eq!(stale.old_value.as_deref(), Some(b"v2".as_ref()));
        assert_eq!(state.value.as_deref(), Some(b"v2".as_ref()));
        assert_eq!(state.version, ver(2));
    }

    #[test]
    fn reapplying_same_version_leaves_entry_unchanged() {
        let mut state = EntryState::new();
        for _ in 0..2 {
            apply_update(
                &mut state,
                Operation::Update,
                Some(b"v".to_vec()),
                ver(3),
                -1,
                -1,
                true,
                &LastWriterWins,
                false,
                now_ms(),
            );
        }
        assert_eq!(state.version, ver(3));
        assert_eq!(state.value.as_deref(), Some(b"v".as_ref()));
    }

    #[test]
    fn delete_produces_tombstone() {
        let mut state = EntryState::new();
        apply_update(
            &mut state,
            Operation::Update,
            Some(b"v".to_vec()),
            ver(1),
            -1,
            -1,
            false,
            &LastWriterWins,
            false,
            now_ms(),
        );
        let out = apply_update(
            &mut state,
            Operation::Delete,
            None,
            ver(2),
            -1,
            -1,
            false,
            &LastWriterWins,
            true,
            now_ms(),
        );
        assert_eq!(out.tombstone, Some(ver(2)));
        assert!(out.success);
        assert!(state.deleted);
        assert_eq!(state.version, ver(2));
        assert_eq!(state.visible_value(now_ms()), None);
    }

    #[test]
    fn delete_on_missing_key_reports_no_removal() {
        let mut state = EntryState::new();
        let out = apply_update(
            &mut state,
            Operation::Delete,
            None,
            ver(1),
            -1,
            -1,
            false,
            &LastWriterWins,
            true,
            now_ms(),
        );
        assert_eq!(out.status, ApplyStatus::Applied);
        assert!(!out.success);
        assert!(out.send_backup());
    }

    #[test]
    fn filters_evaluate_against_visible_value() {
        let mut state = EntryState::new();
        let now = now_ms();
        assert!(filter_passes(&state, Some(&EntryFilter::NoValue), now));
        assert!(!filter_passes(&state, Some(&EntryFilter::HasValue), now));

        apply_update(
            &mut state,
            Operation::Update,
            Some(b"a".to_vec()),
            ver(1),
            -1,
            -1,
            false,
            &LastWriterWins,
            false,
            now,
        );
        assert!(filter_passes(&state, Some(&EntryFilter::HasValue), now));
        assert!(filter_passes(
            &state,
            Some(&EntryFilter::ValueEquals(b"a".to_vec())),
            now
        ));
        assert!(!filter_passes(
            &state,
            Some(&EntryFilter::ValueEquals(b"b".to_vec())),
            now
        ));
    }

    #[test]
    fn expired_value_is_invisible() {
        let mut state = EntryState::new();
        let now = now_ms();
        apply_update(
            &mut state,
            Operation::Update,
            Some(b"a".to_vec()),
            ver(1),
            10,
            -1,
            false,
            &LastWriterWins,
            false,
            now,
        );
        assert!(state.visible_value(now).is_some());
        assert!(state.visible_value(now + 11).is_none());
    }

    #[test]
    fn lock_in_order_restarts_on_obsolete() {
        let map = EntryMap::new(4);
        let a = map.entry_or_create(b"a", 0);
        let b = map.entry_or_create(b"b", 0);
        b.state.lock().obsolete = true;

        assert!(lock_in_order(&[a.clone(), b.clone()]).is_none());
        // A fresh resolve replaces the obsolete entry and the retry succeeds.
        let b2 = map.entry_or_create(b"b", 0);
        assert!(!Arc::ptr_eq(&b, &b2));
        assert!(lock_in_order(&[a, b2]).is_some());
    }

    #[test]
    fn deferred_delete_discards_matching_tombstone() {
        let map = EntryMap::new(1);
        let entry = map.entry_or_create(b"k", 0);
        {
            let mut state = entry.state.lock();
            apply_update(
                &mut state,
                Operation::Delete,
                None,
                ver(5),
                -1,
                -1,
                false,
                &LastWriterWins,
                false,
                now_ms(),
            );
        }
        map.enqueue_deferred_delete(0, b"k".to_vec(), ver(5));
        map.drain_deferred_deletes(0);
        assert!(entry.state.lock().obsolete);
        assert!(map.peek(b"k", 0).is_none());
    }

    #[test]
    fn sweep_respects_the_hold_window() {
        let map = EntryMap::new(1);
        let entry = map.entry_or_create(b"k", 0);
        {
            let mut state = entry.state.lock();
            apply_update(
                &mut state,
                Operation::Delete,
                None,
                ver(5),
                -1,
                -1,
                false,
                &LastWriterWins,
                false,
                now_ms(),
            );
        }
        map.enqueue_deferred_delete(0, b"k".to_vec(), ver(5));

        // A cutoff before the enqueue time keeps the tombstone.
        assert_eq!(map.sweep_deferred_deletes(0, now_ms() - 60_000), 0);
        assert!(!entry.state.lock().obsolete);
        assert!(map.peek(b"k", 0).is_some());

        // A cutoff past the enqueue time discards it.
        assert_eq!(map.sweep_deferred_deletes(0, now_ms()), 1);
        assert!(entry.state.lock().obsolete);
        assert!(map.peek(b"k", 0).is_none());
    }

    #[test]
    fn deferred_delete_spares_overwritten_tombstone() {
        let map = EntryMap::new(1);
        let entry = map.entry_or_create(b"k", 0);
        {
            let mut state = entry.state.lock();
            apply_update(
                &mut state,
                Operation::Delete,
                None,
                ver(5),
                -1,
                -1,
                false,
                &LastWriterWins,
                false,
                now_ms(),
            );
        }
        map.enqueue_deferred_delete(0, b"k".to_vec(), ver(5));
        {
            let mut state = entry.state.lock();
            apply_update(
                &mut state,
                Operation::Update,
                Some(b"back".to_vec()),
                ver(6),
                -1,
                -1,
                true,
                &LastWriterWins,
                false,
                now_ms(),
            );
        }
        map.drain_deferred_deletes(0);
        assert!(!entry.state.lock().obsolete);
        assert_eq!(map.peek_value(b"k", 0, now_ms()).as_deref(), Some(b"back".as_ref()));
    }
}
