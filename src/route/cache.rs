//! Sharded routing cache.
//!
//! Keys hash to one of N buckets; each bucket pairs a try-lock mutex over its
//! slot map with a deferred-operation queue. Callers never block on a bucket
//! lock: a contended lookup retries on a timer, a contended mutation is
//! queued and applied the next time the bucket lock is taken.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use iddqd::{IdHashItem, IdHashMap, id_upcast};
use tracing::debug;

use crate::route::entry::{EntryState, RoutingEntry};
use crate::route::key::RoutingKey;

pub const DEFAULT_BUCKET_COUNT: usize = 64;

/// Slot-map item; keyed by the entry's routing key.
#[derive(Debug)]
struct CachedRoute {
    entry: Arc<RoutingEntry>,
}

impl IdHashItem for CachedRoute {
    type Key<'a> = &'a RoutingKey;

    fn key(&self) -> Self::Key<'_> {
        self.entry.key()
    }

    id_upcast!();
}

/// Mutation that could not run because its bucket lock was contended.
#[derive(Debug)]
enum DeferredOp {
    Insert {
        entry: Arc<RoutingEntry>,
        allow_overwrite: bool,
    },
    Remove {
        key: RoutingKey,
    },
    MarkDirty {
        key: RoutingKey,
    },
}

#[derive(Debug)]
struct Bucket {
    slots: Mutex<IdHashMap<CachedRoute>>,
    deferred: Mutex<Vec<DeferredOp>>,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            slots: Mutex::new(IdHashMap::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }
}

/// Outcome of an insert under the bucket lock.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Installed,
    Replaced,
    /// An available entry already occupies the slot and overwrite was not
    /// requested.
    Rejected,
}

pub struct BucketGuard<'a> {
    slots: MutexGuard<'a, IdHashMap<CachedRoute>>,
}

impl BucketGuard<'_> {
    pub fn get(&self, key: &RoutingKey) -> Option<Arc<RoutingEntry>> {
        self.slots.get(&key).map(|c| Arc::clone(&c.entry))
    }

    /// Install `entry` under its key, swapping the slot itself rather than
    /// mutating any entry in place. Without `allow_overwrite` only a
    /// building/stale occupant is replaced; a live `Avail` occupant wins.
    /// A replaced occupant is flagged dirty so lingering holders observe it
    /// as stale.
    pub fn insert_or_replace(
        &mut self,
        entry: Arc<RoutingEntry>,
        allow_overwrite: bool,
    ) -> InsertOutcome {
        let key = entry.key();
        let outcome = match self.slots.get(&key) {
            None => InsertOutcome::Installed,
            Some(occupant) => {
                if !allow_overwrite && occupant.entry.state() == EntryState::Avail {
                    return InsertOutcome::Rejected;
                }
                occupant
                    .entry
                    .compare_and_swap_state(EntryState::Avail, EntryState::Dirty);
                InsertOutcome::Replaced
            }
        };
        self.slots.insert_overwrite(CachedRoute { entry });
        outcome
    }

    pub fn remove(&mut self, key: &RoutingKey) -> Option<Arc<RoutingEntry>> {
        self.slots.remove(&key).map(|c| c.entry)
    }

    /// External staleness signal: flips an available occupant to dirty.
    pub fn mark_dirty(&self, key: &RoutingKey) -> bool {
        match self.slots.get(&key) {
            Some(occupant) => occupant
                .entry
                .compare_and_swap_state(EntryState::Avail, EntryState::Dirty),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Concurrent map from routing key to shared entry, sharded by key hash.
///
/// Guarantee: at most one entry per key is reachable at any instant;
/// replacement swaps the bucket slot under the bucket lock.
pub struct RoutingCache {
    buckets: Vec<Bucket>,
}

impl RoutingCache {
    pub fn new(bucket_count: usize) -> Self {
        let n = bucket_count.max(1);
        let mut buckets = Vec::with_capacity(n);
        buckets.resize_with(n, Bucket::default);
        Self { buckets }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, key: &RoutingKey) -> &Bucket {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.buckets[(hasher.finish() as usize) % self.buckets.len()]
    }

    /// Non-blocking bucket acquisition. `None` means contended: the caller
    /// must defer (timed retry or deferred op), never spin or block, since a
    /// blocked worker stalls every connection multiplexed on it.
    ///
    /// Acquisition drains the bucket's deferred queue before the guard is
    /// handed out, so queued mutations are never reordered after later ones.
    pub fn lock_bucket(&self, key: &RoutingKey) -> Option<BucketGuard<'_>> {
        let bucket = self.bucket(key);
        let slots = match bucket.slots.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        let mut guard = BucketGuard { slots };
        Self::drain_deferred(bucket, &mut guard);
        Some(guard)
    }

    fn drain_deferred(bucket: &Bucket, guard: &mut BucketGuard<'_>) {
        let ops = std::mem::take(
            &mut *bucket
                .deferred
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for op in ops {
            debug!(?op, "applying deferred bucket op");
            match op {
                DeferredOp::Insert {
                    entry,
                    allow_overwrite,
                } => {
                    guard.insert_or_replace(entry, allow_overwrite);
                }
                DeferredOp::Remove { key } => {
                    guard.remove(&key);
                }
                DeferredOp::MarkDirty { key } => {
                    guard.mark_dirty(&key);
                }
            }
        }
    }

    fn defer(&self, key: &RoutingKey, op: DeferredOp) {
        self.bucket(key)
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(op);
    }

    /// Fire-and-forget insert: applied immediately when the bucket lock is
    /// free, queued otherwise.
    pub fn insert_or_replace(&self, entry: Arc<RoutingEntry>, allow_overwrite: bool) {
        let key = entry.key().clone();
        match self.lock_bucket(entry.key()) {
            Some(mut guard) => {
                guard.insert_or_replace(entry, allow_overwrite);
            }
            None => self.defer(
                &key,
                DeferredOp::Insert {
                    entry,
                    allow_overwrite,
                },
            ),
        }
    }

    /// Fire-and-forget removal.
    pub fn remove(&self, key: &RoutingKey) {
        match self.lock_bucket(key) {
            Some(mut guard) => {
                guard.remove(key);
            }
            None => self.defer(key, DeferredOp::Remove { key: key.clone() }),
        }
    }

    /// External staleness signal for one key.
    pub fn mark_dirty(&self, key: &RoutingKey) {
        match self.lock_bucket(key) {
            Some(guard) => {
                guard.mark_dirty(key);
            }
            None => self.defer(key, DeferredOp::MarkDirty { key: key.clone() }),
        }
    }

    /// Peek without caring about contention; used by callers that can fall
    /// back to the slow path.
    pub fn get(&self, key: &RoutingKey) -> Option<Arc<RoutingEntry>> {
        self.lock_bucket(key).and_then(|guard| guard.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::fetch::TableRecord;
    use crate::route::partition::{NodeAddr, NodeReplica, NodeRole};

    fn key(table: &str) -> RoutingKey {
        RoutingKey::new(table, 1, 1)
    }

    fn avail_entry(table: &str, port: u16) -> Arc<RoutingEntry> {
        let entry = RoutingEntry::from_record(
            key(table),
            TableRecord {
                table_id: 42,
                partition_count: 1,
                replicas: vec![NodeReplica {
                    addr: NodeAddr {
                        host: "node1".to_owned(),
                        port,
                    },
                    role: NodeRole::Leader,
                }],
            },
        );
        entry.compare_and_swap_state(EntryState::Building, EntryState::Avail);
        Arc::new(entry)
    }

    #[test]
    fn one_entry_per_key() {
        let cache = RoutingCache::new(4);
        let first = avail_entry("db1.t1", 2881);
        let second = avail_entry("db1.t1", 2882);

        let mut guard = cache.lock_bucket(&key("db1.t1")).expect("uncontended");
        assert_eq!(
            guard.insert_or_replace(Arc::clone(&first), false),
            InsertOutcome::Installed
        );
        // a live Avail occupant is not silently clobbered
        assert_eq!(
            guard.insert_or_replace(Arc::clone(&second), false),
            InsertOutcome::Rejected
        );
        assert!(Arc::ptr_eq(&guard.get(&key("db1.t1")).expect("cached"), &first));

        assert_eq!(
            guard.insert_or_replace(Arc::clone(&second), true),
            InsertOutcome::Replaced
        );
        assert_eq!(guard.len(), 1);
        assert!(Arc::ptr_eq(&guard.get(&key("db1.t1")).expect("cached"), &second));
        // replaced occupant is flagged stale for lingering holders
        assert_eq!(first.state(), EntryState::Dirty);
    }

    #[test]
    fn building_occupant_is_replaceable_without_overwrite() {
        let cache = RoutingCache::new(4);
        let placeholder = Arc::new(RoutingEntry::new_building(key("db1.t1")));
        let resolved = avail_entry("db1.t1", 2881);

        let mut guard = cache.lock_bucket(&key("db1.t1")).expect("uncontended");
        guard.insert_or_replace(placeholder, false);
        assert_eq!(
            guard.insert_or_replace(Arc::clone(&resolved), false),
            InsertOutcome::Replaced
        );
    }

    #[test]
    fn contended_bucket_defers_and_drains() {
        let cache = RoutingCache::new(1);
        let k = key("db1.t1");
        let entry = avail_entry("db1.t1", 2881);

        {
            let _held = cache.lock_bucket(&k).expect("uncontended");
            // bucket lock held: second acquisition must fail, mutations queue
            assert!(cache.lock_bucket(&k).is_none());
            cache.insert_or_replace(Arc::clone(&entry), false);
            cache.mark_dirty(&k);
        }

        // next acquisition drains the queue in order: insert then mark dirty
        let guard = cache.lock_bucket(&k).expect("uncontended");
        let cached = guard.get(&k).expect("deferred insert applied");
        assert!(Arc::ptr_eq(&cached, &entry));
        assert_eq!(cached.state(), EntryState::Dirty);
    }

    #[test]
    fn deferred_remove_applies() {
        let cache = RoutingCache::new(1);
        let k = key("db1.t1");
        cache.insert_or_replace(avail_entry("db1.t1", 2881), false);

        {
            let _held = cache.lock_bucket(&k).expect("uncontended");
            cache.remove(&k);
        }
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn mark_dirty_requires_avail() {
        let cache = RoutingCache::new(4);
        let k = key("db1.t1");
        let placeholder = Arc::new(RoutingEntry::new_building(k.clone()));
        cache.insert_or_replace(placeholder, false);

        let guard = cache.lock_bucket(&k).expect("uncontended");
        assert!(!guard.mark_dirty(&k));
        assert!(!guard.mark_dirty(&key("db1.unknown")));
    }

    #[test]
    fn keys_spread_across_buckets() {
        let cache = RoutingCache::new(8);
        for i in 0..32 {
            cache.insert_or_replace(avail_entry(&format!("db1.t{i}"), 2881), false);
        }
        for i in 0..32 {
            assert!(cache.get(&key(&format!("db1.t{i}"))).is_some());
        }
    }
}
