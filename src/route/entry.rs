//! Shared routing entries and their lifecycle state.
//!
//! Entries are shared as `Arc<RoutingEntry>`: the cache bucket holds one
//! reference, every caller handle one more. All post-publication mutation
//! goes through atomics (state, timestamps); the partition scheme is only
//! written while the building task still owns the entry exclusively.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;

use crate::route::fetch::TableRecord;
use crate::route::key::RoutingKey;
use crate::route::partition::{NodeAddr, NodeReplica, PartitionScheme};

/// Lifecycle state of a cached routing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    /// Placeholder installed while a fetch is in flight for the key.
    Building = 0,
    /// Resolved and servable.
    Avail = 1,
    /// Marked stale by an external signal; next lookup triggers a refresh.
    Dirty = 2,
    /// A refresh for this entry's key is in flight.
    Updating = 3,
}

impl EntryState {
    fn from_u8(v: u8) -> EntryState {
        match v {
            0 => EntryState::Building,
            1 => EntryState::Avail,
            2 => EntryState::Dirty,
            _ => EntryState::Updating,
        }
    }

    /// Legal transition table. Transitions are monotonic within one
    /// generation: a replaced entry starts a new generation as a new value.
    pub fn can_transition(from: EntryState, to: EntryState) -> bool {
        matches!(
            (from, to),
            (EntryState::Building, EntryState::Avail)
                | (EntryState::Avail, EntryState::Dirty)
                | (EntryState::Dirty, EntryState::Updating)
                | (EntryState::Updating, EntryState::Avail)
                | (EntryState::Updating, EntryState::Dirty)
        )
    }
}

/// A caller parked on a building entry, woken once with the resolved result.
/// The send wakes the waiter on whichever worker runtime it is pinned to.
pub type RouteWaiter = oneshot::Sender<Option<Arc<RoutingEntry>>>;

/// Routing metadata for one table identity.
#[derive(Debug)]
pub struct RoutingEntry {
    key: RoutingKey,
    table_id: u64,
    partition_count: u64,
    replicas: Vec<NodeReplica>,
    scheme: Option<Box<PartitionScheme>>,
    state: AtomicU8,
    last_access_ms: AtomicI64,
    last_update_ms: AtomicI64,
    waiters: Mutex<Vec<RouteWaiter>>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl RoutingEntry {
    /// Placeholder installed in the cache while the owning task fetches.
    pub fn new_building(key: RoutingKey) -> Self {
        let now = now_ms();
        Self {
            key,
            table_id: 0,
            partition_count: 0,
            replicas: Vec::new(),
            scheme: None,
            state: AtomicU8::new(EntryState::Building as u8),
            last_access_ms: AtomicI64::new(now),
            last_update_ms: AtomicI64::new(now),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Entry built from a table-entry fetch. Stays `Building` until the
    /// owning task publishes it.
    pub fn from_record(key: RoutingKey, record: TableRecord) -> Self {
        let mut entry = Self::new_building(key);
        entry.table_id = record.table_id;
        entry.partition_count = record.partition_count;
        entry.replicas = record.replicas;
        entry
    }

    pub fn key(&self) -> &RoutingKey {
        &self.key
    }

    pub fn table_id(&self) -> u64 {
        self.table_id
    }

    pub fn partition_count(&self) -> u64 {
        self.partition_count
    }

    pub fn is_partitioned(&self) -> bool {
        self.partition_count > 1
    }

    pub fn replicas(&self) -> &[NodeReplica] {
        &self.replicas
    }

    pub fn leader(&self) -> Option<&NodeAddr> {
        self.replicas.iter().find(|r| r.is_leader()).map(|r| &r.addr)
    }

    // --- lifecycle state ---

    pub fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomic state transition. Returns false (without effect) if the current
    /// state is not `expected` or the transition is not a legal one, so a task
    /// completing a fetch and an external staleness signal cannot race each
    /// other into an inconsistent state.
    pub fn compare_and_swap_state(&self, expected: EntryState, new: EntryState) -> bool {
        if !EntryState::can_transition(expected, new) {
            return false;
        }
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // --- timestamps ---

    pub fn touch_access(&self) {
        self.last_access_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn touch_update(&self) {
        self.last_update_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_access_ms(&self) -> i64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    pub fn last_update_ms(&self) -> i64 {
        self.last_update_ms.load(Ordering::Relaxed)
    }

    // --- partition scheme ---

    /// `None` until [`Self::allocate_partition_scheme`] has run; callers must
    /// treat that as "partition routing not available", never as an error to
    /// escalate.
    pub fn partition_scheme(&self) -> Option<&PartitionScheme> {
        self.scheme.as_deref()
    }

    /// Idempotent; only callable while the entry is still exclusively owned
    /// by its building task.
    pub fn allocate_partition_scheme(&mut self) -> &mut PartitionScheme {
        self.scheme.get_or_insert_default()
    }

    // --- validity ---

    /// Entry carries table-level locations only through its partitions.
    pub fn is_scheme_only(&self) -> bool {
        self.table_id != 0 && self.replicas.is_empty() && self.partition_count > 0
    }

    /// Fully resolved: a known table, at least one serving node, and every
    /// partition level the lookup chain was expected to fetch present.
    pub fn is_fully_valid(&self) -> bool {
        self.table_id != 0
            && !self.replicas.is_empty()
            && self.scheme.as_deref().is_none_or(PartitionScheme::is_complete)
    }

    /// Same routing outcome as `other`; used to skip churn when a refresh
    /// returns unchanged metadata.
    pub fn same_routing(&self, other: &RoutingEntry) -> bool {
        self.key == other.key
            && self.table_id == other.table_id
            && self.partition_count == other.partition_count
            && self.replicas == other.replicas
            && self.scheme == other.scheme
    }

    // --- pending waiters ---

    pub fn push_waiter(&self, waiter: RouteWaiter) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(waiter);
    }

    /// Take every parked waiter. Called exactly once, by the owning task,
    /// after the placeholder has been unlinked from the cache.
    pub fn drain_waiters(&self) -> Vec<RouteWaiter> {
        std::mem::take(&mut *self.waiters.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
