//! Per-request resolution state machine.
//!
//! A task walks `LookupEntry -> LookupPartScheme -> LookupFirstPart ->
//! LookupSubPart -> Done`, issuing exactly one remote fetch per non-Done
//! stage. A fetch error collapses the chain straight to `Done`; the partial
//! entry is then judged and either installed or discarded, never retried
//! within the same task. The task runs detached on its worker's `LocalSet`,
//! so a cancelled caller never leaves a building placeholder behind.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use error_set::error_set;
use metrics::counter;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::metrics::names;
use crate::route::cache::{InsertOutcome, RoutingCache};
use crate::route::entry::{EntryState, RoutingEntry};
use crate::route::fetch::MetadataFetch;
use crate::route::router::RouteParams;
use crate::route::FetchError;

/// Interval before re-attempting a contended bucket lock.
pub(crate) const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Lookup chain position. Each stage issues one remote fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStage {
    Entry,
    PartScheme,
    FirstPart,
    SubPart,
    Done,
}

/// How the task interacts with the cache, fixed at classification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// No contention found; install the result unconditionally on success.
    Direct,
    /// Refreshing a dirty entry; the old entry is retained until the new
    /// result is known.
    ForUpdate,
    /// This task installed the building placeholder and owes every coalesced
    /// waiter a wakeup.
    WithBuildingEntry,
}

error_set! {
    StageError = {
        Fetch(FetchError),
        #[display("invariant violated: {reason}")]
        Invariant { reason: &'static str },
    };
}

/// Stage transition function. Pure so the chain shape is testable without a
/// fetch client.
pub fn next_stage(
    stage: LookupStage,
    entry: Option<&RoutingEntry>,
    need_partition_routing: bool,
) -> LookupStage {
    match stage {
        LookupStage::Entry => match entry {
            Some(e) if e.is_partitioned() && need_partition_routing => LookupStage::PartScheme,
            _ => LookupStage::Done,
        },
        LookupStage::PartScheme => {
            let Some(scheme) = entry.and_then(RoutingEntry::partition_scheme) else {
                return LookupStage::Done;
            };
            if !scheme.part_key_known {
                LookupStage::Done
            } else if scheme.first_kind.is_some() {
                LookupStage::FirstPart
            } else {
                LookupStage::Done
            }
        }
        LookupStage::FirstPart => match entry.and_then(RoutingEntry::partition_scheme) {
            Some(scheme) if scheme.sub_fetch_required() => LookupStage::SubPart,
            _ => LookupStage::Done,
        },
        LookupStage::SubPart | LookupStage::Done => LookupStage::Done,
    }
}

pub(crate) struct ResolutionTask<F> {
    params: RouteParams,
    mode: FetchMode,
    cache: Arc<RoutingCache>,
    fetch: Rc<F>,
    /// The dirty entry being refreshed (`ForUpdate`) or the building
    /// placeholder this task installed (`WithBuildingEntry`).
    old_entry: Option<Arc<RoutingEntry>>,
    /// Result under construction; exclusively owned until publication.
    newest: Option<RoutingEntry>,
    stage: LookupStage,
}

impl<F: MetadataFetch> ResolutionTask<F> {
    pub fn new(
        params: RouteParams,
        mode: FetchMode,
        cache: Arc<RoutingCache>,
        fetch: Rc<F>,
        old_entry: Option<Arc<RoutingEntry>>,
    ) -> Self {
        Self {
            params,
            mode,
            cache,
            fetch,
            old_entry,
            newest: None,
            stage: LookupStage::Entry,
        }
    }

    /// Drive the chain to `Done` and complete per the task's mode. Always
    /// runs to the end, even when the originating caller has cancelled.
    pub async fn run(mut self) -> Option<Arc<RoutingEntry>> {
        while self.stage != LookupStage::Done {
            let stage = self.stage;
            match self.run_stage().await {
                Ok(()) => {}
                Err(StageError::Fetch(e)) => {
                    warn!(key = %self.params.key, ?stage, "remote fetch failed: {e}");
                    stage_failure_metric(stage);
                    self.stage = LookupStage::Done;
                }
                Err(StageError::Invariant { reason }) => {
                    error!(key = %self.params.key, ?stage, "resolution degraded: {reason}");
                    counter!(names::RESOLVE_INVARIANT_VIOLATION).increment(1);
                    self.newest = None;
                    self.stage = LookupStage::Done;
                }
            }
        }
        self.finish().await
    }

    async fn run_stage(&mut self) -> Result<(), StageError> {
        match self.stage {
            LookupStage::Entry => self.fetch_entry().await?,
            LookupStage::PartScheme => self.fetch_scheme().await?,
            LookupStage::FirstPart => self.fetch_first_parts().await?,
            LookupStage::SubPart => self.fetch_sub_parts().await?,
            LookupStage::Done => {
                return Err(StageError::Invariant {
                    reason: "stage driver ran past Done",
                });
            }
        }
        let next = next_stage(
            self.stage,
            self.newest.as_ref(),
            self.params.need_partition_routing,
        );
        debug!(key = %self.params.key, from = ?self.stage, to = ?next, "lookup stage advance");
        self.stage = next;
        Ok(())
    }

    async fn fetch_entry(&mut self) -> Result<(), StageError> {
        let record = self
            .fetch
            .table_entry(&self.params.key, self.params.force_renew)
            .await?;
        match record {
            None => {
                // distinct from a fetch failure: the catalog answered, the
                // table simply does not exist
                counter!(names::FETCH_ENTRY_MISSING).increment(1);
                info!(key = %self.params.key, "table not found in routing catalog");
                self.newest = None;
            }
            Some(record) => {
                counter!(names::FETCH_ENTRY_OK).increment(1);
                self.newest = Some(RoutingEntry::from_record(self.params.key.clone(), record));
            }
        }
        Ok(())
    }

    async fn fetch_scheme(&mut self) -> Result<(), StageError> {
        let table_id = self.newest_table_id()?;
        let record = self.fetch.partition_scheme(table_id).await?;
        counter!(names::FETCH_SCHEME_OK).increment(1);

        let entry = self.newest_mut()?;
        let scheme = entry.allocate_partition_scheme();
        scheme.templated = record.templated;
        scheme.part_key_known = record.part_key_known;
        scheme.first_kind = record.first_kind;
        scheme.sub_kind = record.sub_kind;
        Ok(())
    }

    async fn fetch_first_parts(&mut self) -> Result<(), StageError> {
        let table_id = self.newest_table_id()?;
        let by_hash = self
            .newest_scheme()?
            .first_kind
            .is_some_and(|k| k.is_hash_like());
        let parts = self.fetch.first_partitions(table_id, by_hash).await?;
        counter!(names::FETCH_FIRST_PART_OK).increment(1);
        self.newest_mut()?.allocate_partition_scheme().first_parts = Some(parts);
        Ok(())
    }

    async fn fetch_sub_parts(&mut self) -> Result<(), StageError> {
        let table_id = self.newest_table_id()?;
        let templated = self.newest_scheme()?.templated;
        let parts = self.fetch.sub_partitions(table_id, templated).await?;
        counter!(names::FETCH_SUB_PART_OK).increment(1);
        self.newest_mut()?.allocate_partition_scheme().sub_parts = Some(parts);
        Ok(())
    }

    fn newest_mut(&mut self) -> Result<&mut RoutingEntry, StageError> {
        self.newest.as_mut().ok_or(StageError::Invariant {
            reason: "entry missing mid-chain",
        })
    }

    fn newest_table_id(&self) -> Result<u64, StageError> {
        self.newest
            .as_ref()
            .map(RoutingEntry::table_id)
            .ok_or(StageError::Invariant {
                reason: "entry missing mid-chain",
            })
    }

    fn newest_scheme(&self) -> Result<&crate::route::partition::PartitionScheme, StageError> {
        self.newest
            .as_ref()
            .and_then(RoutingEntry::partition_scheme)
            .ok_or(StageError::Invariant {
                reason: "partition scheme missing mid-chain",
            })
    }

    /// Accept the built entry only if it is fully valid, or scheme-only while
    /// the caller does not require partition routing.
    fn judge(&self, entry: &RoutingEntry) -> bool {
        entry.is_fully_valid()
            || (entry.is_scheme_only() && !self.params.need_partition_routing)
    }

    async fn finish(mut self) -> Option<Arc<RoutingEntry>> {
        let resolved = match self.newest.take() {
            Some(entry) if self.judge(&entry) => Some(self.publish(entry)),
            Some(entry) => {
                info!(key = %self.params.key, table_id = entry.table_id(),
                    "discarding incomplete routing entry");
                counter!(names::RESOLVE_DISCARDED).increment(1);
                None
            }
            None => None,
        };

        match self.mode {
            FetchMode::Direct => {
                if let Some(entry) = &resolved {
                    self.install(Arc::clone(entry), true).await;
                }
                resolved
            }
            FetchMode::ForUpdate => self.finish_for_update(resolved).await,
            FetchMode::WithBuildingEntry => self.finish_with_building(resolved).await,
        }
    }

    fn publish(&self, entry: RoutingEntry) -> Arc<RoutingEntry> {
        if !entry.is_partitioned() && entry.leader().is_none() {
            // leaderless non-partitioned entry: refresh the update stamp so
            // it is not immediately re-fetched
            entry.touch_update();
            info!(key = %self.params.key, "entry resolved without a live leader");
        }
        entry.compare_and_swap_state(EntryState::Building, EntryState::Avail);
        Arc::new(entry)
    }

    async fn install(&self, entry: Arc<RoutingEntry>, allow_overwrite: bool) -> InsertOutcome {
        loop {
            match self.cache.lock_bucket(&self.params.key) {
                Some(mut guard) => return guard.insert_or_replace(entry, allow_overwrite),
                None => {
                    counter!(names::BUCKET_LOCK_RETRY).increment(1);
                    sleep(LOCK_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn finish_for_update(
        &mut self,
        resolved: Option<Arc<RoutingEntry>>,
    ) -> Option<Arc<RoutingEntry>> {
        let Some(old) = self.old_entry.take() else {
            error!(key = %self.params.key, "update task lost its dirty entry");
            return resolved;
        };

        match resolved {
            None => {
                // roll the old entry back so a later lookup retries; leaving
                // it in Updating would mean it is never refreshed again
                old.touch_update();
                if old.compare_and_swap_state(EntryState::Updating, EntryState::Dirty) {
                    counter!(names::RESOLVE_DIRTY_ROLLBACK).increment(1);
                    info!(key = %self.params.key, "refresh failed, entry set back to dirty");
                }
                None
            }
            Some(new) => {
                if old.same_routing(&new) {
                    // unchanged metadata: keep the old entry, refresh stamps
                    old.compare_and_swap_state(EntryState::Updating, EntryState::Avail);
                    old.touch_update();
                    debug!(key = %self.params.key, "refresh returned identical routing");
                    Some(old)
                } else {
                    if old.leader() != new.leader() {
                        info!(key = %self.params.key, old = ?old.leader(), new = ?new.leader(),
                            "table leader changed");
                    }
                    self.install(Arc::clone(&new), true).await;
                    // unlinked; lingering holders observe it as stale
                    old.compare_and_swap_state(EntryState::Updating, EntryState::Dirty);
                    Some(new)
                }
            }
        }
    }

    async fn finish_with_building(
        &mut self,
        resolved: Option<Arc<RoutingEntry>>,
    ) -> Option<Arc<RoutingEntry>> {
        let Some(placeholder) = self.old_entry.take() else {
            error!(key = %self.params.key, "building task lost its placeholder");
            return resolved;
        };

        // swap the placeholder out under the bucket lock; once it is
        // unreachable no new waiter can join it
        loop {
            match self.cache.lock_bucket(&self.params.key) {
                Some(mut guard) => {
                    match &resolved {
                        Some(entry) => {
                            let outcome = guard.insert_or_replace(Arc::clone(entry), false);
                            if outcome == InsertOutcome::Rejected {
                                error!(key = %self.params.key,
                                    "available entry appeared under a building key");
                            }
                        }
                        None => {
                            // failed fetch: remove the placeholder so the
                            // next request starts a fresh attempt
                            guard.remove(&self.params.key);
                        }
                    }
                    break;
                }
                None => {
                    counter!(names::BUCKET_LOCK_RETRY).increment(1);
                    sleep(LOCK_RETRY_INTERVAL).await;
                }
            }
        }

        // single drain: every coalesced request gets its own reference and
        // wakes on its own worker runtime
        let waiters = placeholder.drain_waiters();
        if !waiters.is_empty() {
            counter!(names::RESOLVE_COALESCED).increment(waiters.len() as u64);
            debug!(key = %self.params.key, waiters = waiters.len(), "waking coalesced waiters");
        }
        for waiter in waiters {
            if waiter.send(resolved.clone()).is_err() {
                debug!(key = %self.params.key, "coalesced waiter cancelled");
            }
        }

        resolved
    }
}

fn stage_failure_metric(stage: LookupStage) {
    let name = match stage {
        LookupStage::Entry => names::FETCH_ENTRY_FAIL,
        LookupStage::PartScheme => names::FETCH_SCHEME_FAIL,
        LookupStage::FirstPart => names::FETCH_FIRST_PART_FAIL,
        LookupStage::SubPart => names::FETCH_SUB_PART_FAIL,
        LookupStage::Done => return,
    };
    counter!(name).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::fetch::TableRecord;
    use crate::route::key::RoutingKey;
    use crate::route::partition::{NodeAddr, NodeReplica, NodeRole, PartitionKind};

    fn entry(partitions: u64) -> RoutingEntry {
        RoutingEntry::from_record(
            RoutingKey::new("db1.t1", 1, 1),
            TableRecord {
                table_id: 500001,
                partition_count: partitions,
                replicas: vec![NodeReplica {
                    addr: NodeAddr {
                        host: "node1".to_owned(),
                        port: 2881,
                    },
                    role: NodeRole::Leader,
                }],
            },
        )
    }

    fn walk(entry: Option<&RoutingEntry>, need_partition_routing: bool) -> Vec<LookupStage> {
        let mut stage = LookupStage::Entry;
        let mut visited = vec![stage];
        while stage != LookupStage::Done {
            stage = next_stage(stage, entry, need_partition_routing);
            visited.push(stage);
        }
        visited
    }

    #[test]
    fn absent_entry_goes_straight_to_done() {
        assert_eq!(walk(None, true), vec![LookupStage::Entry, LookupStage::Done]);
    }

    #[test]
    fn non_partitioned_entry_skips_partition_stages() {
        let e = entry(1);
        assert_eq!(
            walk(Some(&e), true),
            vec![LookupStage::Entry, LookupStage::Done]
        );
    }

    #[test]
    fn partitioned_entry_without_routing_support_stops_early() {
        let e = entry(8);
        assert_eq!(
            walk(Some(&e), false),
            vec![LookupStage::Entry, LookupStage::Done]
        );
    }

    #[test]
    fn unknown_part_key_stops_after_scheme() {
        let mut e = entry(8);
        let scheme = e.allocate_partition_scheme();
        scheme.part_key_known = false;
        scheme.first_kind = Some(PartitionKind::Hash);
        assert_eq!(
            walk(Some(&e), true),
            vec![
                LookupStage::Entry,
                LookupStage::PartScheme,
                LookupStage::Done
            ]
        );
    }

    #[test]
    fn templated_hash_table_skips_sub_parts() {
        // hash-partitioned, templated, no range/list sub level
        let mut e = entry(8);
        let scheme = e.allocate_partition_scheme();
        scheme.part_key_known = true;
        scheme.templated = true;
        scheme.first_kind = Some(PartitionKind::Hash);
        scheme.sub_kind = None;
        assert_eq!(
            walk(Some(&e), true),
            vec![
                LookupStage::Entry,
                LookupStage::PartScheme,
                LookupStage::FirstPart,
                LookupStage::Done
            ]
        );
    }

    #[test]
    fn range_sub_partitioned_table_walks_all_stages() {
        let mut e = entry(8);
        let scheme = e.allocate_partition_scheme();
        scheme.part_key_known = true;
        scheme.templated = true;
        scheme.first_kind = Some(PartitionKind::Hash);
        scheme.sub_kind = Some(PartitionKind::Range);
        assert_eq!(
            walk(Some(&e), true),
            vec![
                LookupStage::Entry,
                LookupStage::PartScheme,
                LookupStage::FirstPart,
                LookupStage::SubPart,
                LookupStage::Done
            ]
        );
    }

    #[test]
    fn every_chain_terminates_within_four_transitions() {
        // no state revisited, Done within <= 4 transitions, from any shape
        let shapes: Vec<Option<RoutingEntry>> = vec![
            None,
            Some(entry(1)),
            Some(entry(8)),
            Some({
                let mut e = entry(8);
                let s = e.allocate_partition_scheme();
                s.part_key_known = true;
                s.first_kind = Some(PartitionKind::Range);
                s.sub_kind = Some(PartitionKind::List);
                e
            }),
        ];
        for shape in &shapes {
            for need in [false, true] {
                let visited = walk(shape.as_ref(), need);
                assert!(visited.len() <= 5, "{visited:?}");
                let mut dedup = visited.clone();
                dedup.dedup();
                assert_eq!(dedup, visited, "stage revisited: {visited:?}");
            }
        }
    }
}
