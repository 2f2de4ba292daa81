//! Request-facing resolution front end.
//!
//! A `Router` is pinned to one worker runtime. `resolve` classifies the
//! request against the shared cache under the bucket try-lock, then either
//! returns the cached entry, parks on an in-flight fetch, or spawns a
//! detached [`ResolutionTask`] of its own.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::spawn_local;
use tokio::time::sleep;
use tracing::{debug, instrument, trace};

use crate::metrics::names;
use crate::route::cache::RoutingCache;
use crate::route::entry::{EntryState, RoutingEntry};
use crate::route::fetch::MetadataFetch;
use crate::route::key::RoutingKey;
use crate::route::task::{FetchMode, ResolutionTask, LOCK_RETRY_INTERVAL};
use crate::route::{RouteResult, TaskError};

/// One resolution request.
#[derive(Debug, Clone)]
pub struct RouteParams {
    pub key: RoutingKey,
    /// Caller wants per-partition locations, not just the table-level ones.
    pub need_partition_routing: bool,
    /// Bypass the cache and re-fetch even when an available entry exists.
    pub force_renew: bool,
}

impl RouteParams {
    pub fn new(key: RoutingKey) -> Self {
        Self {
            key,
            need_partition_routing: false,
            force_renew: false,
        }
    }
}

enum Classified {
    /// Servable entry found in the cache.
    Hit(Arc<RoutingEntry>),
    /// Another task is already fetching this key; wait for its result.
    Pending(oneshot::Receiver<Option<Arc<RoutingEntry>>>),
    /// This request runs its own fetch chain.
    Launch {
        mode: FetchMode,
        old_entry: Option<Arc<RoutingEntry>>,
    },
}

/// Per-worker resolution handle over the shared cache.
pub struct Router<F> {
    cache: Arc<RoutingCache>,
    fetch: Rc<F>,
    /// Worker-local fast path for repeatedly hit keys. Non-authoritative:
    /// only `Avail` entries are served from it, anything else is evicted and
    /// the shared cache consulted.
    hot: RefCell<HashMap<RoutingKey, Arc<RoutingEntry>>>,
}

impl<F: MetadataFetch + 'static> Router<F> {
    pub fn new(cache: Arc<RoutingCache>, fetch: Rc<F>) -> Self {
        Self {
            cache,
            fetch,
            hot: RefCell::new(HashMap::new()),
        }
    }

    /// Resolve a table identity to its routing entry. `Ok(None)` means the
    /// table does not exist or resolution failed; the caller falls back to
    /// its default route either way.
    #[instrument(skip(self), fields(key = %params.key))]
    pub async fn resolve(&self, params: RouteParams) -> RouteResult<Option<Arc<RoutingEntry>>> {
        params.key.validate()?;
        counter!(names::RESOLVE_TOTAL).increment(1);

        if !params.force_renew {
            if let Some(entry) = self.hot_lookup(&params.key) {
                counter!(names::RESOLVE_HOT_HIT).increment(1);
                entry.touch_access();
                return Ok(Some(entry));
            }
        }

        let resolved = match self.classify(&params).await {
            Classified::Hit(entry) => {
                counter!(names::RESOLVE_CACHE_HIT).increment(1);
                Some(entry)
            }
            Classified::Pending(rx) => {
                trace!(key = %params.key, "parked on in-flight fetch");
                rx.await.map_err(|_| TaskError::TaskGone)?
            }
            Classified::Launch { mode, old_entry } => {
                counter!(names::RESOLVE_CACHE_MISS).increment(1);
                debug!(key = %params.key, ?mode, "starting resolution task");
                let task = ResolutionTask::new(
                    params.clone(),
                    mode,
                    Arc::clone(&self.cache),
                    Rc::clone(&self.fetch),
                    old_entry,
                );
                // detached: dropping this future mid-await leaves the task
                // running, so the placeholder is always cleaned up
                spawn_local(task.run())
                    .await
                    .map_err(|_| TaskError::TaskGone)?
            }
        };

        if let Some(entry) = &resolved {
            entry.touch_access();
            if entry.state() == EntryState::Avail {
                self.hot
                    .borrow_mut()
                    .insert(params.key.clone(), Arc::clone(entry));
            }
        }
        Ok(resolved)
    }

    /// Flag a cached entry stale, e.g. after a routed statement came back
    /// redirected. The next resolve for the key refreshes it.
    pub fn mark_dirty(&self, key: &RoutingKey) {
        self.cache.mark_dirty(key);
    }

    /// Drop the worker-local fast path, e.g. on a cluster-wide flush signal.
    pub fn hot_flush(&self) {
        self.hot.borrow_mut().clear();
    }

    fn hot_lookup(&self, key: &RoutingKey) -> Option<Arc<RoutingEntry>> {
        let mut hot = self.hot.borrow_mut();
        match hot.get(key) {
            Some(entry) if entry.state() == EntryState::Avail => Some(Arc::clone(entry)),
            Some(_) => {
                // entry went dirty or was replaced; fall through to the
                // shared cache
                hot.remove(key);
                None
            }
            None => None,
        }
    }

    /// Decide how this request interacts with the cache. Runs under the
    /// bucket lock; retries on a timer while the bucket is contended.
    async fn classify(&self, params: &RouteParams) -> Classified {
        loop {
            let Some(mut guard) = self.cache.lock_bucket(&params.key) else {
                counter!(names::BUCKET_LOCK_RETRY).increment(1);
                sleep(LOCK_RETRY_INTERVAL).await;
                continue;
            };

            let Some(entry) = guard.get(&params.key) else {
                // install the placeholder before releasing the lock so every
                // concurrent request for the key coalesces onto this task
                let placeholder = Arc::new(RoutingEntry::new_building(params.key.clone()));
                guard.insert_or_replace(Arc::clone(&placeholder), false);
                return Classified::Launch {
                    mode: FetchMode::WithBuildingEntry,
                    old_entry: Some(placeholder),
                };
            };

            return match entry.state() {
                EntryState::Building => {
                    let (tx, rx) = oneshot::channel();
                    entry.push_waiter(tx);
                    Classified::Pending(rx)
                }
                EntryState::Avail if params.force_renew => Classified::Launch {
                    mode: FetchMode::Direct,
                    old_entry: None,
                },
                EntryState::Avail => Classified::Hit(entry),
                EntryState::Updating => {
                    // refresh in flight; serve the stale entry rather than
                    // stall the request
                    counter!(names::RESOLVE_STALE_SERVED).increment(1);
                    Classified::Hit(entry)
                }
                EntryState::Dirty => {
                    if entry.compare_and_swap_state(EntryState::Dirty, EntryState::Updating) {
                        Classified::Launch {
                            mode: FetchMode::ForUpdate,
                            old_entry: Some(entry),
                        }
                    } else {
                        // lost the race; whoever won is refreshing it
                        counter!(names::RESOLVE_STALE_SERVED).increment(1);
                        Classified::Hit(entry)
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use tokio::task::LocalSet;

    use super::*;
    use crate::route::fetch::{SchemeRecord, TableRecord};
    use crate::route::partition::{NodeAddr, NodeReplica, NodeRole, PartitionRoute};
    use crate::route::{FetchError, FetchResult, RouteError};

    struct StaticFetch {
        record: Option<TableRecord>,
        calls: Cell<u32>,
        fail: Cell<bool>,
    }

    impl StaticFetch {
        fn with_record(record: TableRecord) -> Self {
            Self {
                record: Some(record),
                calls: Cell::new(0),
                fail: Cell::new(false),
            }
        }
    }

    impl MetadataFetch for StaticFetch {
        async fn table_entry(
            &self,
            _key: &RoutingKey,
            _force_refresh: bool,
        ) -> FetchResult<Option<TableRecord>> {
            self.calls.set(self.calls.get() + 1);
            if self.fail.get() {
                return Err(FetchError::Unavailable);
            }
            Ok(self.record.clone())
        }

        async fn partition_scheme(&self, _table_id: u64) -> FetchResult<SchemeRecord> {
            Err(FetchError::Unavailable)
        }

        async fn first_partitions(
            &self,
            _table_id: u64,
            _by_hash: bool,
        ) -> FetchResult<Vec<PartitionRoute>> {
            Err(FetchError::Unavailable)
        }

        async fn sub_partitions(
            &self,
            _table_id: u64,
            _templated: bool,
        ) -> FetchResult<Vec<PartitionRoute>> {
            Err(FetchError::Unavailable)
        }
    }

    fn record() -> TableRecord {
        TableRecord {
            table_id: 500001,
            partition_count: 1,
            replicas: vec![NodeReplica {
                addr: NodeAddr {
                    host: "node1".to_owned(),
                    port: 2881,
                },
                role: NodeRole::Leader,
            }],
        }
    }

    fn router(fetch: StaticFetch) -> Router<StaticFetch> {
        Router::new(Arc::new(RoutingCache::new(4)), Rc::new(fetch))
    }

    #[tokio::test]
    async fn miss_fills_then_hits_without_refetch() {
        let router = router(StaticFetch::with_record(record()));
        LocalSet::new()
            .run_until(async {
                let params = RouteParams::new(RoutingKey::new("db1.t1", 1, 1));
                let first = router.resolve(params.clone()).await.unwrap().unwrap();
                assert_eq!(first.state(), EntryState::Avail);
                assert_eq!(first.leader().unwrap().port, 2881);

                let second = router.resolve(params).await.unwrap().unwrap();
                assert!(Arc::ptr_eq(&first, &second));
                assert_eq!(router.fetch.calls.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn failed_fetch_yields_none_and_no_cache_entry() {
        let router = router(StaticFetch::with_record(record()));
        router.fetch.fail.set(true);
        LocalSet::new()
            .run_until(async {
                let params = RouteParams::new(RoutingKey::new("db1.t1", 1, 1));
                assert!(router.resolve(params.clone()).await.unwrap().is_none());
                // placeholder was removed, a retry fetches again
                router.fetch.fail.set(false);
                assert!(router.resolve(params).await.unwrap().is_some());
                assert_eq!(router.fetch.calls.get(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn invalid_key_is_rejected_before_any_fetch() {
        let router = router(StaticFetch::with_record(record()));
        LocalSet::new()
            .run_until(async {
                let params = RouteParams::new(RoutingKey::new("", 1, 1));
                let err = router.resolve(params).await.unwrap_err();
                assert!(matches!(err, RouteError::MissingField { .. }));
                assert_eq!(router.fetch.calls.get(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn force_renew_refetches_over_available_entry() {
        let router = router(StaticFetch::with_record(record()));
        LocalSet::new()
            .run_until(async {
                let key = RoutingKey::new("db1.t1", 1, 1);
                router
                    .resolve(RouteParams::new(key.clone()))
                    .await
                    .unwrap();
                let mut params = RouteParams::new(key);
                params.force_renew = true;
                router.resolve(params).await.unwrap();
                assert_eq!(router.fetch.calls.get(), 2);
            })
            .await;
    }
}
