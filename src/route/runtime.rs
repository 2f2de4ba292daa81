//! Worker threads and the cross-thread resolution pool.
//!
//! Each worker owns a current-thread runtime, one metadata connection, and a
//! [`Router`] pinned to its `LocalSet`. Requests arrive over an mpsc channel
//! and are answered on per-request oneshot channels, so a resolution wakes
//! its caller on whatever runtime the caller lives on.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{spawn_local, LocalSet};
use tracing::{debug, info};

use crate::route::cache::RoutingCache;
use crate::route::entry::RoutingEntry;
use crate::route::fetch::{MetadataFetch, PgMetadataFetch};
use crate::route::router::{RouteParams, Router};
use crate::route::{RouteResult, TaskError, WorkerError};
use crate::settings::MetadataSettings;

/// Depth of each worker's request queue.
pub const WORKER_QUEUE_DEPTH: usize = 64;

/// One resolution request crossing a worker boundary.
pub struct ResolveRequest {
    pub params: RouteParams,
    pub reply_tx: oneshot::Sender<RouteResult<Option<Arc<RoutingEntry>>>>,
}

pub fn request_channel() -> (mpsc::Sender<ResolveRequest>, mpsc::Receiver<ResolveRequest>) {
    mpsc::channel(WORKER_QUEUE_DEPTH)
}

/// Serve requests until every sender is gone. Each request runs as its own
/// local task so one slow fetch never blocks the queue behind it.
pub async fn serve<F: MetadataFetch + 'static>(
    router: Rc<Router<F>>,
    mut requests: mpsc::Receiver<ResolveRequest>,
) {
    while let Some(request) = requests.recv().await {
        let router = Rc::clone(&router);
        spawn_local(async move {
            let result = router.resolve(request.params).await;
            if request.reply_tx.send(result).is_err() {
                // caller went away before the answer did
                debug!("resolution reply dropped");
            }
        });
    }
}

/// Body of one routing worker thread. Returns when the request channel
/// closes or the metadata connection cannot be established.
pub fn worker_run(
    worker_id: usize,
    settings: &MetadataSettings,
    cache: Arc<RoutingCache>,
    requests: mpsc::Receiver<ResolveRequest>,
) -> Result<(), WorkerError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();

    local.block_on(&runtime, async {
        let fetch = PgMetadataFetch::connect(settings)
            .await
            .map_err(WorkerError::Connect)?;
        info!(worker_id, "routing worker connected to metadata service");
        let router = Rc::new(Router::new(cache, Rc::new(fetch)));
        serve(router, requests).await;
        info!(worker_id, "routing worker shutting down");
        Ok(())
    })
}

/// Cross-thread handle over the worker set. Requests for one key always land
/// on the same worker, so its hot table stays effective.
#[derive(Clone)]
pub struct RouterPool {
    workers: Vec<mpsc::Sender<ResolveRequest>>,
}

impl RouterPool {
    pub fn new(workers: Vec<mpsc::Sender<ResolveRequest>>) -> Self {
        Self { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub async fn resolve(&self, params: RouteParams) -> RouteResult<Option<Arc<RoutingEntry>>> {
        if self.workers.is_empty() {
            return Err(WorkerError::NoWorker.into());
        }
        let mut hasher = DefaultHasher::new();
        params.key.hash(&mut hasher);
        let worker = &self.workers[(hasher.finish() as usize) % self.workers.len()];

        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .send(ResolveRequest { params, reply_tx })
            .await
            .map_err(|_| WorkerError::NoWorker)?;
        reply_rx.await.map_err(|_| TaskError::TaskGone)?
    }
}
