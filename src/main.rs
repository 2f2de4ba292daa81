use std::error::Error;
use std::sync::Arc;
use std::thread;

use tableroute_lib::metrics::prometheus_install;
use tableroute_lib::route::runtime::{request_channel, worker_run};
use tableroute_lib::route::{RouteParams, RouterPool, RoutingCache, RoutingKey};
use tableroute_lib::settings::Settings;
use tableroute_lib::tracing_utils::WorkerFormatter;

use tracing::{error, info, Level};

fn main() -> Result<(), Box<dyn Error>> {
    let settings = Settings::from_args()?;

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .event_format(WorkerFormatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    prometheus_install(settings.metrics_socket)?;

    let cache = Arc::new(RoutingCache::new(settings.cache_buckets));

    thread::scope(|scope| -> Result<(), Box<dyn Error>> {
        let mut senders = Vec::with_capacity(settings.num_workers);
        for worker_id in 0..settings.num_workers {
            let (tx, rx) = request_channel();
            senders.push(tx);
            let cache = Arc::clone(&cache);
            let metadata = &settings.metadata;
            thread::Builder::new()
                .name(format!("route-{worker_id}"))
                .spawn_scoped(scope, move || {
                    if let Err(e) = worker_run(worker_id, metadata, cache, rx) {
                        error!(worker_id, "routing worker failed: {e}");
                    }
                })?;
        }
        let pool = RouterPool::new(senders);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            for table in &settings.tables {
                let key = RoutingKey::new(
                    table.clone(),
                    settings.schema_version,
                    settings.cluster_id,
                );
                let mut params = RouteParams::new(key.clone());
                params.need_partition_routing = true;
                match pool.resolve(params).await {
                    Ok(Some(entry)) => {
                        info!(
                            %key,
                            table_id = entry.table_id(),
                            partitions = entry.partition_count(),
                            leader = ?entry.leader(),
                            "resolved"
                        );
                    }
                    Ok(None) => info!(%key, "no route available"),
                    Err(e) => error!(%key, "resolve failed: {e}"),
                }
            }
        });

        // dropping the pool closes the worker channels and the scope joins
        // every worker on the way out
        drop(pool);
        Ok(())
    })?;

    Ok(())
}
