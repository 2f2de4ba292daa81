use std::net::SocketAddr;
use std::sync::mpsc;

use error_set::error_set;
use metrics_exporter_prometheus::PrometheusBuilder;

error_set! {
    MetricsError = {
        #[display("metrics thread failed to start")]
        ThreadStart,
        #[display("{msg}")]
        Build { msg: String },
        #[display("global metrics recorder already installed")]
        RecorderInstall,
    };
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Metric names as constants for consistency
pub mod names {
    // Resolution outcomes
    pub const RESOLVE_TOTAL: &str = "tableroute.resolve.total";
    pub const RESOLVE_CACHE_HIT: &str = "tableroute.resolve.cache_hit";
    pub const RESOLVE_CACHE_MISS: &str = "tableroute.resolve.cache_miss";
    pub const RESOLVE_HOT_HIT: &str = "tableroute.resolve.hot_hit";
    pub const RESOLVE_STALE_SERVED: &str = "tableroute.resolve.stale_served";
    pub const RESOLVE_COALESCED: &str = "tableroute.resolve.coalesced_waiters";
    pub const RESOLVE_DISCARDED: &str = "tableroute.resolve.discarded";
    pub const RESOLVE_DIRTY_ROLLBACK: &str = "tableroute.resolve.dirty_rollback";
    pub const RESOLVE_INVARIANT_VIOLATION: &str = "tableroute.resolve.invariant_violation";

    // Per-stage fetch outcomes
    pub const FETCH_ENTRY_OK: &str = "tableroute.fetch.entry_ok";
    pub const FETCH_ENTRY_FAIL: &str = "tableroute.fetch.entry_fail";
    pub const FETCH_ENTRY_MISSING: &str = "tableroute.fetch.entry_missing";
    pub const FETCH_SCHEME_OK: &str = "tableroute.fetch.scheme_ok";
    pub const FETCH_SCHEME_FAIL: &str = "tableroute.fetch.scheme_fail";
    pub const FETCH_FIRST_PART_OK: &str = "tableroute.fetch.first_part_ok";
    pub const FETCH_FIRST_PART_FAIL: &str = "tableroute.fetch.first_part_fail";
    pub const FETCH_SUB_PART_OK: &str = "tableroute.fetch.sub_part_ok";
    pub const FETCH_SUB_PART_FAIL: &str = "tableroute.fetch.sub_part_fail";

    // Cache contention
    pub const BUCKET_LOCK_RETRY: &str = "tableroute.cache.bucket_lock_retry";
}

/// Install the Prometheus metrics recorder.
///
/// If `metrics_socket` is provided, starts an HTTP server on that address
/// serving Prometheus metrics at `/metrics`.
pub fn prometheus_install(metrics_socket: Option<SocketAddr>) -> MetricsResult<()> {
    let mut builder = PrometheusBuilder::new()
        .set_quantiles(&[0.5, 0.95, 0.99])
        .expect("configure prometheus quantiles");

    if let Some(socket) = metrics_socket {
        builder = builder.with_http_listener(socket);
    }

    // build() requires a tokio runtime context, so the recorder is built on a
    // background thread that then keeps driving the HTTP exporter. Errors are
    // stringified because BuildError may not be Send.
    let (tx, rx) = mpsc::sync_channel(1);

    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                let _ = tx.send(Err(format!("tokio runtime creation failed: {e}")));
                return;
            }
        };

        let _guard = rt.enter();

        let (prometheus, exporter_future) = match builder.build() {
            Ok(result) => result,
            Err(e) => {
                let _ = tx.send(Err(format!("prometheus build failed: {e}")));
                return;
            }
        };

        let _ = tx.send(Ok(prometheus));

        if let Err(e) = rt.block_on(exporter_future) {
            tracing::error!("prometheus exporter failed: {e:?}");
        }
    });

    let prometheus = rx
        .recv()
        .map_err(|_| MetricsError::ThreadStart)?
        .map_err(|msg| MetricsError::Build { msg })?;

    metrics::set_global_recorder(prometheus).map_err(|_| MetricsError::RecorderInstall)?;

    Ok(())
}
