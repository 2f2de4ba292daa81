//! Routing metadata resolution.
//!
//! Maps a table identity to the physical storage nodes currently serving it.
//! Resolution results are held in a sharded [`cache::RoutingCache`]; misses
//! are filled by a multi-stage remote lookup driven by a per-key resolution
//! task, with concurrent requests for the same key coalesced onto one fetch.

use std::io;

use error_set::error_set;

pub mod cache;
pub mod entry;
pub mod fetch;
pub mod key;
pub mod partition;
pub mod router;
pub mod runtime;
pub mod task;

pub use cache::RoutingCache;
pub use entry::{EntryState, RoutingEntry};
pub use fetch::{MetadataFetch, PgMetadataFetch};
pub use key::RoutingKey;
pub use partition::PartitionScheme;
pub use router::{RouteParams, Router};
pub use runtime::RouterPool;

error_set! {
    RouteError = KeyError || TaskError || WorkerError;

    KeyError = {
        #[display("missing required key field: {name}")]
        MissingField { name: &'static str },
    };

    TaskError = {
        #[display("resolution task finished without replying")]
        TaskGone,
        #[display("internal invariant violated: {reason}")]
        Invariant { reason: &'static str },
    };

    WorkerError = {
        IoError(io::Error),
        #[display("metadata service connection failed")]
        Connect(FetchError),
        #[display("no routing worker available")]
        NoWorker,
    };

    FetchError = {
        Backend(tokio_postgres::Error),
        #[display("malformed metadata row: {reason}")]
        Decode { reason: &'static str },
        #[display("metadata service unavailable")]
        Unavailable,
    };
}

pub type RouteResult<T> = Result<T, RouteError>;
pub type FetchResult<T> = Result<T, FetchError>;
