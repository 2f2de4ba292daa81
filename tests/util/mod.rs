#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Duration;

use tableroute_lib::route::fetch::{MetadataFetch, SchemeRecord, TableRecord};
use tableroute_lib::route::partition::{NodeAddr, NodeReplica, NodeRole, PartitionRoute};
use tableroute_lib::route::{FetchError, FetchResult, RoutingKey};

/// Scriptable in-memory metadata service. Lives on one worker's `LocalSet`
/// like the real client, so interior mutability is plain `Cell`/`RefCell`.
#[derive(Default)]
pub struct MockFetch {
    pub tables: RefCell<HashMap<String, TableRecord>>,
    pub schemes: RefCell<HashMap<u64, SchemeRecord>>,
    pub first_parts: RefCell<HashMap<u64, Vec<PartitionRoute>>>,
    pub sub_parts: RefCell<HashMap<u64, Vec<PartitionRoute>>>,

    pub entry_calls: Cell<u32>,
    pub scheme_calls: Cell<u32>,
    pub first_part_calls: Cell<u32>,
    pub sub_part_calls: Cell<u32>,

    pub fail_entry: Cell<bool>,
    pub fail_first_parts: Cell<bool>,
    /// Injected latency on the table-entry stage, to widen race windows.
    pub entry_delay: Cell<Option<Duration>>,
}

impl MockFetch {
    pub fn with_table(table: &str, record: TableRecord) -> Self {
        let fetch = Self::default();
        fetch.tables.borrow_mut().insert(table.to_owned(), record);
        fetch
    }

    pub fn set_table(&self, table: &str, record: TableRecord) {
        self.tables.borrow_mut().insert(table.to_owned(), record);
    }
}

impl MetadataFetch for MockFetch {
    async fn table_entry(
        &self,
        key: &RoutingKey,
        _force_refresh: bool,
    ) -> FetchResult<Option<TableRecord>> {
        self.entry_calls.set(self.entry_calls.get() + 1);
        if let Some(delay) = self.entry_delay.get() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_entry.get() {
            return Err(FetchError::Unavailable);
        }
        Ok(self.tables.borrow().get(&key.table).cloned())
    }

    async fn partition_scheme(&self, table_id: u64) -> FetchResult<SchemeRecord> {
        self.scheme_calls.set(self.scheme_calls.get() + 1);
        self.schemes
            .borrow()
            .get(&table_id)
            .copied()
            .ok_or(FetchError::Unavailable)
    }

    async fn first_partitions(
        &self,
        table_id: u64,
        _by_hash: bool,
    ) -> FetchResult<Vec<PartitionRoute>> {
        self.first_part_calls.set(self.first_part_calls.get() + 1);
        if self.fail_first_parts.get() {
            return Err(FetchError::Unavailable);
        }
        self.first_parts
            .borrow()
            .get(&table_id)
            .cloned()
            .ok_or(FetchError::Unavailable)
    }

    async fn sub_partitions(
        &self,
        table_id: u64,
        _templated: bool,
    ) -> FetchResult<Vec<PartitionRoute>> {
        self.sub_part_calls.set(self.sub_part_calls.get() + 1);
        self.sub_parts
            .borrow()
            .get(&table_id)
            .cloned()
            .ok_or(FetchError::Unavailable)
    }
}

pub fn leader(host: &str, port: u16) -> NodeReplica {
    NodeReplica {
        addr: NodeAddr {
            host: host.to_owned(),
            port,
        },
        role: NodeRole::Leader,
    }
}

pub fn follower(host: &str, port: u16) -> NodeReplica {
    NodeReplica {
        addr: NodeAddr {
            host: host.to_owned(),
            port,
        },
        role: NodeRole::Follower,
    }
}

pub fn table(table_id: u64, partition_count: u64, replicas: Vec<NodeReplica>) -> TableRecord {
    TableRecord {
        table_id,
        partition_count,
        replicas,
    }
}

pub fn part(part_id: u64, name: &str, replicas: Vec<NodeReplica>) -> PartitionRoute {
    PartitionRoute {
        part_id,
        name: name.to_owned(),
        replicas,
    }
}
