//! Metadata fetch protocol.
//!
//! One parameterized query per lookup stage, issued against the metadata
//! service's routing catalog. The trait deliberately separates "table not
//! found" (`Ok(None)`) from "service unreachable / backend error" (`Err`):
//! both degrade to a null result for the caller, but metrics keep them apart.

use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{debug, error};

use crate::route::key::RoutingKey;
use crate::route::partition::{NodeAddr, NodeReplica, NodeRole, PartitionKind, PartitionRoute};
use crate::route::{FetchError, FetchResult};
use crate::settings::MetadataSettings;

/// Table-level routing row set, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRecord {
    pub table_id: u64,
    pub partition_count: u64,
    pub replicas: Vec<NodeReplica>,
}

/// Partition-scheme row, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemeRecord {
    pub templated: bool,
    pub part_key_known: bool,
    pub first_kind: Option<PartitionKind>,
    pub sub_kind: Option<PartitionKind>,
}

/// Async remote lookup, one call per resolution stage. Implementations are
/// pinned to the worker that owns them; they never need to be `Send`.
pub trait MetadataFetch {
    /// Stage 1: table identity, partition count, table-level replicas.
    /// `Ok(None)` means the table does not exist in the catalog.
    fn table_entry(
        &self,
        key: &RoutingKey,
        force_refresh: bool,
    ) -> impl Future<Output = FetchResult<Option<TableRecord>>>;

    /// Stage 2: partitioning description for a partitioned table.
    fn partition_scheme(&self, table_id: u64) -> impl Future<Output = FetchResult<SchemeRecord>>;

    /// Stage 3: first-level partition locations. `by_hash` selects the
    /// hash-like template whose partitions are addressed by number only.
    fn first_partitions(
        &self,
        table_id: u64,
        by_hash: bool,
    ) -> impl Future<Output = FetchResult<Vec<PartitionRoute>>>;

    /// Stage 4: sub-level partition locations.
    fn sub_partitions(
        &self,
        table_id: u64,
        templated: bool,
    ) -> impl Future<Output = FetchResult<Vec<PartitionRoute>>>;
}

const TABLE_ENTRY_SQL: &str = "\
    SELECT table_id, partition_count, svr_host, svr_port, is_leader \
    FROM routing_table_locations \
    WHERE table_name = $1 AND schema_version = $2 AND cluster_id = $3 \
    ORDER BY is_leader DESC";

// strong-consistency read, bypassing any metadata-side caching
const TABLE_ENTRY_FORCE_SQL: &str = "\
    SELECT /*+ READ_CONSISTENCY(STRONG) */ \
        table_id, partition_count, svr_host, svr_port, is_leader \
    FROM routing_table_locations \
    WHERE table_name = $1 AND schema_version = $2 AND cluster_id = $3 \
    ORDER BY is_leader DESC";

const PART_SCHEME_SQL: &str = "\
    SELECT part_kind, sub_part_kind, is_templated, part_key_known \
    FROM routing_partition_schemes \
    WHERE table_id = $1";

const FIRST_PART_HASH_SQL: &str = "\
    SELECT part_id, part_id::text AS part_name, svr_host, svr_port, is_leader \
    FROM routing_partition_locations \
    WHERE table_id = $1 AND part_level = 1 \
    ORDER BY part_id, is_leader DESC";

const FIRST_PART_RANGE_SQL: &str = "\
    SELECT part_id, high_bound AS part_name, svr_host, svr_port, is_leader \
    FROM routing_partition_locations \
    WHERE table_id = $1 AND part_level = 1 \
    ORDER BY part_id, is_leader DESC";

const SUB_PART_SQL: &str = "\
    SELECT part_id, high_bound AS part_name, svr_host, svr_port, is_leader \
    FROM routing_partition_locations \
    WHERE table_id = $1 AND part_level = 2 \
    ORDER BY part_id, is_leader DESC";

const SUB_PART_TEMPLATE_SQL: &str = "\
    SELECT part_id, high_bound AS part_name, svr_host, svr_port, is_leader \
    FROM routing_partition_templates \
    WHERE table_id = $1 \
    ORDER BY part_id, is_leader DESC";

/// Production fetch client over a dedicated metadata-service connection.
#[derive(Debug)]
pub struct PgMetadataFetch {
    client: Client,
}

impl PgMetadataFetch {
    pub async fn connect(settings: &MetadataSettings) -> FetchResult<Self> {
        let (client, connection) = Config::new()
            .host(&settings.host)
            .port(settings.port)
            .user(&settings.user)
            .dbname(&settings.database)
            .connect(NoTls)
            .await?;

        // drive the connection until it closes
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("metadata connection error: {e}");
            }
        });

        Ok(Self { client })
    }

    fn replica_from_row(row: &Row) -> FetchResult<NodeReplica> {
        let host: String = row.try_get("svr_host")?;
        let port: i32 = row.try_get("svr_port")?;
        let is_leader: bool = row.try_get("is_leader")?;
        let port = u16::try_from(port).map_err(|_| FetchError::Decode {
            reason: "replica port out of range",
        })?;
        Ok(NodeReplica {
            addr: NodeAddr { host, port },
            role: if is_leader {
                NodeRole::Leader
            } else {
                NodeRole::Follower
            },
        })
    }

    fn partitions_from_rows(rows: &[Row]) -> FetchResult<Vec<PartitionRoute>> {
        let mut parts: Vec<PartitionRoute> = Vec::new();
        for row in rows {
            let part_id: i64 = row.try_get("part_id")?;
            let part_id = u64::try_from(part_id).map_err(|_| FetchError::Decode {
                reason: "negative partition id",
            })?;
            let name: String = row.try_get("part_name")?;
            let replica = Self::replica_from_row(row)?;
            match parts.last_mut() {
                Some(last) if last.part_id == part_id => last.replicas.push(replica),
                _ => parts.push(PartitionRoute {
                    part_id,
                    name,
                    replicas: vec![replica],
                }),
            }
        }
        Ok(parts)
    }

    fn kind_from_row(row: &Row, column: &str) -> FetchResult<Option<PartitionKind>> {
        let raw: Option<String> = row.try_get(column)?;
        match raw {
            None => Ok(None),
            Some(s) => match PartitionKind::parse(&s) {
                Some(kind) => Ok(Some(kind)),
                None => Err(FetchError::Decode {
                    reason: "unknown partition kind",
                }),
            },
        }
    }
}

impl MetadataFetch for PgMetadataFetch {
    async fn table_entry(
        &self,
        key: &RoutingKey,
        force_refresh: bool,
    ) -> FetchResult<Option<TableRecord>> {
        let sql = if force_refresh {
            TABLE_ENTRY_FORCE_SQL
        } else {
            TABLE_ENTRY_SQL
        };
        let rows = self
            .client
            .query(sql, &[&key.table, &key.schema_version, &key.cluster_id])
            .await?;

        let Some(first) = rows.first() else {
            debug!(%key, "table not present in routing catalog");
            return Ok(None);
        };

        let table_id: i64 = first.try_get("table_id")?;
        let partition_count: i64 = first.try_get("partition_count")?;
        let mut replicas = Vec::with_capacity(rows.len());
        for row in &rows {
            replicas.push(Self::replica_from_row(row)?);
        }

        Ok(Some(TableRecord {
            table_id: u64::try_from(table_id).map_err(|_| FetchError::Decode {
                reason: "negative table id",
            })?,
            partition_count: u64::try_from(partition_count).unwrap_or(0),
            replicas,
        }))
    }

    async fn partition_scheme(&self, table_id: u64) -> FetchResult<SchemeRecord> {
        let rows = self
            .client
            .query(PART_SCHEME_SQL, &[&(table_id as i64)])
            .await?;
        let Some(row) = rows.first() else {
            return Err(FetchError::Decode {
                reason: "partition scheme row missing",
            });
        };

        Ok(SchemeRecord {
            templated: row.try_get("is_templated")?,
            part_key_known: row.try_get("part_key_known")?,
            first_kind: Self::kind_from_row(row, "part_kind")?,
            sub_kind: Self::kind_from_row(row, "sub_part_kind")?,
        })
    }

    async fn first_partitions(
        &self,
        table_id: u64,
        by_hash: bool,
    ) -> FetchResult<Vec<PartitionRoute>> {
        let sql = if by_hash {
            FIRST_PART_HASH_SQL
        } else {
            FIRST_PART_RANGE_SQL
        };
        let rows = self.client.query(sql, &[&(table_id as i64)]).await?;
        Self::partitions_from_rows(&rows)
    }

    async fn sub_partitions(
        &self,
        table_id: u64,
        templated: bool,
    ) -> FetchResult<Vec<PartitionRoute>> {
        let sql = if templated {
            SUB_PART_TEMPLATE_SQL
        } else {
            SUB_PART_SQL
        };
        let rows = self.client.query(sql, &[&(table_id as i64)]).await?;
        Self::partitions_from_rows(&rows)
    }
}
