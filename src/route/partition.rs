//! Partition topology for partitioned tables.
//!
//! A [`PartitionScheme`] is allocated lazily on a routing entry once the
//! partition-scheme lookup stage has run. The expected first/sub level kinds
//! are recorded separately from the fetched per-partition locations so that a
//! half-built scheme (a later stage failed) is distinguishable from a complete
//! one.

use std::fmt;

/// Partitioning function of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Hash,
    Key,
    Range,
    List,
}

impl PartitionKind {
    /// Hash-like levels address partitions purely by number.
    pub fn is_hash_like(self) -> bool {
        matches!(self, PartitionKind::Hash | PartitionKind::Key)
    }

    pub fn parse(s: &str) -> Option<PartitionKind> {
        match s {
            "hash" => Some(PartitionKind::Hash),
            "key" => Some(PartitionKind::Key),
            "range" => Some(PartitionKind::Range),
            "list" => Some(PartitionKind::List),
            _ => None,
        }
    }
}

/// Network address of a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Leader,
    Follower,
}

/// One replica of a table or partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReplica {
    pub addr: NodeAddr,
    pub role: NodeRole,
}

impl NodeReplica {
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}

/// Location of a single partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRoute {
    pub part_id: u64,
    pub name: String,
    pub replicas: Vec<NodeReplica>,
}

impl PartitionRoute {
    pub fn leader(&self) -> Option<&NodeAddr> {
        self.replicas.iter().find(|r| r.is_leader()).map(|r| &r.addr)
    }
}

/// First-level and optional sub-level partitioning of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionScheme {
    /// Sub-partitioning is templated (identical under every first-level part).
    pub templated: bool,
    /// The partitioning key columns are resolvable by the proxy. When false
    /// the lookup chain stops after the scheme stage and partition routing is
    /// unavailable for this table.
    pub part_key_known: bool,
    /// Expected first-level partitioning, recorded at the scheme stage.
    pub first_kind: Option<PartitionKind>,
    /// Expected sub-level partitioning, recorded at the scheme stage.
    pub sub_kind: Option<PartitionKind>,
    /// First-level partition locations; `None` until the first-part stage ran.
    pub first_parts: Option<Vec<PartitionRoute>>,
    /// Sub-level partition locations; `None` until the sub-part stage ran.
    pub sub_parts: Option<Vec<PartitionRoute>>,
}

impl Default for PartitionScheme {
    fn default() -> Self {
        Self {
            templated: false,
            part_key_known: false,
            first_kind: None,
            sub_kind: None,
            first_parts: None,
            sub_parts: None,
        }
    }
}

impl PartitionScheme {
    /// A sub-part lookup runs unless the table is templated with a hash-like
    /// (or absent) sub level, whose partitions need no per-partition rows.
    pub fn sub_fetch_required(&self) -> bool {
        self.first_kind.is_some()
            && (!self.templated
                || matches!(
                    self.sub_kind,
                    Some(PartitionKind::Range) | Some(PartitionKind::List)
                ))
    }

    /// Every level the lookup chain was expected to fetch has been fetched.
    pub fn is_complete(&self) -> bool {
        if !self.part_key_known {
            // chain legitimately stopped after the scheme stage
            return true;
        }
        match self.first_kind {
            None => true,
            Some(_) => {
                self.first_parts.is_some() && (!self.sub_fetch_required() || self.sub_parts.is_some())
            }
        }
    }

    pub fn first_partition(&self, part_id: u64) -> Option<&PartitionRoute> {
        self.first_parts
            .as_deref()
            .and_then(|parts| parts.iter().find(|p| p.part_id == part_id))
    }

    pub fn sub_partition(&self, part_id: u64) -> Option<&PartitionRoute> {
        self.sub_parts
            .as_deref()
            .and_then(|parts| parts.iter().find(|p| p.part_id == part_id))
    }
}
