use std::fmt;

use crate::route::KeyError;

/// Identity of one cacheable routing unit.
///
/// Two keys are equal only when all three fields match; a schema or cluster
/// change therefore produces a distinct cache slot rather than a stale hit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    /// Fully qualified table identity, e.g. `db1.t1`.
    pub table: String,
    /// Schema/resource version the caller observed.
    pub schema_version: i64,
    /// Cluster the table belongs to.
    pub cluster_id: i64,
}

impl RoutingKey {
    pub fn new(table: impl Into<String>, schema_version: i64, cluster_id: i64) -> Self {
        Self {
            table: table.into(),
            schema_version,
            cluster_id,
        }
    }

    pub fn validate(&self) -> Result<(), KeyError> {
        if self.table.is_empty() {
            return Err(KeyError::MissingField { name: "table" });
        }
        if self.schema_version < 0 {
            return Err(KeyError::MissingField {
                name: "schema_version",
            });
        }
        if self.cluster_id < 0 {
            return Err(KeyError::MissingField { name: "cluster_id" });
        }
        Ok(())
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@v{}/c{}",
            self.table, self.schema_version, self.cluster_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_differ_on_any_field() {
        let a = RoutingKey::new("db1.t1", 1, 1);
        assert_eq!(a, RoutingKey::new("db1.t1", 1, 1));
        assert_ne!(a, RoutingKey::new("db1.t2", 1, 1));
        assert_ne!(a, RoutingKey::new("db1.t1", 2, 1));
        assert_ne!(a, RoutingKey::new("db1.t1", 1, 2));
    }

    #[test]
    fn validate_rejects_incomplete_keys() {
        assert!(RoutingKey::new("db1.t1", 0, 0).validate().is_ok());
        assert!(RoutingKey::new("", 1, 1).validate().is_err());
        assert!(RoutingKey::new("db1.t1", -1, 1).validate().is_err());
        assert!(RoutingKey::new("db1.t1", 1, -1).validate().is_err());
    }
}
