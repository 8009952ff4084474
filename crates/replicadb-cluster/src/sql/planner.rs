//! Decides which named locks a write must hold.

use std::collections::BTreeSet;

use crate::cluster::Cluster;
use crate::error::{ClusterError, Result};

/// Lock identifiers for a write made of `statements`, sorted and deduplicated.
///
/// Sequences are locked by name when sequence detection is on. INSERT targets
/// are locked by their catalog table name when identity-column detection is on
/// and the table has a column that generates its own values. A table the
/// metadata does not know is not locked.
pub fn write_identifiers<S: AsRef<str>>(cluster: &Cluster, statements: &[S]) -> Result<Vec<String>> {
    let dialect = cluster.dialect();
    let sequences = cluster.is_sequence_detection_enabled() && dialect.supports_sequences();
    let identities =
        cluster.is_identity_column_detection_enabled() && dialect.supports_identity_columns();

    let mut identifiers = BTreeSet::new();
    for sql in statements {
        let sql = sql.as_ref();
        if sequences {
            if let Some(sequence) = dialect.parse_sequence(sql) {
                identifiers.insert(sequence);
            }
        }
        if identities {
            if let Some(table) = dialect.parse_insert_table(sql) {
                if let Some(name) = identity_table(cluster, &table)? {
                    identifiers.insert(name);
                }
            }
        }
    }
    Ok(identifiers.into_iter().collect())
}

fn identity_table(cluster: &Cluster, table: &str) -> Result<Option<String>> {
    let reference = cluster
        .balancer()
        .first()
        .ok_or_else(|| ClusterError::NoAvailableBackend {
            cluster: cluster.id().to_string(),
        })?;
    let properties = cluster.metadata_cache().database_properties(&reference)?;
    let Some(found) = properties.find_table(table) else {
        tracing::debug!(cluster = %cluster.id(), table, "insert target not in metadata; not locked");
        return Ok(None);
    };
    let dialect = cluster.dialect();
    let generated = found.columns().iter().any(|column| match column.auto_increment {
        Some(flag) => flag,
        None => dialect.is_identity(column),
    });
    Ok(generated.then(|| found.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::ClusterConfig;
    use crate::dialect::DialectKind;
    use crate::metadata::{ColumnProperties, DatabaseProperties, MetaDataCache, TableProperties};
    use crate::testkit::MockBackend;

    fn cluster(config: ClusterConfig) -> (Arc<Cluster>, MockBackend) {
        let db1 = MockBackend::new("db1");
        let properties = DatabaseProperties {
            tables: vec![
                TableProperties::new(
                    "T",
                    vec![ColumnProperties::new("id", "INTEGER").auto_increment(true)],
                ),
                TableProperties::new(
                    "events",
                    vec![ColumnProperties::new("id", "serial")],
                ),
                TableProperties::new(
                    "logs",
                    vec![ColumnProperties::new("id", "INTEGER").auto_increment(false)],
                ),
            ],
            ..DatabaseProperties::default()
        };
        let cluster = Cluster::builder(config)
            .backend(db1.backend())
            .metadata_cache(Arc::new(MetaDataCache::fixed(properties)))
            .build()
            .unwrap();
        cluster.start().unwrap();
        (cluster, db1)
    }

    #[test]
    fn test_sequences_and_identity_tables_sorted() {
        let (cluster, _db1) = cluster(ClusterConfig::default());
        let ids = write_identifiers(
            &cluster,
            &[
                "INSERT INTO t VALUES (NEXT VALUE FOR seq2)",
                "SELECT NEXT VALUE FOR seq1",
                "INSERT INTO T VALUES (NEXT VALUE FOR seq2)",
            ],
        )
        .unwrap();
        assert_eq!(ids, vec!["T", "seq1", "seq2"]);
    }

    #[test]
    fn test_unknown_or_plain_tables_not_locked() {
        let (cluster, _db1) = cluster(ClusterConfig::default());
        assert!(write_identifiers(&cluster, &["INSERT INTO missing VALUES (1)"])
            .unwrap()
            .is_empty());
        assert!(write_identifiers(&cluster, &["INSERT INTO logs VALUES (1)"])
            .unwrap()
            .is_empty());
        assert!(write_identifiers(&cluster, &["UPDATE T SET id = 2"])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_dialect_classifies_unknown_flag() {
        let config = ClusterConfig {
            dialect: DialectKind::Postgres,
            ..ClusterConfig::default()
        };
        let (cluster, _db1) = cluster(config);
        let ids = write_identifiers(
            &cluster,
            &["INSERT INTO events (id) VALUES (nextval('events_id_seq'))"],
        )
        .unwrap();
        assert_eq!(ids, vec!["events", "events_id_seq"]);
    }

    #[test]
    fn test_detection_disabled() {
        let config = ClusterConfig {
            sequence_detection: false,
            identity_column_detection: false,
            ..ClusterConfig::default()
        };
        let (cluster, _db1) = cluster(config);
        let ids = write_identifiers(&cluster, &["INSERT INTO T VALUES (NEXT VALUE FOR s)"]).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_mysql_has_no_sequences() {
        let config = ClusterConfig {
            dialect: DialectKind::MySql,
            ..ClusterConfig::default()
        };
        let (cluster, _db1) = cluster(config);
        let ids = write_identifiers(&cluster, &["SELECT NEXT VALUE FOR s"]).unwrap();
        assert!(ids.is_empty());
    }
}
