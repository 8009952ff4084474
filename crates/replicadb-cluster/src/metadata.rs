//! Schema shape cache consulted by the locking planner and query routing.
//!
//! Properties are fetched from the reference backend and cached per backend id
//! with an optional TTL, so repeated writes don't re-read catalog tables.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnProperties {
    pub name: String,
    pub type_name: String,
    /// `None` when the driver does not report the flag.
    pub auto_increment: Option<bool>,
    pub default_value: Option<String>,
}

impl ColumnProperties {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            auto_increment: None,
            default_value: None,
        }
    }

    pub fn auto_increment(mut self, flag: bool) -> Self {
        self.auto_increment = Some(flag);
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Possibly schema-qualified, e.g. `sales.orders`.
    pub name: String,
    pub columns: Vec<ColumnProperties>,
}

impl TableProperties {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnProperties>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn columns(&self) -> &[ColumnProperties] {
        &self.columns
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&ColumnProperties> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Shape of one logical database as reported by its reference backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseProperties {
    /// Large-object locators write through to the server copy. Single-backend
    /// lazy cursors are only safe when this holds.
    pub locators_update_copy: bool,
    pub supports_select_for_update: bool,
    pub tables: Vec<TableProperties>,
}

impl DatabaseProperties {
    /// Finds a table by name, ignoring case and identifier quoting. An
    /// unqualified name also matches a schema-qualified table.
    pub fn find_table(&self, name: &str) -> Option<&TableProperties> {
        let wanted = name.trim_matches('"').to_ascii_lowercase();
        let exact = self
            .tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(&wanted));
        if exact.is_some() || wanted.contains('.') {
            return exact;
        }
        self.tables.iter().find(|t| {
            t.name
                .rsplit_once('.')
                .is_some_and(|(_, table)| table.eq_ignore_ascii_case(&wanted))
        })
    }
}

/// Metadata collaborator of a cluster.
pub trait DatabaseMetaDataCache: Send + Sync {
    fn database_properties(&self, reference: &Backend) -> Result<Arc<DatabaseProperties>>;

    /// Drops everything cached. Called after schema changes.
    fn flush(&self);
}

type Loader = Box<dyn Fn(&Backend) -> Result<DatabaseProperties> + Send + Sync>;

enum Source {
    Fixed(Arc<DatabaseProperties>),
    Loaded { loader: Loader, ttl: Option<Duration> },
}

struct Cached {
    properties: Arc<DatabaseProperties>,
    loaded_at: Instant,
}

/// Properties cache keyed by reference backend id.
pub struct MetaDataCache {
    source: Source,
    entries: RwLock<HashMap<String, Cached>>,
}

impl MetaDataCache {
    /// Serves the same properties for every backend.
    pub fn fixed(properties: DatabaseProperties) -> Self {
        Self {
            source: Source::Fixed(Arc::new(properties)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Loads properties on first use per backend. With a `ttl`, entries older
    /// than it are reloaded; without one they live until [`flush`](Self::flush).
    pub fn loading<F>(ttl: Option<Duration>, loader: F) -> Self
    where
        F: Fn(&Backend) -> Result<DatabaseProperties> + Send + Sync + 'static,
    {
        Self {
            source: Source::Loaded {
                loader: Box::new(loader),
                ttl,
            },
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn fresh(cached: &Cached, ttl: Option<Duration>) -> bool {
        ttl.map_or(true, |ttl| cached.loaded_at.elapsed() < ttl)
    }
}

impl Default for MetaDataCache {
    fn default() -> Self {
        Self::fixed(DatabaseProperties::default())
    }
}

impl DatabaseMetaDataCache for MetaDataCache {
    fn database_properties(&self, reference: &Backend) -> Result<Arc<DatabaseProperties>> {
        let (loader, ttl) = match &self.source {
            Source::Fixed(properties) => return Ok(properties.clone()),
            Source::Loaded { loader, ttl } => (loader, *ttl),
        };

        {
            let entries = self.entries.read();
            if let Some(cached) = entries.get(reference.id()) {
                if Self::fresh(cached, ttl) {
                    return Ok(cached.properties.clone());
                }
            }
        }

        let properties = Arc::new(loader(reference)?);
        tracing::debug!(backend = %reference, tables = properties.tables.len(), "metadata loaded");

        let mut entries = self.entries.write();
        if let Some(cached) = entries.get(reference.id()) {
            if Self::fresh(cached, ttl) {
                return Ok(cached.properties.clone());
            }
        }
        entries.insert(
            reference.id().to_string(),
            Cached {
                properties: properties.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(properties)
    }

    fn flush(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Connection, Connector};
    use crate::error::{BackendError, BackendResult, ClusterError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Offline;

    impl Connector for Offline {
        fn connect(&self) -> BackendResult<Box<dyn Connection>> {
            Err(BackendError::new("offline"))
        }

        fn is_alive(&self) -> bool {
            false
        }
    }

    fn sample() -> DatabaseProperties {
        DatabaseProperties {
            locators_update_copy: true,
            supports_select_for_update: true,
            tables: vec![
                TableProperties::new(
                    "sales.orders",
                    vec![
                        ColumnProperties::new("id", "INTEGER").auto_increment(true),
                        ColumnProperties::new("sku", "VARCHAR"),
                    ],
                ),
                TableProperties::new("T", vec![ColumnProperties::new("ID", "INTEGER")]),
            ],
        }
    }

    #[test]
    fn test_find_table() {
        let props = sample();
        assert_eq!(props.find_table("t").unwrap().name, "T");
        assert_eq!(props.find_table("SALES.ORDERS").unwrap().name, "sales.orders");
        assert_eq!(props.find_table("orders").unwrap().name, "sales.orders");
        assert!(props.find_table("archive.orders").is_none());
        assert!(props.find_table("missing").is_none());
    }

    #[test]
    fn test_column_lookup() {
        let props = sample();
        let orders = props.find_table("orders").unwrap();
        assert_eq!(orders.columns().len(), 2);
        assert_eq!(orders.column("ID").unwrap().auto_increment, Some(true));
        assert!(orders.column("price").is_none());
    }

    #[test]
    fn test_loader_cached_until_flush() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = MetaDataCache::loading(None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(sample())
        });
        let db1 = Backend::new("db1", Arc::new(Offline));

        cache.database_properties(&db1).unwrap();
        cache.database_properties(&db1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.flush();
        cache.database_properties(&db1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ttl_expiry_reloads() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = MetaDataCache::loading(Some(Duration::from_millis(10)), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(sample())
        });
        let db1 = Backend::new("db1", Arc::new(Offline));

        cache.database_properties(&db1).unwrap();
        std::thread::sleep(Duration::from_millis(25));
        cache.database_properties(&db1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_loader_error_not_cached() {
        let cache = MetaDataCache::loading(None, |b| {
            Err(ClusterError::Config(format!("no catalog on {b}")))
        });
        let db1 = Backend::new("db1", Arc::new(Offline));
        assert!(cache.database_properties(&db1).is_err());
        assert!(cache.entries.read().is_empty());
    }
}
