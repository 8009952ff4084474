//! Backend descriptors and the physical driver interface.
//!
//! A [`Backend`] identifies one physical database. Its [`Connector`] is the
//! connectivity collaborator: it opens physical connections and answers the
//! liveness probe used by failure handling. The [`Connection`], [`Statement`]
//! and [`ResultSet`] traits are the physical handles the dispatcher replays
//! calls against.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BackendResult;

/// Opens physical connections to one backend and probes its liveness.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BackendResult<Box<dyn Connection>>;

    /// Lightweight connectivity check.
    fn is_alive(&self) -> bool;
}

/// Descriptor of one physical database participating in a cluster.
///
/// Equality, ordering and hashing use the id only, so lock acquisition and
/// write fan-out order is the same on every call.
pub struct Backend {
    id: String,
    weight: u32,
    connector: Arc<dyn Connector>,
}

impl Backend {
    pub fn new(id: impl Into<String>, connector: Arc<dyn Connector>) -> Arc<Self> {
        Self::with_weight(id, 1, connector)
    }

    pub fn with_weight(
        id: impl Into<String>,
        weight: u32,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            weight,
            connector,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Relative share of reads under weighted policies. 0 excludes the backend.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .finish()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Backend {}

impl PartialOrd for Backend {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Backend {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Backend {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

pub type Row = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResultSetType {
    #[default]
    ForwardOnly,
    ScrollInsensitive,
    ScrollSensitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Concurrency {
    #[default]
    ReadOnly,
    Updatable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FetchDirection {
    #[default]
    Forward,
    Reverse,
    Unknown,
}

/// What to do with the current result when advancing to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoreResults {
    CloseCurrent,
    KeepCurrent,
    CloseAll,
}

/// Options fixed when a statement is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatementOptions {
    pub result_set_type: ResultSetType,
    pub concurrency: Concurrency,
}

/// A physical connection to one backend.
pub trait Connection: Send {
    fn create_statement(&mut self, options: StatementOptions) -> BackendResult<Box<dyn Statement>>;
    fn set_auto_commit(&mut self, auto_commit: bool) -> BackendResult<()>;
    fn set_read_only(&mut self, read_only: bool) -> BackendResult<()>;
    fn commit(&mut self) -> BackendResult<()>;
    fn rollback(&mut self) -> BackendResult<()>;
    fn close(&mut self) -> BackendResult<()>;
}

/// A physical statement on one backend.
pub trait Statement: Send {
    fn execute(&mut self, sql: &str) -> BackendResult<bool>;
    fn execute_update(&mut self, sql: &str) -> BackendResult<u64>;
    fn execute_query(&mut self, sql: &str) -> BackendResult<Box<dyn ResultSet>>;
    fn add_batch(&mut self, sql: &str) -> BackendResult<()>;
    fn clear_batch(&mut self) -> BackendResult<()>;
    fn execute_batch(&mut self) -> BackendResult<Vec<u64>>;
    fn result_set(&mut self) -> BackendResult<Option<Box<dyn ResultSet>>>;
    fn update_count(&mut self) -> BackendResult<Option<u64>>;
    fn more_results(&mut self, current: MoreResults) -> BackendResult<bool>;
    fn generated_keys(&mut self) -> BackendResult<Vec<Row>>;
    fn warnings(&mut self) -> BackendResult<Vec<String>>;
    fn clear_warnings(&mut self) -> BackendResult<()>;
    fn fetch_size(&mut self) -> BackendResult<usize>;
    fn set_fetch_size(&mut self, rows: usize) -> BackendResult<()>;
    fn fetch_direction(&mut self) -> BackendResult<FetchDirection>;
    fn set_fetch_direction(&mut self, direction: FetchDirection) -> BackendResult<()>;
    fn max_rows(&mut self) -> BackendResult<usize>;
    fn set_max_rows(&mut self, rows: usize) -> BackendResult<()>;
    fn query_timeout(&mut self) -> BackendResult<Duration>;
    fn set_query_timeout(&mut self, timeout: Duration) -> BackendResult<()>;
    fn set_cursor_name(&mut self, name: &str) -> BackendResult<()>;
    fn close(&mut self) -> BackendResult<()>;
}

/// A server-side cursor on one backend.
pub trait ResultSet: Send {
    fn columns(&self) -> BackendResult<Vec<String>>;
    fn next_row(&mut self) -> BackendResult<Option<Row>>;
    fn close(&mut self) -> BackendResult<()>;
}
