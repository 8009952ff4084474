//! ReplicaDB cluster: a set of identical SQL backends presented as one
//! logical database.
//!
//! Writes are replayed on every live backend, reads go to one backend, and a
//! backend that fails is removed from service while the survivors keep
//! serving.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  ClusterConnection / Statement / ResultSet       │
//! ├─────────────────────────────────────────────────┤
//! │  Dispatcher (sql::invoke)                        │
//! │   ├─ InvocationStrategy (static op maps)        │
//! │   ├─ Locking planner ── Dialect, MetaDataCache  │
//! │   └─ WorkerPool × 2 (transactional / io)        │
//! ├─────────────────────────────────────────────────┤
//! │  Cluster                                         │
//! │   ├─ Balancer (live set, read policy)           │
//! │   ├─ LockManager                                 │
//! │   ├─ StateManager (membership log)              │
//! │   └─ FailureDetector                             │
//! ├─────────────────────────────────────────────────┤
//! │  Backend × N ── Connector (physical driver)     │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod balancer;
pub mod cluster;
pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod lock;
pub mod metadata;
pub mod monitor;
pub mod sql;
pub mod state;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use backend::{Backend, Connector, Row, StatementOptions, Value};
pub use balancer::{Balancer, BalancerKind};
pub use cluster::{Cluster, ClusterBuilder};
pub use config::ClusterConfig;
pub use dialect::{Dialect, DialectKind};
pub use error::{BackendError, ClusterError, Result};
pub use lock::{LocalLockManager, LockManager};
pub use metadata::{
    ColumnProperties, DatabaseMetaDataCache, DatabaseProperties, MetaDataCache, TableProperties,
};
pub use sql::{ClusterConnection, ClusterResultSet, ClusterStatement, InvocationStrategy};
pub use state::{FileStateManager, MemoryStateManager, StateManager};
