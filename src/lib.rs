//! replicadb: a set of identical SQL backends presented as one logical database.
//!
//! Writes are replayed on every active backend, reads are routed to one, and a
//! backend that stops responding is removed from service while the survivors
//! keep serving. See [`replicadb_cluster`] for the dispatch and failover layer.

pub use replicadb_cluster::*;
