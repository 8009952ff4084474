//! Classification of handle operations into invocation strategies.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// How one call on a logical handle is replayed over the backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationStrategy {
    /// Answered by the reference backend's physical handle on the calling
    /// thread. No failure handling.
    LocalRead,
    /// Applied to every backend's physical handle in parallel.
    LocalWrite,
    /// Statement execution under write locks on every backend.
    LockedWrite { identifiers: Vec<String> },
    /// Lazy read against one selected backend, retried on failover.
    SingleRead,
    /// Rows copied into memory from one backend, or from all of them under
    /// write locks.
    EagerRead {
        all_backends: bool,
        identifiers: Vec<String>,
    },
    /// Answered from the handle table; never dispatched.
    Structural,
}

impl fmt::Display for InvocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalRead => f.write_str("local-read"),
            Self::LocalWrite => f.write_str("local-write"),
            Self::LockedWrite { .. } => f.write_str("locked-write"),
            Self::SingleRead => f.write_str("single-read"),
            Self::EagerRead { all_backends: true, .. } => f.write_str("eager-read-all"),
            Self::EagerRead { .. } => f.write_str("eager-read"),
            Self::Structural => f.write_str("structural"),
        }
    }
}

/// Static part of the classification: what an operation does, before the SQL
/// and handle state refine it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    LocalRead,
    LocalWrite,
    /// Statement execution or transaction completion.
    Write,
    /// Produces a result set.
    Query,
    Structural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Connection,
    Statement,
    ResultSet,
}

type OperationMap = HashMap<&'static str, OperationKind>;

fn build(entries: &[(&'static str, OperationKind)]) -> OperationMap {
    entries.iter().copied().collect()
}

fn connection_ops() -> &'static OperationMap {
    static OPS: OnceLock<OperationMap> = OnceLock::new();
    OPS.get_or_init(|| {
        use OperationKind::*;
        build(&[
            ("auto_commit", LocalRead),
            ("is_read_only", LocalRead),
            ("is_closed", Structural),
            ("cluster", Structural),
            ("create_statement", LocalWrite),
            ("set_auto_commit", LocalWrite),
            ("set_read_only", LocalWrite),
            ("commit", Write),
            ("rollback", Write),
            ("close", Structural),
        ])
    })
}

fn statement_ops() -> &'static OperationMap {
    static OPS: OnceLock<OperationMap> = OnceLock::new();
    OPS.get_or_init(|| {
        use OperationKind::*;
        build(&[
            ("fetch_size", LocalRead),
            ("fetch_direction", LocalRead),
            ("max_rows", LocalRead),
            ("query_timeout", LocalRead),
            ("update_count", LocalRead),
            ("generated_keys", LocalRead),
            ("warnings", LocalRead),
            ("pending_batch", LocalRead),
            ("set_fetch_size", LocalWrite),
            ("set_fetch_direction", LocalWrite),
            ("set_max_rows", LocalWrite),
            ("set_query_timeout", LocalWrite),
            ("set_cursor_name", LocalWrite),
            ("clear_warnings", LocalWrite),
            ("add_batch", LocalWrite),
            ("clear_batch", LocalWrite),
            ("execute", Write),
            ("execute_update", Write),
            ("execute_batch", Write),
            ("more_results", Write),
            ("execute_query", Query),
            ("result_set", Query),
            ("result_set_type", Structural),
            ("result_set_concurrency", Structural),
            ("connection", Structural),
            ("is_closed", Structural),
            ("close", Structural),
        ])
    })
}

fn result_set_ops() -> &'static OperationMap {
    static OPS: OnceLock<OperationMap> = OnceLock::new();
    OPS.get_or_init(|| {
        use OperationKind::*;
        build(&[
            ("next", Query),
            ("columns", LocalRead),
            ("value", LocalRead),
            ("value_by_name", LocalRead),
            ("row", LocalRead),
            ("previous", LocalRead),
            ("absolute", LocalRead),
            ("before_first", LocalRead),
            ("is_detached", Structural),
            ("statement", Structural),
            ("close", Structural),
        ])
    })
}

/// Static kind of `operation` on a handle of `kind`. Unknown operations are
/// structural: they never reach a backend.
pub fn operation_kind(kind: HandleKind, operation: &str) -> OperationKind {
    let ops = match kind {
        HandleKind::Connection => connection_ops(),
        HandleKind::Statement => statement_ops(),
        HandleKind::ResultSet => result_set_ops(),
    };
    ops.get(operation)
        .copied()
        .unwrap_or(OperationKind::Structural)
}

/// Inputs that refine a query into a single-backend or eager read.
#[derive(Debug, Clone, Default)]
pub struct QueryTraits {
    pub identifiers: Vec<String>,
    pub read_only: bool,
    pub forward_only: bool,
    pub select_for_update: bool,
    pub locators_update_copy: bool,
}

/// Strategy for a call that produces a result set.
pub fn query_strategy(q: QueryTraits) -> InvocationStrategy {
    let plain_read = q.identifiers.is_empty() && !q.select_for_update;
    if plain_read && q.read_only && q.forward_only {
        if q.locators_update_copy {
            InvocationStrategy::SingleRead
        } else {
            InvocationStrategy::EagerRead {
                all_backends: false,
                identifiers: Vec::new(),
            }
        }
    } else if plain_read {
        // Scrollable or updatable cursors over plain reads still only need
        // one backend's rows, copied out.
        InvocationStrategy::EagerRead {
            all_backends: false,
            identifiers: Vec::new(),
        }
    } else {
        InvocationStrategy::EagerRead {
            all_backends: true,
            identifiers: q.identifiers,
        }
    }
}
