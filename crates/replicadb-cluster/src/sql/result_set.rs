use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{ResultSet, Row, Value};
use crate::cluster::Cluster;
use crate::error::{BackendResult, ClusterError, Result};
use crate::sql::handle::{HandleId, PhysicalResultSet};
use crate::sql::invoke::{live_physical, Dispatch};
use crate::sql::strategy::{operation_kind, HandleKind, InvocationStrategy, OperationKind};

/// Reads every row of `cursor` and closes it.
pub(crate) fn materialize(mut cursor: PhysicalResultSet) -> BackendResult<(Vec<String>, Vec<Row>)> {
    let read = read_all(&mut *cursor);
    let closed = cursor.close();
    let copied = read?;
    closed?;
    Ok(copied)
}

fn read_all(cursor: &mut dyn ResultSet) -> BackendResult<(Vec<String>, Vec<Row>)> {
    let columns = cursor.columns()?;
    let mut rows = Vec::new();
    while let Some(row) = cursor.next_row()? {
        rows.push(row);
    }
    Ok((columns, rows))
}

enum Cursor {
    /// Rows copied into memory. `position` 0 is before the first row and
    /// `rows.len() + 1` after the last.
    Eager { rows: Vec<Row>, position: usize },
    /// Server-side cursor on one backend.
    Lazy { current: Option<Row> },
}

/// A logical result set.
///
/// Eager result sets are detached: they hold their rows in memory and are
/// scrollable. Lazy ones stream from a single backend and only move forward.
pub struct ClusterResultSet {
    cluster: Arc<Cluster>,
    id: HandleId,
    columns: Vec<String>,
    cursor: Mutex<Cursor>,
}

impl ClusterResultSet {
    pub(crate) fn eager(cluster: Arc<Cluster>, id: HandleId, columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            cluster,
            id,
            columns,
            cursor: Mutex::new(Cursor::Eager { rows, position: 0 }),
        }
    }

    pub(crate) fn lazy(cluster: Arc<Cluster>, id: HandleId, columns: Vec<String>) -> Self {
        Self {
            cluster,
            id,
            columns,
            cursor: Mutex::new(Cursor::Lazy { current: None }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Id of the statement that produced this result set.
    pub fn statement_id(&self) -> Option<HandleId> {
        self.cluster.handles().lock().parent(self.id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClusterError::HandleClosed);
        }
        Ok(())
    }

    /// True when the rows are held in memory and no backend cursor is open.
    pub fn is_detached(&self) -> bool {
        matches!(*self.cursor.lock(), Cursor::Eager { .. })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Moves to the next row. Returns false past the last row.
    pub fn next(&self) -> Result<bool> {
        self.ensure_open()?;
        let mut cursor = self.cursor.lock();
        match &mut *cursor {
            Cursor::Eager { rows, position } => {
                if *position <= rows.len() {
                    *position += 1;
                }
                Ok(*position <= rows.len())
            }
            Cursor::Lazy { current } => {
                let strategy = match operation_kind(HandleKind::ResultSet, "next") {
                    OperationKind::Query => InvocationStrategy::SingleRead,
                    _ => InvocationStrategy::LocalRead,
                };
                let physical = live_physical::<PhysicalResultSet>(&self.cluster, self.id)?;
                let row = Dispatch::driver(&self.cluster).invoke_first(
                    &strategy,
                    physical,
                    |rs: &mut PhysicalResultSet| rs.next_row(),
                )?;
                *current = row;
                Ok(current.is_some())
            }
        }
    }

    /// Moves to the previous row. Returns false before the first row.
    pub fn previous(&self) -> Result<bool> {
        self.scroll(|rows, position| {
            *position = position.saturating_sub(1);
            *position >= 1 && *position <= rows
        })
    }

    /// Moves to the 1-based row `row`. 0 is before the first row; beyond the
    /// last is after it.
    pub fn absolute(&self, row: usize) -> Result<bool> {
        self.scroll(|rows, position| {
            *position = row.min(rows + 1);
            *position >= 1 && *position <= rows
        })
    }

    pub fn before_first(&self) -> Result<()> {
        self.scroll(|_, position| {
            *position = 0;
            false
        })?;
        Ok(())
    }

    fn scroll(&self, step: impl FnOnce(usize, &mut usize) -> bool) -> Result<bool> {
        self.ensure_open()?;
        match &mut *self.cursor.lock() {
            Cursor::Eager { rows, position } => Ok(step(rows.len(), position)),
            Cursor::Lazy { .. } => Err(ClusterError::Unsupported(
                "cursor is forward-only".to_string(),
            )),
        }
    }

    /// The current row, if the cursor is on one.
    pub fn row(&self) -> Result<Option<Row>> {
        self.ensure_open()?;
        Ok(match &*self.cursor.lock() {
            Cursor::Eager { rows, position } => position
                .checked_sub(1)
                .and_then(|i| rows.get(i))
                .cloned(),
            Cursor::Lazy { current } => current.clone(),
        })
    }

    /// Value at 0-based column `index` of the current row.
    pub fn value(&self, index: usize) -> Result<Value> {
        let row = self
            .row()?
            .ok_or_else(|| ClusterError::InvalidArgument("no current row".to_string()))?;
        row.into_iter().nth(index).ok_or_else(|| {
            ClusterError::InvalidArgument(format!("column index {index} out of range"))
        })
    }

    /// Value of the named column of the current row, ignoring case.
    pub fn value_by_name(&self, name: &str) -> Result<Value> {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| ClusterError::InvalidArgument(format!("no column named {name}")))?;
        self.value(index)
    }

    /// Closes the result set and its backend cursor, if any.
    pub fn close(&self) -> Result<()> {
        let closing = self.cluster.handles().lock().remove(self.id);
        for physical in closing {
            physical.close();
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        !self.cluster.handles().lock().contains(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;

    struct Rows {
        rows: std::vec::IntoIter<Row>,
        fail_at: Option<usize>,
        read: usize,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    impl ResultSet for Rows {
        fn columns(&self) -> BackendResult<Vec<String>> {
            Ok(vec!["id".to_string()])
        }

        fn next_row(&mut self) -> BackendResult<Option<Row>> {
            if self.fail_at == Some(self.read) {
                return Err(BackendError::new("connection lost"));
            }
            self.read += 1;
            Ok(self.rows.next())
        }

        fn close(&mut self) -> BackendResult<()> {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn cursor(n: i64, fail_at: Option<usize>) -> (PhysicalResultSet, Arc<std::sync::atomic::AtomicBool>) {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let rows: Vec<Row> = (1..=n).map(|i| vec![Value::Int(i)]).collect();
        (
            Box::new(Rows {
                rows: rows.into_iter(),
                fail_at,
                read: 0,
                closed: closed.clone(),
            }),
            closed,
        )
    }

    #[test]
    fn test_materialize_reads_all_and_closes() {
        let (rs, closed) = cursor(3, None);
        let (columns, rows) = materialize(rs).unwrap();
        assert_eq!(columns, vec!["id"]);
        assert_eq!(rows.len(), 3);
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_materialize_closes_on_read_error() {
        let (rs, closed) = cursor(3, Some(1));
        assert!(materialize(rs).is_err());
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
