use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{
    Concurrency, FetchDirection, MoreResults, ResultSet as _, ResultSetType, Row,
    Statement as _, StatementOptions,
};
use crate::cluster::Cluster;
use crate::error::{BackendResult, ClusterError, Result};
use crate::sql::handle::{
    share, HandleId, Physical, PhysicalMap, PhysicalResultSet, PhysicalStatement,
};
use crate::sql::invoke::{first, live_physical, Dispatch};
use crate::sql::planner::write_identifiers;
use crate::sql::result_set::{materialize, ClusterResultSet};
use crate::sql::strategy::{
    operation_kind, query_strategy, HandleKind, InvocationStrategy, OperationKind, QueryTraits,
};
use crate::sql::ClusterConnection;

/// A logical statement: one physical statement per backend of its connection.
pub struct ClusterStatement {
    connection: ClusterConnection,
    id: HandleId,
    options: StatementOptions,
    /// Mirror of the SQL added to every physical batch since the last clear.
    batch: Mutex<Vec<String>>,
}

impl ClusterStatement {
    pub(crate) fn new(connection: ClusterConnection, id: HandleId, options: StatementOptions) -> Self {
        Self {
            connection,
            id,
            options,
            batch: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    fn cluster(&self) -> &Arc<Cluster> {
        self.connection.cluster()
    }

    fn dispatch(&self) -> Dispatch<'_> {
        Dispatch::statement(self.cluster(), self.connection.auto_commit_mode())
    }

    fn physical(&self) -> Result<PhysicalMap<PhysicalStatement>> {
        live_physical(self.cluster(), self.id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClusterError::HandleClosed);
        }
        Ok(())
    }

    /// Classifies `op`. `statements` is the SQL the call will execute, used to
    /// plan locks for writes and to route queries.
    fn strategy(&self, op: &'static str, statements: &[&str]) -> Result<InvocationStrategy> {
        self.ensure_open()?;
        let cluster = self.cluster();
        let strategy = match operation_kind(HandleKind::Statement, op) {
            OperationKind::LocalRead => InvocationStrategy::LocalRead,
            OperationKind::LocalWrite => InvocationStrategy::LocalWrite,
            OperationKind::Write => InvocationStrategy::LockedWrite {
                identifiers: write_identifiers(cluster, statements)?,
            },
            OperationKind::Query => self.query_strategy(statements.first().copied())?,
            OperationKind::Structural => InvocationStrategy::Structural,
        };
        tracing::debug!(cluster = %cluster.id(), handle = ?self.id, op, %strategy, "statement call");
        Ok(strategy)
    }

    fn query_strategy(&self, sql: Option<&str>) -> Result<InvocationStrategy> {
        let cluster = self.cluster();
        let reference = cluster
            .balancer()
            .first()
            .ok_or_else(|| ClusterError::NoAvailableBackend {
                cluster: cluster.id().to_string(),
            })?;
        let properties = cluster.metadata_cache().database_properties(&reference)?;
        let dialect = cluster.dialect();

        let (identifiers, select_for_update) = match sql {
            Some(sql) => (
                write_identifiers(cluster, &[sql])?,
                dialect.supports_select_for_update()
                    && properties.supports_select_for_update
                    && dialect.is_select_for_update(sql),
            ),
            None => (Vec::new(), false),
        };
        Ok(query_strategy(QueryTraits {
            identifiers,
            read_only: self.options.concurrency == Concurrency::ReadOnly,
            forward_only: self.options.result_set_type == ResultSetType::ForwardOnly,
            select_for_update,
            locators_update_copy: properties.locators_update_copy,
        }))
    }

    fn call<T, F>(&self, op: &'static str, statements: &[&str], f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&mut PhysicalStatement) -> BackendResult<T> + Send + Sync + 'static,
    {
        let strategy = self.strategy(op, statements)?;
        self.dispatch().invoke_first(&strategy, self.physical()?, f)
    }

    pub fn execute(&self, sql: &str) -> Result<bool> {
        let owned = sql.to_string();
        self.call("execute", &[sql], move |s| s.execute(&owned))
    }

    pub fn execute_update(&self, sql: &str) -> Result<u64> {
        let owned = sql.to_string();
        self.call("execute_update", &[sql], move |s| s.execute_update(&owned))
    }

    pub fn execute_query(&self, sql: &str) -> Result<ClusterResultSet> {
        let strategy = self.strategy("execute_query", &[sql])?;
        let owned = sql.to_string();
        let opened = self.open_result(&strategy, move |s| s.execute_query(&owned).map(Some))?;
        opened.ok_or_else(|| ClusterError::Unsupported("query produced no result set".to_string()))
    }

    /// The current result of the last execution, if it is a result set.
    pub fn result_set(&self) -> Result<Option<ClusterResultSet>> {
        let strategy = self.strategy("result_set", &[])?;
        self.open_result(&strategy, |s| s.result_set())
    }

    /// Opens a logical result set from `fetch`, lazily on one backend or
    /// copied into memory, as `strategy` says.
    fn open_result<F>(
        &self,
        strategy: &InvocationStrategy,
        fetch: F,
    ) -> Result<Option<ClusterResultSet>>
    where
        F: Fn(&mut PhysicalStatement) -> BackendResult<Option<PhysicalResultSet>>
            + Send
            + Sync
            + 'static,
    {
        let cluster = self.cluster();
        match strategy {
            InvocationStrategy::SingleRead => {
                let opened = self.dispatch().invoke(strategy, self.physical()?, move |s| {
                    match fetch(s)? {
                        Some(rs) => Ok(Some((rs.columns()?, rs))),
                        None => Ok(None),
                    }
                })?;
                let Some((backend, Some((columns, cursor)))) = opened.into_iter().next() else {
                    return Ok(None);
                };
                let id = cluster.handles().lock().insert(
                    Some(self.id),
                    Physical::ResultSet(share([(backend, cursor)].into_iter().collect())),
                )?;
                Ok(Some(ClusterResultSet::lazy(cluster.clone(), id, columns)))
            }
            InvocationStrategy::EagerRead { .. } => {
                let copied = self.dispatch().invoke(strategy, self.physical()?, move |s| {
                    fetch(s)?.map(materialize).transpose()
                })?;
                let Some((columns, rows)) = first(copied, cluster)? else {
                    return Ok(None);
                };
                let id = cluster
                    .handles()
                    .lock()
                    .insert(Some(self.id), Physical::ResultSet(PhysicalMap::new()))?;
                Ok(Some(ClusterResultSet::eager(cluster.clone(), id, columns, rows)))
            }
            other => Err(ClusterError::Unsupported(format!(
                "{other} cannot produce a result set"
            ))),
        }
    }

    pub fn add_batch(&self, sql: &str) -> Result<()> {
        let owned = sql.to_string();
        self.call("add_batch", &[], move |s| s.add_batch(&owned))?;
        self.batch.lock().push(sql.to_string());
        Ok(())
    }

    pub fn clear_batch(&self) -> Result<()> {
        self.call("clear_batch", &[], |s| s.clear_batch())?;
        self.batch.lock().clear();
        Ok(())
    }

    /// SQL accumulated by [`add_batch`](Self::add_batch) and not yet executed.
    pub fn pending_batch(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.batch.lock().clone())
    }

    /// Executes the pending batch under the locks of all its statements. The
    /// batch is cleared whether or not execution succeeds.
    pub fn execute_batch(&self) -> Result<Vec<u64>> {
        let snapshot: Arc<[String]> = self.batch.lock().clone().into();
        let statements: Vec<&str> = snapshot.iter().map(String::as_str).collect();
        let result = self.call("execute_batch", &statements, |s| s.execute_batch());
        self.batch.lock().clear();
        result
    }

    pub fn update_count(&self) -> Result<Option<u64>> {
        self.call("update_count", &[], |s| s.update_count())
    }

    /// Advances to the next result. Keeping the current result open only
    /// touches driver state; otherwise the server-side results move on every
    /// backend.
    pub fn more_results(&self, current: MoreResults) -> Result<bool> {
        self.ensure_open()?;
        let strategy = if current == MoreResults::KeepCurrent {
            InvocationStrategy::LocalWrite
        } else {
            self.strategy("more_results", &[])?
        };
        self.dispatch()
            .invoke_first(&strategy, self.physical()?, move |s| s.more_results(current))
    }

    pub fn generated_keys(&self) -> Result<Vec<Row>> {
        self.call("generated_keys", &[], |s| s.generated_keys())
    }

    pub fn warnings(&self) -> Result<Vec<String>> {
        self.call("warnings", &[], |s| s.warnings())
    }

    pub fn clear_warnings(&self) -> Result<()> {
        self.call("clear_warnings", &[], |s| s.clear_warnings())
    }

    pub fn fetch_size(&self) -> Result<usize> {
        self.call("fetch_size", &[], |s| s.fetch_size())
    }

    pub fn set_fetch_size(&self, rows: usize) -> Result<()> {
        self.call("set_fetch_size", &[], move |s| s.set_fetch_size(rows))
    }

    pub fn fetch_direction(&self) -> Result<FetchDirection> {
        self.call("fetch_direction", &[], |s| s.fetch_direction())
    }

    pub fn set_fetch_direction(&self, direction: FetchDirection) -> Result<()> {
        self.call("set_fetch_direction", &[], move |s| {
            s.set_fetch_direction(direction)
        })
    }

    pub fn max_rows(&self) -> Result<usize> {
        self.call("max_rows", &[], |s| s.max_rows())
    }

    pub fn set_max_rows(&self, rows: usize) -> Result<()> {
        self.call("set_max_rows", &[], move |s| s.set_max_rows(rows))
    }

    pub fn query_timeout(&self) -> Result<Duration> {
        self.call("query_timeout", &[], |s| s.query_timeout())
    }

    pub fn set_query_timeout(&self, timeout: Duration) -> Result<()> {
        self.call("set_query_timeout", &[], move |s| s.set_query_timeout(timeout))
    }

    pub fn set_cursor_name(&self, name: &str) -> Result<()> {
        let owned = name.to_string();
        self.call("set_cursor_name", &[], move |s| s.set_cursor_name(&owned))
    }

    pub fn result_set_type(&self) -> ResultSetType {
        self.options.result_set_type
    }

    pub fn result_set_concurrency(&self) -> Concurrency {
        self.options.concurrency
    }

    pub fn connection(&self) -> &ClusterConnection {
        &self.connection
    }

    /// Closes the statement and its open result sets.
    pub fn close(&self) -> Result<()> {
        let closing = self.cluster().handles().lock().remove(self.id);
        for physical in closing {
            physical.close();
        }
        self.batch.lock().clear();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        !self.cluster().handles().lock().contains(self.id)
    }
}
