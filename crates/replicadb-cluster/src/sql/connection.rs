use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{Connection as _, StatementOptions};
use crate::cluster::Cluster;
use crate::error::{ClusterError, Result};
use crate::sql::handle::{share, HandleId, Physical, PhysicalConnection, PhysicalMap};
use crate::sql::invoke::{live_physical, Dispatch};
use crate::sql::strategy::{operation_kind, HandleKind, InvocationStrategy, OperationKind};
use crate::sql::ClusterStatement;

struct ConnectionState {
    id: HandleId,
    auto_commit: AtomicBool,
    read_only: AtomicBool,
}

/// A logical connection: one physical connection per live backend.
///
/// Clones share the same logical connection. Dropping a clone does not close
/// it; call [`close`](Self::close).
#[derive(Clone)]
pub struct ClusterConnection {
    cluster: Arc<Cluster>,
    state: Arc<ConnectionState>,
}

impl ClusterConnection {
    pub(crate) fn new(cluster: Arc<Cluster>, id: HandleId) -> Self {
        Self {
            cluster,
            state: Arc::new(ConnectionState {
                id,
                auto_commit: AtomicBool::new(true),
                read_only: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> HandleId {
        self.state.id
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    fn strategy(&self, op: &'static str) -> InvocationStrategy {
        let strategy = match operation_kind(HandleKind::Connection, op) {
            OperationKind::LocalRead => InvocationStrategy::LocalRead,
            OperationKind::LocalWrite => InvocationStrategy::LocalWrite,
            OperationKind::Write | OperationKind::Query => InvocationStrategy::LockedWrite {
                identifiers: Vec::new(),
            },
            OperationKind::Structural => InvocationStrategy::Structural,
        };
        tracing::debug!(cluster = %self.cluster.id(), handle = ?self.id(), op, %strategy, "connection call");
        strategy
    }

    fn physical(&self) -> Result<PhysicalMap<PhysicalConnection>> {
        live_physical(&self.cluster, self.id())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClusterError::HandleClosed);
        }
        Ok(())
    }

    pub fn create_statement(&self) -> Result<ClusterStatement> {
        self.create_statement_with(StatementOptions::default())
    }

    pub fn create_statement_with(&self, options: StatementOptions) -> Result<ClusterStatement> {
        let strategy = self.strategy("create_statement");
        let created = Dispatch::driver(&self.cluster).invoke(
            &strategy,
            self.physical()?,
            move |conn: &mut PhysicalConnection| conn.create_statement(options),
        )?;
        let id = self
            .cluster
            .handles()
            .lock()
            .insert(Some(self.id()), Physical::Statement(share(created)))?;
        Ok(ClusterStatement::new(self.clone(), id, options))
    }

    pub fn auto_commit(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.state.auto_commit.load(Ordering::Acquire))
    }

    /// Current mode without the closed check, for dispatch decisions.
    pub(crate) fn auto_commit_mode(&self) -> bool {
        self.state.auto_commit.load(Ordering::Acquire)
    }

    pub fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        let strategy = self.strategy("set_auto_commit");
        Dispatch::driver(&self.cluster).invoke(
            &strategy,
            self.physical()?,
            move |conn: &mut PhysicalConnection| conn.set_auto_commit(auto_commit),
        )?;
        self.state.auto_commit.store(auto_commit, Ordering::Release);
        Ok(())
    }

    pub fn is_read_only(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.state.read_only.load(Ordering::Acquire))
    }

    pub fn set_read_only(&self, read_only: bool) -> Result<()> {
        let strategy = self.strategy("set_read_only");
        Dispatch::driver(&self.cluster).invoke(
            &strategy,
            self.physical()?,
            move |conn: &mut PhysicalConnection| conn.set_read_only(read_only),
        )?;
        self.state.read_only.store(read_only, Ordering::Release);
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let strategy = self.strategy("commit");
        Dispatch::completion(&self.cluster).invoke(
            &strategy,
            self.physical()?,
            |conn: &mut PhysicalConnection| conn.commit(),
        )?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        let strategy = self.strategy("rollback");
        Dispatch::completion(&self.cluster).invoke(
            &strategy,
            self.physical()?,
            |conn: &mut PhysicalConnection| conn.rollback(),
        )?;
        Ok(())
    }

    /// Closes the connection and every statement and result set opened on it.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let closing = self.cluster.handles().lock().remove(self.id());
        for physical in closing {
            physical.close();
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        !self.cluster.handles().lock().contains(self.id())
    }
}
