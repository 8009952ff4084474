//! Executes an [`InvocationStrategy`] against the physical handles of one
//! logical handle and reconciles the per-backend outcomes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::backend::Backend;
use crate::cluster::Cluster;
use crate::error::{BackendResult, ClusterError, Result};
use crate::executor::{Outcomes, WorkerPool};
use crate::lock::LockSet;
use crate::sql::handle::{close_all, HandleId, PhysicalKind, PhysicalMap, Shared};
use crate::sql::strategy::InvocationStrategy;

/// Folds per-backend outcomes into the successful values.
///
/// Inside a manual-commit transaction the first failure is returned as is:
/// the backend is not probed and stays live. Otherwise every failure goes
/// through [`Cluster::handle_failure`]. If another backend succeeded, a
/// failing backend that is still alive has diverged and is deactivated. If
/// none succeeded, the first application error in backend order is returned,
/// or [`ClusterError::AllBackendsFailed`] when every backend was dead.
pub fn reconcile<T>(
    cluster: &Cluster,
    outcomes: Outcomes<T>,
    in_transaction: bool,
) -> Result<BTreeMap<Arc<Backend>, T>> {
    let mut successes = BTreeMap::new();
    let mut failures = Vec::new();
    for (backend, outcome) in outcomes {
        match outcome {
            Ok(value) => {
                successes.insert(backend, value);
            }
            Err(e) => failures.push((backend, e)),
        }
    }

    if in_transaction {
        if let Some((backend, source)) = failures.into_iter().next() {
            return Err(ClusterError::Backend {
                backend: backend.id().to_string(),
                source,
            });
        }
        return Ok(successes);
    }

    let mut first_raised = None;
    let mut first_failure = None;
    for (backend, cause) in failures {
        if first_failure.is_none() {
            first_failure = Some((backend.id().to_string(), cause.clone()));
        }
        let Err(raised) = cluster.handle_failure(&backend, cause) else {
            continue;
        };
        if !successes.is_empty() {
            if cluster.deactivate(&backend) {
                tracing::warn!(cluster = %cluster.id(), backend = %backend, error = %raised, "backend diverged from the cluster and was deactivated");
            }
        } else if first_raised.is_none() {
            first_raised = Some(raised);
        }
    }

    if !successes.is_empty() {
        return Ok(successes);
    }
    if let Some(raised) = first_raised {
        return Err(raised);
    }
    match first_failure {
        Some((backend, source)) => Err(ClusterError::AllBackendsFailed { backend, source }),
        None => Err(ClusterError::NoAvailableBackend {
            cluster: cluster.id().to_string(),
        }),
    }
}

/// Takes the value of the reference (first) backend.
pub fn first<T>(values: BTreeMap<Arc<Backend>, T>, cluster: &Cluster) -> Result<T> {
    values
        .into_values()
        .next()
        .ok_or_else(|| ClusterError::NoAvailableBackend {
            cluster: cluster.id().to_string(),
        })
}

/// Current physical handles of `id`, minus those whose backend left the live
/// set. The pruned handles are closed here, outside the table lock.
pub fn live_physical<P: PhysicalKind>(cluster: &Cluster, id: HandleId) -> Result<PhysicalMap<P>> {
    let live: BTreeSet<Arc<Backend>> = cluster.balancer().list().into_iter().collect();
    let (map, stale) = {
        let mut table = cluster.handles().lock();
        let stale = table.prune::<P>(id, |b| live.contains(b))?;
        (table.physical::<P>(id)?, stale)
    };
    if !stale.is_empty() {
        tracing::debug!(cluster = %cluster.id(), handle = ?id, kind = P::NAME, pruned = stale.len(), "dropping handles of inactive backends");
        close_all(stale);
    }
    if map.is_empty() {
        return Err(ClusterError::NoAvailableBackend {
            cluster: cluster.id().to_string(),
        });
    }
    Ok(map)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    Transactional,
    NonTransactional,
}

/// Dispatch context of one call: which pool writes run on and whether the
/// owning connection is inside a manual-commit transaction.
pub struct Dispatch<'a> {
    cluster: &'a Cluster,
    pool: Pool,
    in_transaction: bool,
}

impl<'a> Dispatch<'a> {
    /// Connection-level driver calls.
    pub fn driver(cluster: &'a Cluster) -> Self {
        Self {
            cluster,
            pool: Pool::NonTransactional,
            in_transaction: false,
        }
    }

    /// Statement calls on a connection in the given commit mode.
    pub fn statement(cluster: &'a Cluster, auto_commit: bool) -> Self {
        Self {
            cluster,
            pool: if auto_commit {
                Pool::NonTransactional
            } else {
                Pool::Transactional
            },
            in_transaction: !auto_commit,
        }
    }

    /// Commit and rollback. A backend that fails to complete while others
    /// succeeded has diverged, so failures are reconciled normally.
    pub fn completion(cluster: &'a Cluster) -> Self {
        Self {
            cluster,
            pool: Pool::Transactional,
            in_transaction: false,
        }
    }

    fn write_pool(&self) -> &WorkerPool {
        match self.pool {
            Pool::Transactional => self.cluster.transactional_pool(),
            Pool::NonTransactional => self.cluster.non_transactional_pool(),
        }
    }

    /// Runs `op` per `strategy` and returns the surviving values by backend.
    pub fn invoke<P, T, F>(
        &self,
        strategy: &InvocationStrategy,
        physical: PhysicalMap<P>,
        op: F,
    ) -> Result<BTreeMap<Arc<Backend>, T>>
    where
        P: PhysicalKind,
        T: Send + 'static,
        F: Fn(&mut P) -> BackendResult<T> + Send + Sync + 'static,
    {
        match strategy {
            InvocationStrategy::LocalRead => self.local_read(physical, op),
            InvocationStrategy::LocalWrite => {
                self.fan_out(self.cluster.non_transactional_pool(), physical, op)
            }
            InvocationStrategy::LockedWrite { identifiers }
            | InvocationStrategy::EagerRead {
                all_backends: true,
                identifiers,
            } => self.locked(identifiers, physical, op),
            InvocationStrategy::SingleRead
            | InvocationStrategy::EagerRead {
                all_backends: false,
                ..
            } => self.single_read(physical, op),
            InvocationStrategy::Structural => Err(ClusterError::Unsupported(
                "structural operations are not dispatched".to_string(),
            )),
        }
    }

    /// Like [`invoke`](Self::invoke), keeping only the reference value.
    pub fn invoke_first<P, T, F>(
        &self,
        strategy: &InvocationStrategy,
        physical: PhysicalMap<P>,
        op: F,
    ) -> Result<T>
    where
        P: PhysicalKind,
        T: Send + 'static,
        F: Fn(&mut P) -> BackendResult<T> + Send + Sync + 'static,
    {
        first(self.invoke(strategy, physical, op)?, self.cluster)
    }

    fn local_read<P, T, F>(&self, physical: PhysicalMap<P>, op: F) -> Result<BTreeMap<Arc<Backend>, T>>
    where
        P: PhysicalKind,
        F: Fn(&mut P) -> BackendResult<T>,
    {
        let Some((backend, shared)) = physical.into_iter().next() else {
            return Err(ClusterError::NoAvailableBackend {
                cluster: self.cluster.id().to_string(),
            });
        };
        let result = op(&mut *shared.lock());
        match result {
            Ok(value) => Ok(BTreeMap::from([(backend, value)])),
            Err(source) => Err(ClusterError::Backend {
                backend: backend.id().to_string(),
                source,
            }),
        }
    }

    fn fan_out<P, T, F>(
        &self,
        pool: &WorkerPool,
        physical: PhysicalMap<P>,
        op: F,
    ) -> Result<BTreeMap<Arc<Backend>, T>>
    where
        P: PhysicalKind,
        T: Send + 'static,
        F: Fn(&mut P) -> BackendResult<T> + Send + Sync + 'static,
    {
        let outcomes = pool.fan_out(
            physical.into_iter().collect(),
            self.cluster.fan_out_timeout(),
            move |_, shared| op(&mut *shared.lock()),
        );
        reconcile(self.cluster, outcomes, self.in_transaction)
    }

    fn locked<P, T, F>(
        &self,
        identifiers: &[String],
        physical: PhysicalMap<P>,
        op: F,
    ) -> Result<BTreeMap<Arc<Backend>, T>>
    where
        P: PhysicalKind,
        T: Send + 'static,
        F: Fn(&mut P) -> BackendResult<T> + Send + Sync + 'static,
    {
        let locks = LockSet::acquire(
            self.cluster.lock_manager().as_ref(),
            identifiers,
            self.cluster.lock_timeout(),
        )?;
        let targets: Vec<_> = physical.into_iter().collect();
        let timeout = self.cluster.fan_out_timeout();
        let op = move |_: &Arc<Backend>, shared: Shared<P>| op(&mut *shared.lock());
        // Late tasks are still applying the write, so the locks stay held
        // until every backend has finished.
        let outcomes = if locks.is_empty() {
            self.write_pool().fan_out(targets, timeout, op)
        } else {
            self.write_pool().fan_out_settled(targets, timeout, op)
        };
        drop(locks);
        reconcile(self.cluster, outcomes, self.in_transaction)
    }

    /// Runs `op` on one selected backend on the calling thread. A backend that
    /// fails and turns out dead is skipped and the next one is tried.
    fn single_read<P, T, F>(
        &self,
        mut physical: PhysicalMap<P>,
        op: F,
    ) -> Result<BTreeMap<Arc<Backend>, T>>
    where
        P: PhysicalKind,
        F: Fn(&mut P) -> BackendResult<T>,
    {
        let balancer = self.cluster.balancer();
        loop {
            let selected = balancer
                .select_for_read()
                .filter(|b| physical.contains_key(b))
                .or_else(|| {
                    physical
                        .keys()
                        .find(|b| balancer.contains(b))
                        .cloned()
                });
            let Some(backend) = selected else {
                return Err(ClusterError::NoAvailableBackend {
                    cluster: self.cluster.id().to_string(),
                });
            };
            let Some(shared) = physical.remove(&backend) else {
                continue;
            };

            balancer.before_operation(&backend);
            let result = op(&mut *shared.lock());
            balancer.after_operation(&backend);

            match result {
                Ok(value) => return Ok(BTreeMap::from([(backend, value)])),
                Err(cause) => {
                    self.cluster.handle_failure(&backend, cause)?;
                    tracing::debug!(cluster = %self.cluster.id(), backend = %backend, "retrying read on another backend");
                }
            }
        }
    }
}
