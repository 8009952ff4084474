//! Fixed worker pools that run one task per backend.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;

use crate::backend::Backend;
use crate::error::{BackendError, BackendResult, ClusterError, Result};

/// Outcome of one fan-out, keyed and ordered by backend.
pub type Outcomes<T> = BTreeMap<Arc<Backend>, BackendResult<T>>;

pub struct WorkerPool {
    name: &'static str,
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn new(name: &'static str, threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("replicadb-{name}-{i}"))
            .build()
            .map_err(|e| ClusterError::Config(format!("{name} pool: {e}")))?;
        Ok(Self { name, pool })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `op` once per target, in parallel, and waits until every task has
    /// reported or `timeout` has elapsed.
    ///
    /// A task still running at the deadline is recorded as a timeout failure
    /// for its backend. It keeps running to completion; siblings are not
    /// affected.
    pub fn fan_out<H, T, F>(
        &self,
        targets: Vec<(Arc<Backend>, H)>,
        timeout: Duration,
        op: F,
    ) -> Outcomes<T>
    where
        H: Send + 'static,
        T: Send + 'static,
        F: Fn(&Arc<Backend>, H) -> BackendResult<T> + Send + Sync + 'static,
    {
        self.run(targets, timeout, false, op)
    }

    /// Like [`fan_out`](Self::fan_out), but does not return before every task
    /// has finished. Tasks that missed the deadline are still reported as
    /// timeouts.
    ///
    /// Callers holding locks for the duration of a write use this so no task
    /// outlives them.
    pub fn fan_out_settled<H, T, F>(
        &self,
        targets: Vec<(Arc<Backend>, H)>,
        timeout: Duration,
        op: F,
    ) -> Outcomes<T>
    where
        H: Send + 'static,
        T: Send + 'static,
        F: Fn(&Arc<Backend>, H) -> BackendResult<T> + Send + Sync + 'static,
    {
        self.run(targets, timeout, true, op)
    }

    fn run<H, T, F>(
        &self,
        targets: Vec<(Arc<Backend>, H)>,
        timeout: Duration,
        settle: bool,
        op: F,
    ) -> Outcomes<T>
    where
        H: Send + 'static,
        T: Send + 'static,
        F: Fn(&Arc<Backend>, H) -> BackendResult<T> + Send + Sync + 'static,
    {
        let expected: Vec<Arc<Backend>> = targets.iter().map(|(b, _)| b.clone()).collect();
        let (tx, rx) = crossbeam_channel::bounded(targets.len().max(1));
        let op = Arc::new(op);

        for (backend, handle) in targets {
            let tx = tx.clone();
            let op = op.clone();
            self.pool.spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| op(&backend, handle)))
                    .unwrap_or_else(|_| Err(BackendError::new("backend operation panicked")));
                let _ = tx.send((backend, result));
            });
        }
        drop(tx);

        let deadline = Instant::now() + timeout;
        let mut outcomes = BTreeMap::new();
        while outcomes.len() < expected.len() {
            match rx.recv_deadline(deadline) {
                Ok((backend, result)) => {
                    outcomes.insert(backend, result);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut late = 0;
        for backend in expected {
            if !outcomes.contains_key(&backend) {
                tracing::warn!(pool = self.name, backend = %backend, "backend task missed fan-out deadline");
                outcomes.insert(backend, Err(BackendError::timeout(timeout)));
                late += 1;
            }
        }

        if settle && late > 0 {
            // Every task holds a sender, so the channel disconnects once the
            // last straggler has finished.
            let finished = rx.iter().count();
            tracing::debug!(pool = self.name, late, finished, "late backend tasks settled");
        }
        outcomes
    }
}
