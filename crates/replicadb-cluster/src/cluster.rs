//! The logical database: live membership, failure handling and shared
//! services for the handles opened on it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::backend::{Backend, Connector as _};
use crate::balancer::Balancer;
use crate::config::ClusterConfig;
use crate::dialect::Dialect;
use crate::error::{BackendError, ClusterError, Result};
use crate::executor::WorkerPool;
use crate::lock::{LocalLockManager, LockManager};
use crate::metadata::{DatabaseMetaDataCache, MetaDataCache};
use crate::monitor::FailureDetector;
use crate::sql::handle::{self, HandleTable, PhysicalConnection};
use crate::sql::invoke;
use crate::sql::ClusterConnection;
use crate::state::{MembershipChange, MembershipEvent, MemoryStateManager, StateManager};

/// Assembles a [`Cluster`] from its configuration and collaborators.
pub struct ClusterBuilder {
    config: ClusterConfig,
    backends: Vec<Arc<Backend>>,
    dialect: Option<Arc<dyn Dialect>>,
    metadata_cache: Option<Arc<dyn DatabaseMetaDataCache>>,
    lock_manager: Option<Arc<dyn LockManager>>,
    state_manager: Option<Arc<dyn StateManager>>,
}

impl ClusterBuilder {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            backends: Vec::new(),
            dialect: None,
            metadata_cache: None,
            lock_manager: None,
            state_manager: None,
        }
    }

    pub fn backend(mut self, backend: Arc<Backend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn backends(mut self, backends: impl IntoIterator<Item = Arc<Backend>>) -> Self {
        self.backends.extend(backends);
        self
    }

    /// Overrides the dialect named by the configuration.
    pub fn dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = Some(dialect);
        self
    }

    pub fn metadata_cache(mut self, cache: Arc<dyn DatabaseMetaDataCache>) -> Self {
        self.metadata_cache = Some(cache);
        self
    }

    pub fn lock_manager(mut self, manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = Some(manager);
        self
    }

    pub fn state_manager(mut self, manager: Arc<dyn StateManager>) -> Self {
        self.state_manager = Some(manager);
        self
    }

    pub fn build(self) -> Result<Arc<Cluster>> {
        self.config.validate()?;
        if self.backends.is_empty() {
            return Err(ClusterError::Config(format!(
                "cluster {} has no backends",
                self.config.id
            )));
        }
        let mut backends = BTreeMap::new();
        for backend in self.backends {
            let id = backend.id().to_string();
            if backends.insert(id.clone(), backend).is_some() {
                return Err(ClusterError::Config(format!("duplicate backend id {id}")));
            }
        }

        let transactional = WorkerPool::new("txn", self.config.transactional_pool_size)?;
        let non_transactional = WorkerPool::new("io", self.config.non_transactional_pool_size)?;

        Ok(Arc::new(Cluster {
            balancer: Balancer::new(self.config.balancer.policy()),
            dialect: self.dialect.unwrap_or_else(|| self.config.dialect.dialect()),
            metadata_cache: self
                .metadata_cache
                .unwrap_or_else(|| Arc::new(MetaDataCache::default())),
            lock_manager: RwLock::new(
                self.lock_manager
                    .unwrap_or_else(|| Arc::new(LocalLockManager::new())),
            ),
            state_manager: RwLock::new(
                self.state_manager
                    .unwrap_or_else(|| Arc::new(MemoryStateManager::new())),
            ),
            backends,
            transactional,
            non_transactional,
            handles: Mutex::new(HandleTable::new()),
            detector: Mutex::new(None),
            config: self.config,
        }))
    }
}

/// One logical database backed by a set of replicas.
pub struct Cluster {
    config: ClusterConfig,
    backends: BTreeMap<String, Arc<Backend>>,
    balancer: Balancer,
    dialect: Arc<dyn Dialect>,
    metadata_cache: Arc<dyn DatabaseMetaDataCache>,
    lock_manager: RwLock<Arc<dyn LockManager>>,
    state_manager: RwLock<Arc<dyn StateManager>>,
    transactional: WorkerPool,
    non_transactional: WorkerPool,
    handles: Mutex<HandleTable>,
    detector: Mutex<Option<FailureDetector>>,
}

impl Cluster {
    pub fn builder(config: ClusterConfig) -> ClusterBuilder {
        ClusterBuilder::new(config)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Brings up the backends named by the persisted membership record, or
    /// all registered backends when nothing was recorded.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let state_manager = self.state_manager();
        state_manager.start()?;
        let recorded = state_manager.initial_state(self.id())?;
        if let Some(active) = &recorded {
            for id in active.iter().filter(|id| !self.backends.contains_key(*id)) {
                tracing::warn!(cluster = %self.id(), backend = %id, "recorded backend is not registered");
            }
        }
        for backend in self.backends.values() {
            let wanted = recorded
                .as_ref()
                .map_or(true, |active| active.contains(backend.id()));
            if wanted {
                self.activate(backend);
            }
        }

        let mut detector = self.detector.lock();
        if detector.is_none() {
            if let Some(interval) = self.config.failure_detect_interval() {
                *detector = Some(FailureDetector::spawn(
                    Arc::downgrade(self),
                    self.id(),
                    interval,
                )?);
            }
        }
        tracing::info!(cluster = %self.id(), live = self.balancer.len(), "cluster started");
        Ok(())
    }

    /// Stops the failure detector and the state manager. The live set is
    /// emptied without recording, so the next start replays the record.
    pub fn stop(&self) -> Result<()> {
        if let Some(mut detector) = self.detector.lock().take() {
            detector.stop();
        }
        for backend in self.balancer.list() {
            self.balancer.remove(&backend);
        }
        self.state_manager().stop()?;
        tracing::info!(cluster = %self.id(), "cluster stopped");
        Ok(())
    }

    /// Registered backend by id.
    pub fn database(&self, id: &str) -> Result<Arc<Backend>> {
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownBackend(id.to_string()))
    }

    /// All registered backends, live or not, in id order.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.values().cloned().collect()
    }

    /// Returns whether `backend` became live. Unregistered backends are refused.
    pub fn activate(&self, backend: &Backend) -> bool {
        let Some(registered) = self.backends.get(backend.id()) else {
            tracing::warn!(cluster = %self.id(), backend = %backend, "activation of unregistered backend refused");
            return false;
        };
        if !self.balancer.add(registered.clone()) {
            return false;
        }
        tracing::info!(cluster = %self.id(), backend = %backend, "backend activated");
        self.record(backend, MembershipChange::Activated);
        true
    }

    /// Returns whether `backend` left the live set.
    pub fn deactivate(&self, backend: &Backend) -> bool {
        if !self.balancer.remove(backend) {
            return false;
        }
        tracing::info!(cluster = %self.id(), backend = %backend, "backend deactivated");
        self.record(backend, MembershipChange::Deactivated);
        true
    }

    fn record(&self, backend: &Backend, change: MembershipChange) {
        let event = MembershipEvent::new(self.id(), backend.id(), change);
        if let Err(e) = self.state_manager().record(&event) {
            tracing::error!(cluster = %self.id(), backend = %backend, error = %e, "membership change not persisted");
        }
    }

    pub fn is_alive(&self, backend: &Backend) -> bool {
        backend.connector().is_alive()
    }

    /// Classifies a backend failure.
    ///
    /// A backend that no longer answers the liveness probe is deactivated and
    /// the failure is swallowed. A live backend produced an application error,
    /// which is returned.
    pub fn handle_failure(&self, backend: &Backend, cause: BackendError) -> Result<()> {
        if self.is_alive(backend) {
            return Err(ClusterError::Backend {
                backend: backend.id().to_string(),
                source: cause,
            });
        }
        if self.deactivate(backend) {
            tracing::error!(cluster = %self.id(), backend = %backend, error = %cause, "backend failed and was deactivated");
        }
        Ok(())
    }

    /// Probes every live backend and deactivates the dead ones. Returns the
    /// ids deactivated by this sweep.
    pub fn detect_failures(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for backend in self.balancer.list() {
            if self.is_alive(&backend) || !self.deactivate(&backend) {
                continue;
            }
            tracing::error!(cluster = %self.id(), backend = %backend, "backend failed liveness probe and was deactivated");
            failed.push(backend.id().to_string());
        }
        failed
    }

    pub fn balancer(&self) -> &Balancer {
        &self.balancer
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn metadata_cache(&self) -> &Arc<dyn DatabaseMetaDataCache> {
        &self.metadata_cache
    }

    pub fn lock_manager(&self) -> Arc<dyn LockManager> {
        self.lock_manager.read().clone()
    }

    pub fn set_lock_manager(&self, manager: Arc<dyn LockManager>) {
        *self.lock_manager.write() = manager;
    }

    pub fn state_manager(&self) -> Arc<dyn StateManager> {
        self.state_manager.read().clone()
    }

    pub fn set_state_manager(&self, manager: Arc<dyn StateManager>) {
        *self.state_manager.write() = manager;
    }

    pub fn is_sequence_detection_enabled(&self) -> bool {
        self.config.sequence_detection
    }

    pub fn is_identity_column_detection_enabled(&self) -> bool {
        self.config.identity_column_detection
    }

    pub(crate) fn transactional_pool(&self) -> &WorkerPool {
        &self.transactional
    }

    pub(crate) fn non_transactional_pool(&self) -> &WorkerPool {
        &self.non_transactional
    }

    pub fn fan_out_timeout(&self) -> Duration {
        self.config.fan_out_timeout()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.config.lock_timeout()
    }

    pub(crate) fn handles(&self) -> &Mutex<HandleTable> {
        &self.handles
    }

    /// Number of logical handles currently open on this cluster.
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// Opens a logical connection with one physical connection per live backend.
    pub fn connect(self: &Arc<Self>) -> Result<ClusterConnection> {
        let live = self.balancer.list();
        if live.is_empty() {
            return Err(ClusterError::NoAvailableBackend {
                cluster: self.id().to_string(),
            });
        }
        let targets = live.into_iter().map(|b| (b, ())).collect();
        let outcomes = self.non_transactional.fan_out(
            targets,
            self.fan_out_timeout(),
            |backend: &Arc<Backend>, ()| backend.connector().connect(),
        );
        let connections: BTreeMap<Arc<Backend>, PhysicalConnection> =
            invoke::reconcile(self, outcomes, false)?;
        let id = self
            .handles
            .lock()
            .insert(None, handle::Physical::Connection(handle::share(connections)))?;
        tracing::debug!(cluster = %self.id(), handle = ?id, "connection opened");
        Ok(ClusterConnection::new(self.clone(), id))
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Some(mut detector) = self.detector.get_mut().take() {
            detector.stop();
        }
    }
}
