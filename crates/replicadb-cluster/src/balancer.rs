//! Live backend set and read distribution.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;

/// Read distribution policy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    /// Always read from the reference (lowest id) backend.
    Simple,
    /// Weighted random choice.
    Random,
    /// Cycle through the live set.
    RoundRobin,
    /// Backend with the fewest reads in flight.
    Load,
}

impl BalancerKind {
    pub fn policy(self) -> Box<dyn ReadPolicy> {
        match self {
            BalancerKind::Simple => Box::new(SimplePolicy),
            BalancerKind::Random => Box::new(RandomPolicy),
            BalancerKind::RoundRobin => Box::new(RoundRobinPolicy::default()),
            BalancerKind::Load => Box::new(LoadPolicy::default()),
        }
    }
}

/// Chooses the backend for a single-backend read.
///
/// `live` is the sorted live set, never empty. Implementations must return one
/// of its members.
pub trait ReadPolicy: Send + Sync {
    fn select(&self, live: &[Arc<Backend>]) -> Arc<Backend>;

    fn before_operation(&self, _backend: &Backend) {}

    fn after_operation(&self, _backend: &Backend) {}
}

pub struct SimplePolicy;

impl ReadPolicy for SimplePolicy {
    fn select(&self, live: &[Arc<Backend>]) -> Arc<Backend> {
        live[0].clone()
    }
}

pub struct RandomPolicy;

impl ReadPolicy for RandomPolicy {
    fn select(&self, live: &[Arc<Backend>]) -> Arc<Backend> {
        let total: u64 = live.iter().map(|b| u64::from(b.weight())).sum();
        if total == 0 {
            return live[fastrand::usize(..live.len())].clone();
        }
        let mut ticket = fastrand::u64(..total);
        for backend in live {
            let weight = u64::from(backend.weight());
            if ticket < weight {
                return backend.clone();
            }
            ticket -= weight;
        }
        live[live.len() - 1].clone()
    }
}

#[derive(Default)]
pub struct RoundRobinPolicy {
    next: AtomicUsize,
}

impl ReadPolicy for RoundRobinPolicy {
    fn select(&self, live: &[Arc<Backend>]) -> Arc<Backend> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        live[n % live.len()].clone()
    }
}

/// Picks the backend with the fewest in-flight reads, ties broken by id.
#[derive(Default)]
pub struct LoadPolicy {
    in_flight: Mutex<HashMap<String, usize>>,
}

impl ReadPolicy for LoadPolicy {
    fn select(&self, live: &[Arc<Backend>]) -> Arc<Backend> {
        let in_flight = self.in_flight.lock();
        live.iter()
            .min_by_key(|b| in_flight.get(b.id()).copied().unwrap_or(0))
            .unwrap_or(&live[0])
            .clone()
    }

    fn before_operation(&self, backend: &Backend) {
        *self
            .in_flight
            .lock()
            .entry(backend.id().to_string())
            .or_default() += 1;
    }

    fn after_operation(&self, backend: &Backend) {
        let mut in_flight = self.in_flight.lock();
        if let Some(count) = in_flight.get_mut(backend.id()) {
            *count = count.saturating_sub(1);
        }
    }
}

/// The live backend set of one cluster.
///
/// Membership changes and snapshots share one critical section, so a snapshot
/// never observes a half-applied change.
pub struct Balancer {
    live: Mutex<BTreeSet<Arc<Backend>>>,
    policy: Box<dyn ReadPolicy>,
}

impl Balancer {
    pub fn new(policy: Box<dyn ReadPolicy>) -> Self {
        Self {
            live: Mutex::new(BTreeSet::new()),
            policy,
        }
    }

    /// Returns true if `backend` was not already live.
    pub fn add(&self, backend: Arc<Backend>) -> bool {
        self.live.lock().insert(backend)
    }

    /// Returns true if `backend` was live.
    pub fn remove(&self, backend: &Backend) -> bool {
        self.live.lock().remove(backend)
    }

    pub fn contains(&self, backend: &Backend) -> bool {
        self.live.lock().contains(backend)
    }

    /// The reference backend: lowest id in the live set.
    pub fn first(&self) -> Option<Arc<Backend>> {
        self.live.lock().first().cloned()
    }

    /// Sorted point-in-time snapshot of the live set.
    pub fn list(&self) -> Vec<Arc<Backend>> {
        self.live.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    /// One live backend for a read, or `None` when nothing is live.
    pub fn select_for_read(&self) -> Option<Arc<Backend>> {
        let live = self.list();
        if live.is_empty() {
            return None;
        }
        Some(self.policy.select(&live))
    }

    pub fn before_operation(&self, backend: &Backend) {
        self.policy.before_operation(backend);
    }

    pub fn after_operation(&self, backend: &Backend) {
        self.policy.after_operation(backend);
    }
}
