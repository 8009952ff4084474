//! Named read/write locks that serialize non-deterministic writes.
//!
//! Writes that consume auto-generated values (identity columns, sequences) hold
//! a write lock named after the table or sequence while every replica applies
//! them, so no other statement touching the same object can interleave and
//! make the replicas hand out different values.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ClusterError, Result};

/// An acquirable named lock.
pub trait Lock: Send + Sync {
    fn name(&self) -> &str;

    /// Blocks until granted or `timeout` elapses. Returns whether it was granted.
    fn try_lock_for(&self, timeout: Duration) -> bool;

    /// Releases one acquisition made by the calling thread.
    fn unlock(&self);
}

/// Issues named read/write locks.
pub trait LockManager: Send + Sync {
    fn read_lock(&self, name: &str) -> Arc<dyn Lock>;
    fn write_lock(&self, name: &str) -> Arc<dyn Lock>;
}

#[derive(Default)]
struct RwState {
    readers: usize,
    writer: Option<ThreadId>,
    /// Nested acquisitions by `writer`.
    write_depth: usize,
}

/// Reader/writer lock whose write side is reentrant for the owning thread.
#[derive(Default)]
struct NamedRwLock {
    state: Mutex<RwState>,
    released: Condvar,
}

impl NamedRwLock {
    fn acquire_read(&self, deadline: Instant) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            if state.writer.is_none() || state.writer == Some(me) {
                state.readers += 1;
                return true;
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
    }

    fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.released.notify_all();
        }
    }

    fn acquire_write(&self, deadline: Instant) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            if state.writer == Some(me) {
                state.write_depth += 1;
                return true;
            }
            if state.writer.is_none() && state.readers == 0 {
                state.writer = Some(me);
                state.write_depth = 1;
                return true;
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return false;
            }
        }
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.readers == 0 && state.writer.is_none()
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        if state.writer != Some(thread::current().id()) {
            return;
        }
        state.write_depth -= 1;
        if state.write_depth == 0 {
            state.writer = None;
            self.released.notify_all();
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

type Registry = Arc<Mutex<HashMap<String, Arc<NamedRwLock>>>>;

struct LocalLock {
    name: String,
    mode: Mode,
    inner: Arc<NamedRwLock>,
    registry: Registry,
}

impl Drop for LocalLock {
    /// Forgets the name once the registry holds the last reference to an idle
    /// lock. Handles are cloned under the registry mutex, so no new handle can
    /// appear while the count is checked.
    fn drop(&mut self) {
        let mut locks = self.registry.lock();
        let unused = locks
            .get(&self.name)
            .is_some_and(|shared| Arc::ptr_eq(shared, &self.inner) && Arc::strong_count(shared) == 2);
        if unused && self.inner.is_idle() {
            locks.remove(&self.name);
        }
    }
}

impl Lock for LocalLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_lock_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        match self.mode {
            Mode::Read => self.inner.acquire_read(deadline),
            Mode::Write => self.inner.acquire_write(deadline),
        }
    }

    fn unlock(&self) {
        match self.mode {
            Mode::Read => self.inner.release_read(),
            Mode::Write => self.inner.release_write(),
        }
    }
}

/// In-process lock manager. Locks for the same name share one underlying lock,
/// which is dropped once no handle for the name is left.
#[derive(Default)]
pub struct LocalLockManager {
    locks: Registry,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, name: &str, mode: Mode) -> Arc<dyn Lock> {
        let inner = self
            .locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        Arc::new(LocalLock {
            name: name.to_string(),
            mode,
            inner,
            registry: self.locks.clone(),
        })
    }

    /// Number of names with a live lock handle.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

impl LockManager for LocalLockManager {
    fn read_lock(&self, name: &str) -> Arc<dyn Lock> {
        self.lock_for(name, Mode::Read)
    }

    fn write_lock(&self, name: &str) -> Arc<dyn Lock> {
        self.lock_for(name, Mode::Write)
    }
}

/// Write locks held for one dispatched write. Released in reverse acquisition
/// order when dropped.
pub struct LockSet {
    held: Vec<Arc<dyn Lock>>,
}

impl LockSet {
    pub fn empty() -> Self {
        Self { held: Vec::new() }
    }

    /// Acquires a write lock per identifier in the given order.
    ///
    /// On timeout the locks already taken are released and nothing is held.
    pub fn acquire(
        manager: &dyn LockManager,
        identifiers: &[String],
        timeout: Duration,
    ) -> Result<Self> {
        let mut set = Self::empty();
        for name in identifiers {
            let lock = manager.write_lock(name);
            if !lock.try_lock_for(timeout) {
                tracing::debug!(lock = %name, "lock acquisition timed out");
                return Err(ClusterError::LockTimeout {
                    name: name.clone(),
                    timeout,
                });
            }
            tracing::trace!(lock = %name, "write lock acquired");
            set.held.push(lock);
        }
        Ok(set)
    }

    pub fn names(&self) -> Vec<&str> {
        self.held.iter().map(|l| l.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        while let Some(lock) = self.held.pop() {
            lock.unlock();
            tracing::trace!(lock = %lock.name(), "write lock released");
        }
    }
}
