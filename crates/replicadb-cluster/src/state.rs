//! Durable record of which backends of a cluster are active.
//!
//! Every activation and deactivation is appended as a [`MembershipEvent`].
//! At start the cluster replays the log to decide which backends to bring up.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipChange {
    Activated,
    Deactivated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub cluster: String,
    pub backend: String,
    pub change: MembershipChange,
    pub timestamp_ms: u64,
}

impl MembershipEvent {
    pub fn new(cluster: &str, backend: &str, change: MembershipChange) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            cluster: cluster.to_string(),
            backend: backend.to_string(),
            change,
            timestamp_ms,
        }
    }
}

/// Persists membership changes.
pub trait StateManager: Send + Sync {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Active backend ids last recorded for `cluster`, or `None` if nothing
    /// was ever recorded.
    fn initial_state(&self, cluster: &str) -> Result<Option<BTreeSet<String>>>;

    fn record(&self, event: &MembershipEvent) -> Result<()>;
}

fn replay<'a>(
    events: impl IntoIterator<Item = &'a MembershipEvent>,
    cluster: &str,
) -> Option<BTreeSet<String>> {
    let mut active: Option<BTreeSet<String>> = None;
    for event in events.into_iter().filter(|e| e.cluster == cluster) {
        let set = active.get_or_insert_with(BTreeSet::new);
        match event.change {
            MembershipChange::Activated => set.insert(event.backend.clone()),
            MembershipChange::Deactivated => set.remove(&event.backend),
        };
    }
    active
}

/// Keeps the membership record for the life of the process.
#[derive(Default)]
pub struct MemoryStateManager {
    events: Mutex<HashMap<String, Vec<MembershipEvent>>>,
}

impl MemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self, cluster: &str) -> Vec<MembershipEvent> {
        self.events
            .lock()
            .get(cluster)
            .cloned()
            .unwrap_or_default()
    }
}

impl StateManager for MemoryStateManager {
    fn initial_state(&self, cluster: &str) -> Result<Option<BTreeSet<String>>> {
        let events = self.events.lock();
        Ok(events.get(cluster).and_then(|log| replay(log, cluster)))
    }

    fn record(&self, event: &MembershipEvent) -> Result<()> {
        self.events
            .lock()
            .entry(event.cluster.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }
}

/// Append-only JSON-lines log, one event per line.
pub struct FileStateManager {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileStateManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?)
    }

    /// Every event in the log, oldest first.
    pub fn read_all(&self) -> Result<Vec<MembershipEvent>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }
}

impl StateManager for FileStateManager {
    fn start(&self) -> Result<()> {
        let mut file = self.file.lock();
        if file.is_none() {
            *file = Some(self.open()?);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().take() {
            file.flush()?;
        }
        Ok(())
    }

    fn initial_state(&self, cluster: &str) -> Result<Option<BTreeSet<String>>> {
        Ok(replay(&self.read_all()?, cluster))
    }

    fn record(&self, event: &MembershipEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut guard = self.file.lock();
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        if let Some(file) = guard.as_mut() {
            writeln!(file, "{line}")?;
            file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(backend: &str, change: MembershipChange) -> MembershipEvent {
        MembershipEvent::new("orders", backend, change)
    }

    #[test]
    fn test_memory_initial_state() {
        let manager = MemoryStateManager::new();
        assert_eq!(manager.initial_state("orders").unwrap(), None);

        manager.record(&event("db1", MembershipChange::Activated)).unwrap();
        manager.record(&event("db2", MembershipChange::Activated)).unwrap();
        manager.record(&event("db1", MembershipChange::Deactivated)).unwrap();

        let active = manager.initial_state("orders").unwrap().unwrap();
        assert_eq!(active.into_iter().collect::<Vec<_>>(), vec!["db2"]);
        assert_eq!(manager.initial_state("billing").unwrap(), None);
        assert_eq!(manager.events("orders").len(), 3);
    }

    #[test]
    fn test_file_log_replay_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("membership.log");

        let manager = FileStateManager::new(&path);
        manager.start().unwrap();
        manager.record(&event("db1", MembershipChange::Activated)).unwrap();
        manager.record(&event("db2", MembershipChange::Activated)).unwrap();
        manager.record(&event("db2", MembershipChange::Deactivated)).unwrap();
        manager.stop().unwrap();

        let reopened = FileStateManager::new(&path);
        let active = reopened.initial_state("orders").unwrap().unwrap();
        assert!(active.contains("db1"));
        assert!(!active.contains("db2"));
        assert_eq!(reopened.read_all().unwrap().len(), 3);
    }

    #[test]
    fn test_file_log_missing_is_empty() {
        let dir = tempdir().unwrap();
        let manager = FileStateManager::new(dir.path().join("absent.log"));
        assert_eq!(manager.initial_state("orders").unwrap(), None);
    }

    #[test]
    fn test_file_log_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("membership.log");
        std::fs::write(&path, "not json\n").unwrap();
        let manager = FileStateManager::new(&path);
        assert!(manager.initial_state("orders").is_err());
    }

    #[test]
    fn test_fully_deactivated_cluster_is_recorded_empty() {
        let manager = MemoryStateManager::new();
        manager.record(&event("db1", MembershipChange::Activated)).unwrap();
        manager.record(&event("db1", MembershipChange::Deactivated)).unwrap();
        assert_eq!(manager.initial_state("orders").unwrap(), Some(BTreeSet::new()));
    }
}
