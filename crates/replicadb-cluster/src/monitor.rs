//! Background liveness sweep over the live backend set.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::cluster::Cluster;
use crate::error::Result;

/// Runs [`Cluster::detect_failures`] every `interval` until stopped or the
/// cluster is dropped.
pub struct FailureDetector {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FailureDetector {
    pub fn spawn(cluster: Weak<Cluster>, name: &str, interval: Duration) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("replicadb-detector-{name}"))
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(cluster) = cluster.upgrade() else {
                    break;
                };
                let failed = cluster.detect_failures();
                if !failed.is_empty() {
                    tracing::debug!(cluster = %cluster.id(), ?failed, "failure sweep deactivated backends");
                }
            })?;
        Ok(Self {
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            // The last cluster reference may be released on the detector thread
            // itself; it must not join itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for FailureDetector {
    fn drop(&mut self) {
        self.stop();
    }
}
