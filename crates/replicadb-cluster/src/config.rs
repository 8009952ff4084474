//! Configuration for a replicated database cluster.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::BalancerKind;
use crate::dialect::DialectKind;
use crate::error::{ClusterError, Result};

/// Configuration for one logical database cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Identifier of the logical database; keys the persisted membership record.
    pub id: String,
    /// Read distribution policy.
    pub balancer: BalancerKind,
    /// SQL dialect of the backends.
    pub dialect: DialectKind,
    /// Lock sequences referenced by writes so every replica consumes the same values.
    pub sequence_detection: bool,
    /// Lock tables with identity columns targeted by inserts.
    pub identity_column_detection: bool,
    /// Worker threads for writes issued inside a manual-commit transaction.
    pub transactional_pool_size: usize,
    /// Worker threads for autocommit writes and driver-side calls.
    pub non_transactional_pool_size: usize,
    /// Deadline for one backend's share of a fan-out (ms).
    pub fan_out_timeout_ms: u64,
    /// Deadline for acquiring one named lock (ms).
    pub lock_timeout_ms: u64,
    /// Period of the background liveness sweep (ms). 0 disables it.
    pub failure_detect_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: "cluster".to_string(),
            balancer: BalancerKind::RoundRobin,
            dialect: DialectKind::Standard,
            sequence_detection: true,
            identity_column_detection: true,
            transactional_pool_size: 8,
            non_transactional_pool_size: 8,
            fan_out_timeout_ms: 30_000,
            lock_timeout_ms: 10_000,
            failure_detect_interval_ms: 0,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ClusterError::Config("id must not be empty".to_string()));
        }
        if self.transactional_pool_size == 0 {
            return Err(ClusterError::Config(
                "transactional_pool_size must be > 0".to_string(),
            ));
        }
        if self.non_transactional_pool_size == 0 {
            return Err(ClusterError::Config(
                "non_transactional_pool_size must be > 0".to_string(),
            ));
        }
        if self.fan_out_timeout_ms == 0 {
            return Err(ClusterError::Config(
                "fan_out_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(ClusterError::Config(
                "lock_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fan_out_timeout(&self) -> Duration {
        Duration::from_millis(self.fan_out_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// `None` when the background failure detector is disabled.
    pub fn failure_detect_interval(&self) -> Option<Duration> {
        (self.failure_detect_interval_ms > 0)
            .then(|| Duration::from_millis(self.failure_detect_interval_ms))
    }
}
