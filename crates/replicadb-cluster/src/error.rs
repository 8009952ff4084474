//! Error types for the replicated cluster layer.

use std::time::Duration;

use thiserror::Error;

/// An error reported by one physical backend while executing an operation.
///
/// Backend errors are never handed to callers as-is: the dispatcher first runs
/// them through [`Cluster::handle_failure`](crate::cluster::Cluster::handle_failure),
/// which decides whether the failure is a topology event or an application error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    /// Vendor or ANSI SQL state, when the driver reports one.
    pub sql_state: Option<String>,
    /// True when the operation exceeded the fan-out deadline.
    pub timed_out: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: None,
            timed_out: false,
        }
    }

    pub fn with_state(message: impl Into<String>, sql_state: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sql_state: Some(sql_state.into()),
            timed_out: false,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            message: format!("operation did not complete within {} ms", after.as_millis()),
            sql_state: None,
            timed_out: true,
        }
    }
}

/// Result alias for physical backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster {cluster}: no backend available")]
    NoAvailableBackend { cluster: String },
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    #[error("backend {backend}: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },
    #[error("all backends failed, first failure on {backend}: {source}")]
    AllBackendsFailed {
        backend: String,
        #[source]
        source: BackendError,
    },
    #[error("timed out after {} ms waiting for lock {name}", .timeout.as_millis())]
    LockTimeout { name: String, timeout: Duration },
    #[error("handle is closed")]
    HandleClosed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl ClusterError {
    /// The backend error underneath this error, if it came from a backend.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::Backend { source, .. } | Self::AllBackendsFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Id of the backend this error is attributed to, if any.
    pub fn backend_id(&self) -> Option<&str> {
        match self {
            Self::Backend { backend, .. } | Self::AllBackendsFailed { backend, .. } => {
                Some(backend)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
