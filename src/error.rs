use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapError {
    #[error("Kubernetes error: {0}")]
    KubernetesError(String),

    #[error("Pod not found: {name} in namespace {namespace}")]
    PodNotFound { name: String, namespace: String },

    #[error("Remote execution failed: {0}")]
    ExecutionError(String),

    #[error("Log stream for container {container} failed: {reason}")]
    LogStreamError { container: String, reason: String },

    #[error("Tunnel error: {0}")]
    TunnelError(String),

    #[error("Ephemeral task {task} did not finish within {timeout:?}")]
    DeadlineExceeded { task: String, timeout: Duration },

    #[error("Ephemeral task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error("Failed to capture {endpoint} after {attempts} attempts")]
    CaptureError { endpoint: String, attempts: u32 },

    #[error("Failed to decode artifact: {0}")]
    DecodeError(String),

    #[error("Archive error: {0}")]
    ArchiveError(String),

    #[error("Configuration error: {0}")]
    ConfigValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SnapError {
    /// Remote hiccups that a retry policy may absorb
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SnapError::KubernetesError(_)
                | SnapError::ExecutionError(_)
                | SnapError::LogStreamError { .. }
                | SnapError::TunnelError(_)
        )
    }

    /// Ephemeral container never reached a usable state in time
    pub fn is_resource_lifecycle(&self) -> bool {
        matches!(
            self,
            SnapError::DeadlineExceeded { .. } | SnapError::TaskFailed { .. }
        )
    }
}

impl From<kube::Error> for SnapError {
    fn from(e: kube::Error) -> Self {
        SnapError::KubernetesError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SnapError>;
