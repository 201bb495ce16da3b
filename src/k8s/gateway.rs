//! Remote execution primitives against the cluster control plane
//!
//! Everything the capture engine does to a pod goes through [`ClusterGateway`]:
//! one-shot exec, log streaming, ephemeral container lifecycle and single-port
//! tunnels. The trait keeps the engine testable without a cluster.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use meshsnap_common::{CaptureTarget, TaskState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Readiness bound for a port-forward tunnel
pub const TUNNEL_READY_TIMEOUT: Duration = Duration::from_secs(12);

/// Output of a one-shot remote command
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Bytes,
    pub stderr: Bytes,
}

/// Request for a transient container sharing the target's namespaces
#[derive(Debug, Clone)]
pub struct EphemeralSpec {
    /// Container name, also used as the task ID
    pub name: String,
    pub command: Vec<String>,
    pub privileged: bool,
    /// Hard bound on the container's own lifetime
    pub active_deadline: Duration,
}

/// Local endpoint of a single-port tunnel into a pod
///
/// The forwarding task is aborted when the tunnel is dropped.
#[derive(Debug)]
pub struct Tunnel {
    local_addr: SocketAddr,
    forwarder: Option<AbortHandle>,
}

impl Tunnel {
    pub fn new(local_addr: SocketAddr, forwarder: Option<AbortHandle>) -> Self {
        Self {
            local_addr,
            forwarder,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.local_addr, path)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Run a one-shot command in `container`. Nonzero exit is an `ExecutionError`.
    async fn exec_in_container(
        &self,
        target: &CaptureTarget,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput>;

    /// Read the container's log stream until it ends or `deadline` passes.
    ///
    /// Reaching the deadline is not an error: whatever was read so far is
    /// returned. A container with no accessible logs is a `LogStreamError`.
    async fn stream_logs(
        &self,
        target: &CaptureTarget,
        container: &str,
        follow: bool,
        deadline: Instant,
    ) -> Result<Bytes>;

    /// Request an ephemeral container. Returns once accepted, not once running.
    async fn create_ephemeral_container(
        &self,
        target: &CaptureTarget,
        spec: &EphemeralSpec,
    ) -> Result<String>;

    /// Non-blocking state check
    async fn poll_ephemeral_state(&self, target: &CaptureTarget, task_id: &str)
        -> Result<TaskState>;

    /// Captured output of a terminated ephemeral container
    async fn fetch_ephemeral_output(&self, target: &CaptureTarget, task_id: &str) -> Result<Bytes>;

    /// Best-effort removal. Callers log failures and never propagate them.
    async fn delete_ephemeral_container(&self, target: &CaptureTarget, task_id: &str)
        -> Result<()>;

    /// Open a tunnel to `port` in the pod, bounded by [`TUNNEL_READY_TIMEOUT`]
    async fn open_tunnel(&self, target: &CaptureTarget, port: u16) -> Result<Tunnel>;
}
