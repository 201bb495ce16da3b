//! [`ClusterGateway`] backed by the Kubernetes API
//!
//! Ephemeral tasks are realised as ephemeral containers targeting the pod's
//! primary container, so they share its process and network namespaces.

use crate::k8s::client::pod_lookup_error;
use crate::k8s::gateway::{ClusterGateway, EphemeralSpec, ExecOutput, Tunnel, TUNNEL_READY_TIMEOUT};
use crate::{Result, SnapError};
use async_trait::async_trait;
use bytes::Bytes;
use k8s_openapi::api::core::v1::{ContainerStatus, EphemeralContainer, Pod, SecurityContext};
use kube::api::{Api, AttachParams, LogParams, Patch, PatchParams};
use kube::Client;
use meshsnap_common::{CaptureTarget, TaskState};
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

/// Bound on one-shot API calls (exec, pod get, log fetch, patch)
const API_CALL_TIMEOUT: Duration = Duration::from_secs(30);

const LOG_CHUNK_SIZE: usize = 8192;

/// Waiting reasons after which an ephemeral container will never start
const FATAL_WAITING_REASONS: [&str; 5] = [
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerError",
    "CreateContainerConfigError",
];

pub struct KubeGateway {
    client: Client,
    debug_image: String,
}

impl KubeGateway {
    pub fn new(client: Client, debug_image: impl Into<String>) -> Self {
        Self {
            client,
            debug_image: debug_image.into(),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_pod(&self, target: &CaptureTarget) -> Result<Pod> {
        let pods = self.pods(&target.namespace);
        timeout(API_CALL_TIMEOUT, pods.get(&target.pod_name))
            .await
            .map_err(|_| SnapError::KubernetesError(format!("Timed out getting pod {}", target)))?
            .map_err(|e| pod_lookup_error(e, &target.pod_name, &target.namespace))
    }
}

fn ephemeral_container(image: &str, target: &CaptureTarget, spec: &EphemeralSpec) -> EphemeralContainer {
    EphemeralContainer {
        name: spec.name.clone(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(bounded_command(&spec.command, spec.active_deadline)),
        target_container_name: Some(target.primary_container.clone()),
        security_context: spec.privileged.then(|| SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ephemeral containers cannot be removed from a pod, so each one kills
/// itself once its deadline passes.
fn bounded_command(command: &[String], active_deadline: Duration) -> Vec<String> {
    let secs = active_deadline.as_secs().max(1);
    let mut bounded = vec![
        "timeout".to_string(),
        "-s".to_string(),
        "KILL".to_string(),
        secs.to_string(),
    ];
    bounded.extend(command.iter().cloned());
    bounded
}

fn task_state_from_status(status: &ContainerStatus) -> TaskState {
    let Some(state) = status.state.as_ref() else {
        return TaskState::Pending;
    };

    if let Some(terminated) = &state.terminated {
        return TaskState::Terminated {
            exit_code: terminated.exit_code,
        };
    }
    if state.running.is_some() {
        return TaskState::Running;
    }
    let fatal = state
        .waiting
        .as_ref()
        .and_then(|w| w.reason.as_deref())
        .map(|reason| FATAL_WAITING_REASONS.contains(&reason))
        .unwrap_or(false);

    if fatal {
        TaskState::Failed
    } else {
        TaskState::Pending
    }
}

/// Open a log stream and read it until it ends or `deadline` passes.
///
/// Failing to open the stream in time is an error; reaching the deadline
/// while reading keeps what was read.
async fn read_log_stream<F, R>(container: &str, deadline: Instant, open: F) -> Result<Bytes>
where
    F: Future<Output = kube::Result<R>>,
    R: futures::AsyncRead,
{
    let stream_error = |reason: String| SnapError::LogStreamError {
        container: container.to_string(),
        reason,
    };

    let reader = match timeout_at(deadline, open).await {
        Ok(Ok(reader)) => reader,
        Ok(Err(e)) => return Err(stream_error(e.to_string())),
        Err(_) => return Err(stream_error("log stream did not open before the deadline".to_string())),
    };
    futures::pin_mut!(reader);

    let mut collected = Vec::new();
    let mut chunk = vec![0u8; LOG_CHUNK_SIZE];
    loop {
        match timeout_at(deadline, futures::AsyncReadExt::read(&mut reader, &mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(stream_error(e.to_string())),
            // Deadline reached: keep what was read
            Err(_) => break,
        }
    }

    Ok(Bytes::from(collected))
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn exec_in_container(
        &self,
        target: &CaptureTarget,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        let pods = self.pods(&target.namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let run = async {
            let mut attached = pods
                .exec(&target.pod_name, command.to_vec(), &params)
                .await
                .map_err(|e| {
                    SnapError::ExecutionError(format!(
                        "Failed to open exec stream in {}/{}: {}",
                        target, container, e
                    ))
                })?;

            let mut stdout_reader = attached
                .stdout()
                .ok_or_else(|| SnapError::ExecutionError("stdout not attached".to_string()))?;
            let mut stderr_reader = attached
                .stderr()
                .ok_or_else(|| SnapError::ExecutionError("stderr not attached".to_string()))?;
            let status = attached
                .take_status()
                .ok_or_else(|| SnapError::ExecutionError("exit status not attached".to_string()))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let (out, err) = tokio::join!(
                stdout_reader.read_to_end(&mut stdout),
                stderr_reader.read_to_end(&mut stderr)
            );
            out?;
            err?;

            let status = status.await;
            if let Err(e) = attached.join().await {
                debug!(error = %e, "exec session closed with error");
            }

            match status {
                Some(s) if s.status.as_deref() == Some("Success") => Ok(ExecOutput {
                    stdout: Bytes::from(stdout),
                    stderr: Bytes::from(stderr),
                }),
                Some(s) => Err(SnapError::ExecutionError(format!(
                    "{:?} in {}/{} exited unsuccessfully: {} {}",
                    command,
                    target,
                    container,
                    s.message.unwrap_or_default(),
                    String::from_utf8_lossy(&stderr).trim()
                ))),
                None => Err(SnapError::ExecutionError(format!(
                    "{:?} in {}/{} reported no exit status",
                    command, target, container
                ))),
            }
        };

        timeout(API_CALL_TIMEOUT, run).await.map_err(|_| {
            SnapError::ExecutionError(format!(
                "{:?} in {}/{} timed out after {:?}",
                command, target, container, API_CALL_TIMEOUT
            ))
        })?
    }

    async fn stream_logs(
        &self,
        target: &CaptureTarget,
        container: &str,
        follow: bool,
        deadline: Instant,
    ) -> Result<Bytes> {
        let pods = self.pods(&target.namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            follow,
            ..Default::default()
        };

        read_log_stream(container, deadline, pods.log_stream(&target.pod_name, &params)).await
    }

    async fn create_ephemeral_container(
        &self,
        target: &CaptureTarget,
        spec: &EphemeralSpec,
    ) -> Result<String> {
        let pods = self.pods(&target.namespace);
        let container = ephemeral_container(&self.debug_image, target, spec);
        let patch = serde_json::json!({
            "spec": {
                "ephemeralContainers": [container]
            }
        });

        debug!(
            pod = %target,
            task = %spec.name,
            privileged = spec.privileged,
            "Requesting ephemeral container"
        );

        timeout(
            API_CALL_TIMEOUT,
            pods.patch_ephemeral_containers(
                &target.pod_name,
                &PatchParams::default(),
                &Patch::Strategic(patch),
            ),
        )
        .await
        .map_err(|_| {
            SnapError::KubernetesError(format!(
                "Timed out requesting ephemeral container {} in {}",
                spec.name, target
            ))
        })?
        .map_err(|e| {
            SnapError::KubernetesError(format!(
                "Failed to add ephemeral container {} to {}: {}",
                spec.name, target, e
            ))
        })?;

        Ok(spec.name.clone())
    }

    async fn poll_ephemeral_state(
        &self,
        target: &CaptureTarget,
        task_id: &str,
    ) -> Result<TaskState> {
        let pod = self.get_pod(target).await?;

        let state = pod
            .status
            .as_ref()
            .and_then(|s| s.ephemeral_container_statuses.as_ref())
            .and_then(|statuses| statuses.iter().find(|s| s.name == task_id))
            .map(task_state_from_status)
            .unwrap_or(TaskState::Pending);

        Ok(state)
    }

    async fn fetch_ephemeral_output(&self, target: &CaptureTarget, task_id: &str) -> Result<Bytes> {
        let pods = self.pods(&target.namespace);
        let params = LogParams {
            container: Some(task_id.to_string()),
            ..Default::default()
        };

        let output = timeout(API_CALL_TIMEOUT, pods.logs(&target.pod_name, &params))
            .await
            .map_err(|_| SnapError::LogStreamError {
                container: task_id.to_string(),
                reason: format!("timed out after {:?}", API_CALL_TIMEOUT),
            })?
            .map_err(|e| SnapError::LogStreamError {
                container: task_id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Bytes::from(output))
    }

    async fn delete_ephemeral_container(
        &self,
        target: &CaptureTarget,
        task_id: &str,
    ) -> Result<()> {
        // The API has no removal for ephemeral containers. Retiring one means
        // confirming it is not left running past its own deadline.
        match self.poll_ephemeral_state(target, task_id).await? {
            state if state.is_finished() => {
                debug!(pod = %target, task = %task_id, state = %state, "Ephemeral container retired");
            }
            state => {
                warn!(
                    pod = %target,
                    task = %task_id,
                    state = %state,
                    "Ephemeral container still active; it will be killed by its own deadline"
                );
            }
        }
        Ok(())
    }

    async fn open_tunnel(&self, target: &CaptureTarget, port: u16) -> Result<Tunnel> {
        let pods = self.pods(&target.namespace);

        let mut forwarder = timeout(TUNNEL_READY_TIMEOUT, pods.portforward(&target.pod_name, &[port]))
            .await
            .map_err(|_| {
                SnapError::TunnelError(format!(
                    "Port {} on {} not ready within {:?}",
                    port, target, TUNNEL_READY_TIMEOUT
                ))
            })?
            .map_err(|e| {
                SnapError::TunnelError(format!("Failed to forward port {} on {}: {}", port, target, e))
            })?;

        let upstream = forwarder.take_stream(port).ok_or_else(|| {
            SnapError::TunnelError(format!("No stream for port {} on {}", port, target))
        })?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;

        // One tunnel carries exactly one local connection
        let bridge = tokio::spawn(async move {
            let mut upstream = upstream;
            match timeout(TUNNEL_READY_TIMEOUT, listener.accept()).await {
                Ok(Ok((mut conn, _))) => {
                    if let Err(e) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
                        debug!(error = %e, "Tunnel connection closed with error");
                    }
                }
                Ok(Err(e)) => debug!(error = %e, "Tunnel accept failed"),
                Err(_) => debug!("Tunnel was never used"),
            }
            drop(upstream);
            forwarder.abort();
        });

        debug!(pod = %target, port, local = %local_addr, "Tunnel ready");

        Ok(Tunnel::new(local_addr, Some(bridge.abort_handle())))
    }
}
