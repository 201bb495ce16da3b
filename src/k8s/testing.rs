//! In-memory gateway for unit tests
//!
//! Records every call and answers from canned behaviour. Ephemeral tasks run
//! Pending -> Running -> Terminated over two polls unless marked stuck.

use crate::k8s::gateway::{ClusterGateway, EphemeralSpec, ExecOutput, Tunnel};
use crate::{Result, SnapError};
use async_trait::async_trait;
use bytes::Bytes;
use meshsnap_common::{CaptureTarget, TaskState};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::Instant;

#[derive(Default)]
pub struct StubGateway {
    logs: Mutex<HashMap<String, std::result::Result<Bytes, String>>>,
    task_outputs: Mutex<Vec<(String, Bytes)>>,
    exec_output: Mutex<Option<Bytes>>,
    tunnel_payload: Mutex<Option<Bytes>>,
    stuck_tasks: AtomicBool,
    failed_tasks: AtomicBool,
    reject_creates: AtomicBool,
    failing_polls: AtomicBool,
    exit_code: AtomicI32,
    polls: Mutex<HashMap<String, u32>>,

    pub created: Mutex<Vec<(Instant, EphemeralSpec)>>,
    pub deleted: Mutex<Vec<String>>,
    pub execs: Mutex<Vec<(String, Vec<String>)>>,
    pub tunnel_opens: AtomicU32,
}

impl StubGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live log stream for `container` that yields `payload` at its deadline
    pub fn with_logs(self, container: &str, payload: &str) -> Self {
        self.logs.lock().unwrap().insert(
            container.to_string(),
            Ok(Bytes::copy_from_slice(payload.as_bytes())),
        );
        self
    }

    pub fn with_failing_logs(self, container: &str) -> Self {
        self.logs
            .lock()
            .unwrap()
            .insert(container.to_string(), Err("container not found".to_string()));
        self
    }

    /// Output of any ephemeral task whose command mentions `needle`
    pub fn with_task_output(self, needle: &str, output: &[u8]) -> Self {
        self.task_outputs
            .lock()
            .unwrap()
            .push((needle.to_string(), Bytes::copy_from_slice(output)));
        self
    }

    pub fn with_exec_output(self, output: &str) -> Self {
        *self.exec_output.lock().unwrap() = Some(Bytes::copy_from_slice(output.as_bytes()));
        self
    }

    /// Tunnels answer every GET with `payload` (an empty body is allowed)
    pub fn with_tunnel_payload(self, payload: &str) -> Self {
        *self.tunnel_payload.lock().unwrap() = Some(Bytes::copy_from_slice(payload.as_bytes()));
        self
    }

    /// Ephemeral tasks run forever
    pub fn with_stuck_tasks(self) -> Self {
        self.stuck_tasks.store(true, Ordering::SeqCst);
        self
    }

    /// Ephemeral tasks end in `TaskState::Failed` instead of terminating
    pub fn with_failed_tasks(self) -> Self {
        self.failed_tasks.store(true, Ordering::SeqCst);
        self
    }

    /// Creation requests are recorded, then refused
    pub fn with_rejected_creates(self) -> Self {
        self.reject_creates.store(true, Ordering::SeqCst);
        self
    }

    /// Every state poll errors
    pub fn with_failing_polls(self) -> Self {
        self.failing_polls.store(true, Ordering::SeqCst);
        self
    }

    /// Exit code reported by terminated ephemeral tasks
    pub fn with_exit_code(self, code: i32) -> Self {
        self.exit_code.store(code, Ordering::SeqCst);
        self
    }

    pub fn created_commands(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(_, spec)| spec.command.join(" "))
            .collect()
    }

    pub fn deleted_tasks(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Creation times of tasks whose command mentions `needle`
    pub fn created_at(&self, needle: &str) -> Vec<Instant> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, spec)| spec.command.join(" ").contains(needle))
            .map(|(at, _)| *at)
            .collect()
    }

    fn command_of(&self, task_id: &str) -> Option<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|(_, spec)| spec.name == task_id)
            .map(|(_, spec)| spec.command.join(" "))
    }
}

async fn serve_once(listener: TcpListener, body: Bytes) {
    let Ok((mut conn, _)) = listener.accept().await else {
        return;
    };
    let mut request = vec![0u8; 1024];
    let _ = conn.read(&mut request).await;
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = conn.write_all(head.as_bytes()).await;
    let _ = conn.write_all(&body).await;
    let _ = conn.shutdown().await;
}

#[async_trait]
impl ClusterGateway for StubGateway {
    async fn exec_in_container(
        &self,
        _target: &CaptureTarget,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        self.execs
            .lock()
            .unwrap()
            .push((container.to_string(), command.to_vec()));

        let output = self.exec_output.lock().unwrap().clone();
        match output {
            Some(stdout) => Ok(ExecOutput {
                stdout,
                stderr: Bytes::new(),
            }),
            None => Err(SnapError::ExecutionError("command not found".to_string())),
        }
    }

    async fn stream_logs(
        &self,
        _target: &CaptureTarget,
        container: &str,
        follow: bool,
        deadline: Instant,
    ) -> Result<Bytes> {
        let behaviour = self.logs.lock().unwrap().get(container).cloned();
        match behaviour {
            Some(Ok(payload)) => {
                if follow {
                    tokio::time::sleep_until(deadline).await;
                }
                Ok(payload)
            }
            Some(Err(reason)) => Err(SnapError::LogStreamError {
                container: container.to_string(),
                reason,
            }),
            None => Err(SnapError::LogStreamError {
                container: container.to_string(),
                reason: "no logs".to_string(),
            }),
        }
    }

    async fn create_ephemeral_container(
        &self,
        _target: &CaptureTarget,
        spec: &EphemeralSpec,
    ) -> Result<String> {
        self.created
            .lock()
            .unwrap()
            .push((Instant::now(), spec.clone()));
        if self.reject_creates.load(Ordering::SeqCst) {
            return Err(SnapError::KubernetesError(
                "ephemeral containers are forbidden".to_string(),
            ));
        }
        Ok(spec.name.clone())
    }

    async fn poll_ephemeral_state(
        &self,
        _target: &CaptureTarget,
        task_id: &str,
    ) -> Result<TaskState> {
        if self.failing_polls.load(Ordering::SeqCst) {
            return Err(SnapError::KubernetesError("connection reset".to_string()));
        }
        if self.stuck_tasks.load(Ordering::SeqCst) {
            return Ok(TaskState::Running);
        }
        let mut polls = self.polls.lock().unwrap();
        let count = polls.entry(task_id.to_string()).or_insert(0);
        *count += 1;
        Ok(if *count == 1 {
            TaskState::Running
        } else if self.failed_tasks.load(Ordering::SeqCst) {
            TaskState::Failed
        } else {
            TaskState::Terminated {
                exit_code: self.exit_code.load(Ordering::SeqCst),
            }
        })
    }

    async fn fetch_ephemeral_output(&self, _target: &CaptureTarget, task_id: &str) -> Result<Bytes> {
        let command = self.command_of(task_id).unwrap_or_default();
        let output = self
            .task_outputs
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default();
        Ok(output)
    }

    async fn delete_ephemeral_container(
        &self,
        _target: &CaptureTarget,
        task_id: &str,
    ) -> Result<()> {
        self.deleted.lock().unwrap().push(task_id.to_string());
        Ok(())
    }

    async fn open_tunnel(&self, target: &CaptureTarget, port: u16) -> Result<Tunnel> {
        self.tunnel_opens.fetch_add(1, Ordering::SeqCst);

        let payload = self.tunnel_payload.lock().unwrap().clone();
        let Some(body) = payload else {
            return Err(SnapError::TunnelError(format!(
                "Port {} on {} not ready",
                port, target
            )));
        };

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        let server = tokio::spawn(serve_once(listener, body));
        Ok(Tunnel::new(local_addr, Some(server.abort_handle())))
    }
}
