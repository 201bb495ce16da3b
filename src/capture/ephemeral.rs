//! Lifecycle of transient diagnostic containers
//!
//! Each task moves `Pending -> Running` once the cluster accepts it, then to
//! `Terminated`, or to `Failed` on a gateway error, a fatal container state
//! or its deadline. Progress past acceptance is observed by polling.
//! Whatever happens, deletion is issued exactly once per task: explicitly
//! through [`EphemeralHandle::delete`], or from `Drop` when a handle is
//! abandoned mid-flight.

use crate::k8s::{ClusterGateway, EphemeralSpec};
use crate::{Result, SnapError};
use bytes::Bytes;
use meshsnap_common::{CaptureTarget, TaskState};
use rand_core::{OsRng, RngCore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_millis(400);

/// Upper bound of the random delay added to each poll
const POLL_JITTER_MS: u32 = 100;

/// Consecutive failed polls tolerated before a task is declared failed
const MAX_POLL_ERRORS: u32 = 3;

#[derive(Debug, Clone)]
pub struct EphemeralTask {
    pub id: String,
    pub target: CaptureTarget,
    pub command: Vec<String>,
    pub privileged: bool,
    pub state: TaskState,
    pub deadline: Instant,
}

impl EphemeralTask {
    fn advance(&mut self, observed: TaskState) {
        // Accepted tasks never move back to Pending
        if observed == TaskState::Pending && self.state != TaskState::Pending {
            return;
        }
        if self.state != observed {
            debug!(task = %self.id, from = %self.state, to = %observed, "Ephemeral task state changed");
            self.state = observed;
        }
    }
}

pub struct EphemeralController {
    gateway: Arc<dyn ClusterGateway>,
}

impl EphemeralController {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self { gateway }
    }

    /// Request a task and return its handle once the cluster accepts it.
    ///
    /// If the request fails the task is still deleted before returning, since
    /// a timed-out request may have been accepted remotely.
    pub async fn launch(
        &self,
        target: &CaptureTarget,
        command: Vec<String>,
        privileged: bool,
        timeout: Duration,
    ) -> Result<EphemeralHandle> {
        let deadline = Instant::now() + timeout;
        let id = format!("meshsnap-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

        let spec = EphemeralSpec {
            name: id.clone(),
            command: command.clone(),
            privileged,
            active_deadline: timeout,
        };

        let mut handle = EphemeralHandle {
            task: EphemeralTask {
                id,
                target: target.clone(),
                command,
                privileged,
                state: TaskState::Pending,
                deadline,
            },
            timeout,
            gateway: self.gateway.clone(),
            deleted: false,
        };

        let accepted = timeout_at(deadline, self.gateway.create_ephemeral_container(target, &spec)).await;
        match accepted {
            Ok(Ok(_)) => {
                handle.task.advance(TaskState::Running);
                debug!(pod = %target, task = %handle.task.id, privileged, "Ephemeral task accepted");
                Ok(handle)
            }
            Ok(Err(e)) => {
                handle.task.advance(TaskState::Failed);
                handle.delete().await;
                Err(e)
            }
            Err(_) => {
                handle.task.advance(TaskState::Failed);
                handle.delete().await;
                Err(SnapError::DeadlineExceeded {
                    task: handle.task.id.clone(),
                    timeout,
                })
            }
        }
    }

    /// Create, wait for termination, fetch output and delete, as one unit.
    pub async fn run_to_completion(
        &self,
        target: &CaptureTarget,
        command: Vec<String>,
        privileged: bool,
        timeout: Duration,
    ) -> Result<Bytes> {
        let mut handle = self.launch(target, command, privileged, timeout).await?;

        let result = async {
            match handle.wait().await? {
                TaskState::Terminated { exit_code: 0 } => handle.output().await,
                TaskState::Terminated { exit_code } => Err(SnapError::TaskFailed {
                    task: handle.task.id.clone(),
                    reason: format!("exited with code {}", exit_code),
                }),
                state => Err(SnapError::TaskFailed {
                    task: handle.task.id.clone(),
                    reason: format!("ended {}", state),
                }),
            }
        }
        .await;

        handle.delete().await;
        result
    }
}

/// Exclusive owner of one ephemeral task from acceptance to deletion
pub struct EphemeralHandle {
    task: EphemeralTask,
    timeout: Duration,
    gateway: Arc<dyn ClusterGateway>,
    deleted: bool,
}

impl EphemeralHandle {
    pub fn task(&self) -> &EphemeralTask {
        &self.task
    }

    /// Poll until the task finishes or its deadline passes
    pub async fn wait(&mut self) -> Result<TaskState> {
        let mut poll_errors = 0;

        loop {
            if Instant::now() >= self.task.deadline {
                return Err(self.deadline_exceeded());
            }

            let polled = timeout_at(
                self.task.deadline,
                self.gateway
                    .poll_ephemeral_state(&self.task.target, &self.task.id),
            )
            .await;

            match polled {
                Ok(Ok(state)) => {
                    poll_errors = 0;
                    self.task.advance(state);
                    if state.is_finished() {
                        return Ok(state);
                    }
                }
                Ok(Err(e)) => {
                    poll_errors += 1;
                    debug!(task = %self.task.id, error = %e, attempt = poll_errors, "Ephemeral task poll failed");
                    if poll_errors >= MAX_POLL_ERRORS {
                        self.task.advance(TaskState::Failed);
                        return Err(SnapError::TaskFailed {
                            task: self.task.id.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
                Err(_) => return Err(self.deadline_exceeded()),
            }

            let next_poll = Instant::now() + jittered(POLL_INTERVAL);
            sleep_until(next_poll.min(self.task.deadline)).await;
        }
    }

    pub async fn output(&self) -> Result<Bytes> {
        timeout_at(
            self.task.deadline,
            self.gateway
                .fetch_ephemeral_output(&self.task.target, &self.task.id),
        )
        .await
        .map_err(|_| SnapError::DeadlineExceeded {
            task: self.task.id.clone(),
            timeout: self.timeout,
        })?
    }

    /// Issue deletion. Only the first call reaches the cluster.
    pub async fn delete(&mut self) {
        if self.deleted {
            return;
        }
        self.deleted = true;

        match self
            .gateway
            .delete_ephemeral_container(&self.task.target, &self.task.id)
            .await
        {
            Ok(()) => debug!(task = %self.task.id, state = %self.task.state, "Ephemeral task deleted"),
            Err(e) => warn!(task = %self.task.id, error = %e, "Failed to delete ephemeral task"),
        }
    }

    fn deadline_exceeded(&mut self) -> SnapError {
        self.task.advance(TaskState::Failed);
        info!(task = %self.task.id, timeout = ?self.timeout, "Ephemeral task deadline exceeded");
        SnapError::DeadlineExceeded {
            task: self.task.id.clone(),
            timeout: self.timeout,
        }
    }
}

impl Drop for EphemeralHandle {
    fn drop(&mut self) {
        if self.deleted {
            return;
        }
        self.deleted = true;

        let gateway = self.gateway.clone();
        let target = self.task.target.clone();
        let id = self.task.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = gateway.delete_ephemeral_container(&target, &id).await {
                        warn!(task = %id, error = %e, "Failed to delete abandoned ephemeral task");
                    }
                });
            }
            Err(_) => warn!(task = %id, "No runtime left to delete abandoned ephemeral task"),
        }
    }
}

fn jittered(interval: Duration) -> Duration {
    let jitter = OsRng.next_u32() % (POLL_JITTER_MS + 1);
    interval + Duration::from_millis(jitter as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::testing::StubGateway;

    fn target() -> CaptureTarget {
        CaptureTarget::new("web-0", "app", "default")
    }

    fn command(cmd: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), cmd.to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_to_completion_returns_output_and_deletes_once() {
        let stub = Arc::new(StubGateway::new().with_task_output("echo hi", b"hi\n"));
        let controller = EphemeralController::new(stub.clone());

        let output = controller
            .run_to_completion(&target(), command("echo hi"), false, Duration::from_secs(15))
            .await
            .expect("task should complete");

        assert_eq!(&output[..], b"hi\n");
        assert_eq!(stub.created_commands().len(), 1);
        assert_eq!(stub.deleted_tasks().len(), 1);
        assert!(stub.deleted_tasks()[0].starts_with("meshsnap-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_hits_deadline_and_is_still_deleted() {
        let stub = Arc::new(StubGateway::new().with_stuck_tasks());
        let controller = EphemeralController::new(stub.clone());
        let started = Instant::now();

        let err = controller
            .run_to_completion(&target(), command("sleep 3600"), false, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, SnapError::DeadlineExceeded { .. }));
        assert!(err.is_resource_lifecycle());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(stub.deleted_tasks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_delete_is_noop() {
        let stub = Arc::new(StubGateway::new());
        let controller = EphemeralController::new(stub.clone());

        let mut handle = controller
            .launch(&target(), command("true"), false, Duration::from_secs(10))
            .await
            .expect("launch");

        handle.delete().await;
        handle.delete().await;
        drop(handle);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(stub.deleted_tasks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_handle_is_deleted_from_drop() {
        let stub = Arc::new(StubGateway::new().with_stuck_tasks());
        let controller = EphemeralController::new(stub.clone());

        let handle = controller
            .launch(&target(), command("sleep 3600"), true, Duration::from_secs(10))
            .await
            .expect("launch");
        let id = handle.task().id.clone();
        drop(handle);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(stub.deleted_tasks(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_tracks_state_transitions() {
        let stub = Arc::new(StubGateway::new());
        let controller = EphemeralController::new(stub.clone());

        let mut handle = controller
            .launch(&target(), command("true"), false, Duration::from_secs(10))
            .await
            .expect("launch");
        assert_eq!(handle.task().state, TaskState::Running);

        let state = handle.wait().await.expect("wait");
        assert_eq!(state, TaskState::Terminated { exit_code: 0 });
        assert_eq!(handle.task().state, state);

        handle.delete().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_create_is_still_deleted() {
        let stub = Arc::new(StubGateway::new().with_rejected_creates());
        let controller = EphemeralController::new(stub.clone());

        let err = controller
            .run_to_completion(&target(), command("true"), false, Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, SnapError::KubernetesError(_)));
        assert_eq!(stub.created_commands().len(), 1);
        assert_eq!(stub.deleted_tasks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonzero_exit_fails_task_and_deletes_once() {
        let stub = Arc::new(StubGateway::new().with_exit_code(2).with_task_output("false", b"oops"));
        let controller = EphemeralController::new(stub.clone());

        let err = controller
            .run_to_completion(&target(), command("false"), false, Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, SnapError::TaskFailed { ref reason, .. } if reason.contains("code 2")));
        assert!(err.is_resource_lifecycle());
        assert_eq!(stub.deleted_tasks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_poll_errors_fail_task_before_deadline() {
        let stub = Arc::new(StubGateway::new().with_failing_polls());
        let controller = EphemeralController::new(stub.clone());
        let started = Instant::now();

        let err = controller
            .run_to_completion(&target(), command("true"), false, Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, SnapError::TaskFailed { ref reason, .. } if reason.contains("connection reset")));
        // Three polls, two pauses between them
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(stub.deleted_tasks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_container_state_fails_task_and_deletes_once() {
        let stub = Arc::new(StubGateway::new().with_failed_tasks());
        let controller = EphemeralController::new(stub.clone());

        let err = controller
            .run_to_completion(&target(), command("tcpdump"), true, Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, SnapError::TaskFailed { ref reason, .. } if reason.contains("failed")));
        assert_eq!(stub.deleted_tasks().len(), 1);
    }

    #[test]
    fn test_accepted_task_does_not_regress_to_pending() {
        let mut task = EphemeralTask {
            id: "meshsnap-0001".to_string(),
            target: target(),
            command: command("true"),
            privileged: false,
            state: TaskState::Pending,
            deadline: Instant::now(),
        };

        task.advance(TaskState::Running);
        task.advance(TaskState::Pending);
        assert_eq!(task.state, TaskState::Running);

        task.advance(TaskState::Terminated { exit_code: 0 });
        assert_eq!(task.state, TaskState::Terminated { exit_code: 0 });
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jittered(POLL_INTERVAL);
            assert!(d >= POLL_INTERVAL);
            assert!(d <= POLL_INTERVAL + Duration::from_millis(POLL_JITTER_MS as u64));
        }
    }
}
