//! Concurrent, deadline-bound log collection
//!
//! One worker per container, all sharing a single deadline of
//! `duration + grace`. A failing container is recorded in its artifact and
//! never cancels its siblings.

use crate::k8s::ClusterGateway;
use crate::SnapError;
use bytes::Bytes;
use meshsnap_common::CaptureTarget;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

/// Extra time a log stream gets on top of the cycle duration
pub const LOG_GRACE: Duration = Duration::from_secs(10);

/// How long past the deadline a stream may take to close before it is abandoned
const STREAM_CLOSE_MARGIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LogArtifact {
    pub container: String,
    pub payload: Bytes,
    pub failed: bool,
}

impl LogArtifact {
    fn failed(container: String) -> Self {
        Self {
            container,
            payload: Bytes::new(),
            failed: true,
        }
    }
}

pub struct LogCollector {
    gateway: Arc<dyn ClusterGateway>,
    grace: Duration,
}

impl LogCollector {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self {
            gateway,
            grace: LOG_GRACE,
        }
    }

    /// Stream every non-empty container's logs and join all workers.
    ///
    /// The map holds one artifact per requested container; failures are
    /// flagged rather than returned as an error.
    pub async fn collect_all(
        &self,
        target: &CaptureTarget,
        containers: &[String],
        duration: Duration,
    ) -> BTreeMap<String, LogArtifact> {
        let deadline = Instant::now() + duration + self.grace;
        let mut workers = JoinSet::new();
        let mut requested = Vec::new();

        for container in containers {
            if container.is_empty() || requested.contains(container) {
                continue;
            }
            requested.push(container.clone());

            let gateway = self.gateway.clone();
            let target = target.clone();
            let container = container.clone();
            workers.spawn(async move {
                info!(pod = %target, container = %container, "Starting log stream");
                let streamed = timeout_at(
                    deadline + STREAM_CLOSE_MARGIN,
                    gateway.stream_logs(&target, &container, true, deadline),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(SnapError::LogStreamError {
                        container: container.clone(),
                        reason: "stream did not close after its deadline".to_string(),
                    })
                });
                (container, streamed)
            });
        }

        let mut artifacts = BTreeMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((container, Ok(payload))) => {
                    info!(
                        pod = %target,
                        container = %container,
                        bytes = payload.len(),
                        "Collected container logs"
                    );
                    artifacts.insert(
                        container.clone(),
                        LogArtifact {
                            container,
                            payload,
                            failed: false,
                        },
                    );
                }
                Ok((container, Err(e))) => {
                    warn!(pod = %target, container = %container, error = %e, "Failed to stream logs");
                    artifacts.insert(container.clone(), LogArtifact::failed(container));
                }
                Err(e) => error!(pod = %target, error = %e, "Log worker aborted"),
            }
        }

        // Workers that panicked leave no entry of their own
        for container in requested {
            artifacts
                .entry(container.clone())
                .or_insert_with(|| LogArtifact::failed(container));
        }

        artifacts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::testing::StubGateway;

    fn target() -> CaptureTarget {
        CaptureTarget::new("web-0", "a", "default")
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_isolated_and_streams_run_concurrently() {
        let stub = Arc::new(
            StubGateway::new()
                .with_failing_logs("a")
                .with_logs("b", "hello from b\n"),
        );
        let collector = LogCollector::new(stub);
        let duration = Duration::from_secs(30);
        let started = Instant::now();

        let artifacts = collector
            .collect_all(&target(), &["a".to_string(), "b".to_string()], duration)
            .await;

        // Concurrent: one window of D + grace, not two
        assert!(started.elapsed() >= duration + LOG_GRACE);
        assert!(started.elapsed() < duration + LOG_GRACE + Duration::from_secs(1));
        assert_eq!(artifacts.len(), 2);
        assert!(artifacts["a"].failed);
        assert!(artifacts["a"].payload.is_empty());
        assert!(!artifacts["b"].failed);
        assert_eq!(&artifacts["b"].payload[..], b"hello from b\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_and_duplicate_names_skipped() {
        let stub = Arc::new(StubGateway::new().with_logs("app", "x"));
        let collector = LogCollector::new(stub);

        let artifacts = collector
            .collect_all(
                &target(),
                &["".to_string(), "app".to_string(), "app".to_string()],
                Duration::from_secs(1),
            )
            .await;

        assert_eq!(artifacts.keys().collect::<Vec<_>>(), vec!["app"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_containers_returns_immediately() {
        let collector = LogCollector::new(Arc::new(StubGateway::new()));
        let started = Instant::now();

        let artifacts = collector
            .collect_all(&target(), &[], Duration::from_secs(60))
            .await;

        assert!(artifacts.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
