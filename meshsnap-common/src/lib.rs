//! Shared domain types for meshsnap
//!
//! Plain data with no dependencies, used by the capture engine and the CLI:
//! - the workload a capture cycle targets
//! - Envoy log verbosity levels
//! - ephemeral task states and endpoint fetch methods
//! - well-known mesh names and defaults

use std::fmt;

/// Admin paths captured when none are configured
pub const DEFAULT_ENDPOINTS: [&str; 5] = ["/stats", "/config_dump", "/listeners", "/clusters", "/certs"];

/// Envoy admin listener port inside the pod network namespace
pub const DEFAULT_ADMIN_PORT: u16 = 19000;

/// Sidecar container names recognised as Envoy, in lookup order
pub const SIDECAR_CONTAINERS: [&str; 2] = ["consul-dataplane", "envoy-sidecar"];

/// Container name that may never be used as the primary container
pub const DISALLOWED_PRIMARY_CONTAINER: &str = "consul-dataplane";

/// Pod annotation marking mesh-injected workloads
pub const CONNECT_INJECT_ANNOTATION: &str = "consul.hashicorp.com/connect-inject";

/// Image used for ephemeral diagnostic containers
pub const DEFAULT_DEBUG_IMAGE: &str = "nicolaka/netshoot:latest";

/// One workload instance. Immutable for the duration of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub pod_name: String,
    pub primary_container: String,
    pub extra_containers: Vec<String>,
    pub namespace: String,
}

impl CaptureTarget {
    pub fn new(
        pod_name: impl Into<String>,
        primary_container: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            pod_name: pod_name.into(),
            primary_container: primary_container.into(),
            extra_containers: Vec::new(),
            namespace: namespace.into(),
        }
    }

    pub fn with_extra_container(mut self, container: impl Into<String>) -> Self {
        self.extra_containers.push(container.into());
        self
    }

    /// Primary container followed by the extras, skipping empty names and duplicates
    pub fn log_containers(&self) -> Vec<String> {
        let mut containers: Vec<String> = Vec::new();
        for name in std::iter::once(&self.primary_container).chain(&self.extra_containers) {
            if !name.is_empty() && !containers.contains(name) {
                containers.push(name.clone());
            }
        }
        containers
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}

/// Envoy log level requested for the duration of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Envoy's stock level, restored at the end of a run
    #[default]
    Normal,
    Debug,
    Trace,
}

impl Verbosity {
    /// Level name as understood by Envoy's `/logging` admin endpoint
    pub const fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Normal => "info",
            Verbosity::Debug => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of an ephemeral diagnostic container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Terminated { exit_code: i32 },
    Failed,
}

impl TaskState {
    pub const fn is_finished(&self) -> bool {
        matches!(self, TaskState::Terminated { .. } | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Terminated { exit_code } => write!(f, "terminated (exit {})", exit_code),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// How an admin endpoint payload was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Tunnel,
    ContainerExec,
    FallbackExec,
}

impl FetchMethod {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FetchMethod::Tunnel => "tunnel",
            FetchMethod::ContainerExec => "container-exec",
            FetchMethod::FallbackExec => "fallback-exec",
        }
    }
}

impl fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
