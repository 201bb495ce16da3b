//! The diagnostic capture engine
//!
//! Built bottom-up on [`crate::k8s::ClusterGateway`]:
//! - `ephemeral`: transient container lifecycle
//! - `endpoint`: admin endpoint retrieval with tiered fallback
//! - `logs`: concurrent log collection
//! - `artifact` and `tcpdump`: packet capture and its transfer channel
//! - `verbosity`: scoped Envoy log level changes
//! - `archive`: snapshot packaging
//! - `orchestrator`: capture cycles and rounds

pub mod archive;
pub mod artifact;
pub mod endpoint;
pub mod ephemeral;
pub mod logs;
pub mod orchestrator;
pub mod tcpdump;
pub mod verbosity;

pub use archive::build_archive;
pub use endpoint::{EndpointFetcher, EndpointResult};
pub use ephemeral::{EphemeralController, EphemeralHandle};
pub use logs::{LogArtifact, LogCollector};
pub use orchestrator::{run_capture, Schedule, SnapshotBundle, SnapshotOrchestrator};
pub use verbosity::{VerbosityController, VerbosityLease};
