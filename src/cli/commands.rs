use crate::capture::{run_capture, SnapshotOrchestrator};
use crate::cli::{CaptureArgs, Commands};
use crate::config::validate_primary_container;
use crate::k8s::{K8sClient, KubeGateway};
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Capture(args) => handle_capture(args).await,
    }
}

async fn handle_capture(args: CaptureArgs) -> Result<()> {
    let config = args.to_config();
    config.validate()?;
    validate_primary_container(&args.container)?;

    info!(
        namespace = %args.namespace,
        pod = args.pod.as_deref().unwrap_or("<connect-injected>"),
        container = %args.container,
        endpoints = ?config.endpoints,
        tcpdump = config.tcpdump_enabled,
        verbosity = %config.verbosity,
        "Capture requested"
    );

    let client = K8sClient::try_default().await?;
    let targets = client
        .discover_targets(args.pod.as_deref(), &args.container, &args.namespace)
        .await?;
    if targets.is_empty() {
        warn!(namespace = %args.namespace, "No pods with an Envoy sidecar found");
        return Ok(());
    }

    let gateway = Arc::new(KubeGateway::new(client.client(), args.debug_image.clone()));
    let orchestrator = SnapshotOrchestrator::new(gateway, config)?;
    let bundles = run_capture(&orchestrator, &targets).await?;

    for bundle in &bundles {
        println!("{}: {}", bundle.target, bundle.archive_path.display());
    }
    info!(snapshots = bundles.len(), "Done");
    Ok(())
}
