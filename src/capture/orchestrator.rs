//! Capture cycles and the round loop that repeats them
//!
//! One cycle per target: raise verbosity, collect logs and the optional
//! packet capture while sweeping admin endpoints, join, write the working
//! directory, archive, then release the verbosity lease. Targets of a round
//! run one after another; rounds repeat per [`Schedule`].

use crate::capture::archive::build_archive;
use crate::capture::artifact::LogStreamChannel;
use crate::capture::endpoint::{EndpointFetcher, EndpointResult};
use crate::capture::ephemeral::EphemeralController;
use crate::capture::logs::{LogArtifact, LogCollector};
use crate::capture::tcpdump::{PacketCapture, CAPTURE_FILE};
use crate::capture::verbosity::VerbosityController;
use crate::config::{CaptureConfig, StopCondition};
use crate::k8s::ClusterGateway;
use crate::{Result, SnapError};
use meshsnap_common::CaptureTarget;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A finished cycle. The working directory is gone once the cycle returns;
/// only the archive remains.
#[derive(Debug, Clone)]
pub struct SnapshotBundle {
    pub target: CaptureTarget,
    pub work_dir: PathBuf,
    pub archive_path: PathBuf,
}

/// Round bookkeeping for a fixed repeat count or a wall-clock bound.
///
/// Whether a round is final is decided once, the first time any of its
/// cycles asks, and the run ends after a final round.
#[derive(Debug)]
pub struct Schedule {
    stop: StopCondition,
    interval: Duration,
    rounds: u32,
    started_at: Option<Instant>,
    final_round: Option<bool>,
    finished: bool,
}

impl Schedule {
    pub fn new(stop: StopCondition, interval: Duration) -> Self {
        Self {
            stop,
            interval,
            rounds: 0,
            started_at: None,
            final_round: None,
            finished: false,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.stop_condition(), config.interval)
    }

    /// Start the next round, or return false when the run is over.
    ///
    /// The duration clock starts with the first round.
    pub fn begin_round(&mut self) -> bool {
        if self.finished {
            return false;
        }
        if let StopCondition::Repeat(count) = self.stop {
            if self.rounds >= count {
                self.finished = true;
                return false;
            }
        }

        self.rounds += 1;
        self.final_round = None;
        self.started_at.get_or_insert_with(Instant::now);
        true
    }

    /// 1-based number of the current round
    pub fn round(&self) -> u32 {
        self.rounds
    }

    pub fn is_final_round(&mut self) -> bool {
        if let Some(decided) = self.final_round {
            return decided;
        }

        let decided = match self.stop {
            StopCondition::Repeat(count) => self.rounds >= count,
            StopCondition::Duration(limit) => {
                let elapsed = self
                    .started_at
                    .map(|started| started.elapsed())
                    .unwrap_or_default();
                elapsed + self.interval >= limit
            }
        };
        debug!(round = self.rounds, final_round = decided, "Final round decided");
        self.final_round = Some(decided);
        decided
    }

    /// Close the round. Returns the pause before the next one, or `None`
    /// after the final round.
    pub fn end_round(&mut self) -> Option<Duration> {
        if self.is_final_round() {
            self.finished = true;
            None
        } else {
            Some(self.interval)
        }
    }
}

pub struct SnapshotOrchestrator {
    logs: LogCollector,
    endpoints: EndpointFetcher,
    packets: PacketCapture,
    verbosity: Arc<VerbosityController>,
    config: CaptureConfig,
}

impl SnapshotOrchestrator {
    /// Build the cycle components. The config is validated before anything
    /// touches the cluster.
    pub fn new(gateway: Arc<dyn ClusterGateway>, config: CaptureConfig) -> Result<Self> {
        config.validate()?;

        let controller = Arc::new(EphemeralController::new(gateway.clone()));
        let endpoints = EndpointFetcher::standard(
            gateway.clone(),
            controller.clone(),
            config.exec_container.as_deref(),
        )?;

        Ok(Self {
            logs: LogCollector::new(gateway),
            endpoints,
            packets: PacketCapture::new(controller.clone(), Arc::new(LogStreamChannel)),
            verbosity: Arc::new(VerbosityController::new(controller, config.admin_port)),
            config,
        })
    }

    pub fn with_endpoint_fetcher(mut self, endpoints: EndpointFetcher) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Run one capture cycle for `target`, archiving into `round_dir`.
    ///
    /// Only an archive failure fails the cycle. The verbosity lease is
    /// released after archiving either way.
    pub async fn capture_cycle(
        &self,
        target: &CaptureTarget,
        round_dir: &Path,
        schedule: &mut Schedule,
    ) -> Result<SnapshotBundle> {
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("meshsnap-{}-", target.pod_name))
            .tempdir()?;
        info!(pod = %target, work_dir = %work_dir.path().display(), "Starting capture cycle");

        let lease = self
            .verbosity
            .acquire(target, self.config.verbosity, self.config.skip_log_reset)
            .await;

        let containers = target.log_containers();
        let (logs, packets, endpoints) = tokio::join!(
            self.logs
                .collect_all(target, &containers, self.config.duration),
            self.capture_packets(target),
            self.sweep_endpoints(target),
        );

        write_endpoints(work_dir.path(), target, &endpoints).await;
        write_logs(work_dir.path(), target, &logs).await;
        if let Some(pcap) = packets {
            write_artifact(work_dir.path(), target, CAPTURE_FILE, &pcap).await;
        }

        let archive_path = round_dir.join(format!("{}_snapshot.tar.gz", target.pod_name));
        let archived = {
            let source = work_dir.path().to_path_buf();
            let output = archive_path.clone();
            tokio::task::spawn_blocking(move || build_archive(&source, &output))
                .await
                .unwrap_or_else(|e| Err(SnapError::ArchiveError(format!("Archive worker failed: {}", e))))
        };

        let final_cycle = schedule.is_final_round();
        lease.release(final_cycle).await;

        if let Err(e) = archived {
            error!(pod = %target, error = %e, "Snapshot archive failed");
            return Err(e);
        }

        info!(pod = %target, archive = %archive_path.display(), "Capture cycle complete");
        Ok(SnapshotBundle {
            target: target.clone(),
            work_dir: work_dir.path().to_path_buf(),
            archive_path,
        })
    }

    async fn capture_packets(&self, target: &CaptureTarget) -> Option<Vec<u8>> {
        if !self.config.tcpdump_enabled {
            return None;
        }

        match self.packets.capture(target, self.config.duration).await {
            Ok(pcap) => {
                info!(pod = %target, bytes = pcap.len(), "Packet capture retrieved");
                Some(pcap)
            }
            Err(e) => {
                warn!(pod = %target, error = %e, "Packet capture failed, skipping");
                None
            }
        }
    }

    /// One endpoint at a time, each failure isolated
    async fn sweep_endpoints(&self, target: &CaptureTarget) -> Vec<EndpointResult> {
        let mut fetched = Vec::with_capacity(self.config.endpoints.len());
        for path in &self.config.endpoints {
            match self
                .endpoints
                .fetch_endpoint(target, self.config.admin_port, path)
                .await
            {
                Ok(result) => fetched.push(result),
                Err(e) => warn!(pod = %target, path = %path, error = %e, "Failed to capture endpoint"),
            }
        }
        fetched
    }
}

/// `/config_dump?include_eds` becomes `config_dump_include_eds.json`
pub fn endpoint_file_name(path: &str) -> String {
    let stem: String = path
        .trim_start_matches('/')
        .chars()
        .map(|c| match c {
            '/' | '?' | '&' | '=' => '_',
            c => c,
        })
        .collect();

    if stem.is_empty() {
        "root.json".to_string()
    } else {
        format!("{}.json", stem)
    }
}

async fn write_endpoints(dir: &Path, target: &CaptureTarget, endpoints: &[EndpointResult]) {
    for result in endpoints.iter().filter(|r| !r.payload.is_empty()) {
        write_artifact(dir, target, &endpoint_file_name(&result.path), &result.payload).await;
    }
}

async fn write_logs(dir: &Path, target: &CaptureTarget, logs: &BTreeMap<String, LogArtifact>) {
    for artifact in logs.values().filter(|a| !a.failed) {
        let name = format!("{}-logs.txt", artifact.container);
        write_artifact(dir, target, &name, &artifact.payload).await;
    }
}

async fn write_artifact(dir: &Path, target: &CaptureTarget, name: &str, payload: &[u8]) {
    match tokio::fs::write(dir.join(name), payload).await {
        Ok(()) => debug!(pod = %target, file = name, bytes = payload.len(), "Wrote artifact"),
        Err(e) => warn!(pod = %target, file = name, error = %e, "Failed to write artifact"),
    }
}

/// `<output-dir>/snapshot_<YYYYmmdd_HHMMSS>`, suffixed when that name is taken
pub fn round_directory(output_dir: &Path, now: chrono::DateTime<chrono::Local>) -> PathBuf {
    let base = format!("snapshot_{}", now.format("%Y%m%d_%H%M%S"));
    let mut candidate = output_dir.join(&base);
    let mut suffix = 1;
    while candidate.exists() {
        suffix += 1;
        candidate = output_dir.join(format!("{}_{}", base, suffix));
    }
    candidate
}

/// Capture every target once per round until the schedule ends.
///
/// Failed cycles are logged and the run moves on; only an unusable output
/// directory stops it early.
pub async fn run_capture(
    orchestrator: &SnapshotOrchestrator,
    targets: &[CaptureTarget],
) -> Result<Vec<SnapshotBundle>> {
    if targets.is_empty() {
        warn!("No capture targets, nothing to do");
        return Ok(Vec::new());
    }

    let config = orchestrator.config();
    let mut schedule = Schedule::from_config(config);
    let mut bundles = Vec::new();

    while schedule.begin_round() {
        let round_dir = round_directory(&config.output_dir, chrono::Local::now());
        tokio::fs::create_dir_all(&round_dir).await?;
        info!(
            round = schedule.round(),
            targets = targets.len(),
            dir = %round_dir.display(),
            "Starting capture round"
        );

        for target in targets {
            match orchestrator
                .capture_cycle(target, &round_dir, &mut schedule)
                .await
            {
                Ok(bundle) => bundles.push(bundle),
                Err(e) => error!(pod = %target, error = %e, "Capture cycle failed"),
            }
        }

        match schedule.end_round() {
            Some(pause) => {
                info!(seconds = pause.as_secs(), "Sleeping before next snapshot");
                tokio::time::sleep(pause).await;
            }
            None => info!(rounds = schedule.round(), "Capture run complete"),
        }
    }

    Ok(bundles)
}
