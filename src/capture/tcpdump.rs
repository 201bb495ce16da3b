//! Packet capture in the target's network namespace
//!
//! Runs tcpdump in a privileged ephemeral task for the cycle's duration and
//! pulls the resulting pcap back through an [`ArtifactChannel`].

use crate::capture::artifact::ArtifactChannel;
use crate::capture::ephemeral::EphemeralController;
use crate::Result;
use meshsnap_common::CaptureTarget;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// File name of the capture inside the snapshot
pub const CAPTURE_FILE: &str = "capture.pcap";

const REMOTE_CAPTURE_PATH: &str = "/tmp/meshsnap.pcap";

/// Headroom for image pull, start-up and encoding on top of the capture window
const CAPTURE_GRACE: Duration = Duration::from_secs(30);

pub fn capture_script(duration: Duration) -> String {
    format!(
        "timeout -s INT {} tcpdump -i any -s 0 -U -w {}",
        duration.as_secs().max(1),
        REMOTE_CAPTURE_PATH
    )
}

pub struct PacketCapture {
    controller: Arc<EphemeralController>,
    channel: Arc<dyn ArtifactChannel>,
}

impl PacketCapture {
    pub fn new(controller: Arc<EphemeralController>, channel: Arc<dyn ArtifactChannel>) -> Self {
        Self {
            controller,
            channel,
        }
    }

    pub async fn capture(&self, target: &CaptureTarget, duration: Duration) -> Result<Vec<u8>> {
        info!(pod = %target, duration = ?duration, "Starting packet capture");

        let command = self
            .channel
            .wrap_command(&capture_script(duration), REMOTE_CAPTURE_PATH);
        let output = self
            .controller
            .run_to_completion(target, command, true, duration + CAPTURE_GRACE)
            .await?;

        self.channel.decode(&output)
    }
}
