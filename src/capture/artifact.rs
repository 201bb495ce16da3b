//! Channels for getting binary artifacts out of an ephemeral task
//!
//! An ephemeral container has no volume shared with the host, so a capture
//! command must emit its artifact through whatever the channel provides.

use crate::{Result, SnapError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

pub trait ArtifactChannel: Send + Sync {
    /// Shell command that runs `producer` (which writes `artifact_path`)
    /// and then hands the file to this channel
    fn wrap_command(&self, producer: &str, artifact_path: &str) -> Vec<String>;

    /// Recover the artifact bytes from the task's output
    fn decode(&self, output: &[u8]) -> Result<Vec<u8>>;
}

/// Ships the artifact base64-encoded through the container's log stream.
/// Both stdout and stderr land in that stream, so the producer is silenced.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStreamChannel;

impl ArtifactChannel for LogStreamChannel {
    fn wrap_command(&self, producer: &str, artifact_path: &str) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("{producer} >/dev/null 2>&1; base64 {artifact_path}"),
        ]
    }

    fn decode(&self, output: &[u8]) -> Result<Vec<u8>> {
        // Log lines may carry newlines, CRs and stray runtime noise
        let clean: Vec<u8> = output
            .iter()
            .copied()
            .filter(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
            .collect();

        if clean.is_empty() {
            return Err(SnapError::DecodeError(
                "no base64 data after sanitization".to_string(),
            ));
        }

        STANDARD.decode(&clean).map_err(|e| {
            SnapError::DecodeError(format!(
                "invalid base64 (raw={}B, clean={}B): {}",
                output.len(),
                clean.len(),
                e
            ))
        })
    }
}
