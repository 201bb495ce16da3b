//! Capture configuration and its validation
//!
//! Validation runs before any remote call; a rejected config never touches
//! the cluster.

use crate::{Result, SnapError};
use meshsnap_common::{
    Verbosity, DEFAULT_ADMIN_PORT, DEFAULT_ENDPOINTS, DISALLOWED_PRIMARY_CONTAINER,
};
use std::path::PathBuf;
use std::time::Duration;

/// Shortest allowed pause between capture rounds
pub const MIN_INTERVAL: Duration = Duration::from_secs(5);

/// What ends a capture run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCondition {
    /// Exactly this many rounds
    Repeat(u32),
    /// Rounds keep starting until this much time has passed since the first
    Duration(Duration),
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub endpoints: Vec<String>,
    /// Log window and packet-capture length of each cycle
    pub duration: Duration,
    pub verbosity: Verbosity,
    pub tcpdump_enabled: bool,
    /// Zero means the run is bounded by `duration` instead
    pub repeat_count: u32,
    pub interval: Duration,
    pub skip_log_reset: bool,
    pub output_dir: PathBuf,
    pub admin_port: u16,
    /// Container to try a direct exec fetch in before the ephemeral fallback
    pub exec_container: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
            duration: Duration::from_secs(60),
            verbosity: Verbosity::Debug,
            tcpdump_enabled: false,
            repeat_count: 0,
            interval: MIN_INTERVAL,
            skip_log_reset: false,
            output_dir: PathBuf::from("."),
            admin_port: DEFAULT_ADMIN_PORT,
            exec_container: None,
        }
    }
}

impl CaptureConfig {
    /// A fixed repeat count takes precedence over the duration bound
    pub fn stop_condition(&self) -> StopCondition {
        if self.repeat_count > 0 {
            StopCondition::Repeat(self.repeat_count)
        } else {
            StopCondition::Duration(self.duration)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval < MIN_INTERVAL {
            return Err(SnapError::ConfigValidationError(format!(
                "Interval must be at least {}s, got {}s",
                MIN_INTERVAL.as_secs(),
                self.interval.as_secs()
            )));
        }

        if matches!(self.stop_condition(), StopCondition::Duration(d) if d.is_zero()) {
            return Err(SnapError::ConfigValidationError(
                "Duration must be greater than zero when no repeat count is set".to_string(),
            ));
        }

        if self.endpoints.is_empty() {
            return Err(SnapError::ConfigValidationError(
                "At least one admin endpoint is required".to_string(),
            ));
        }

        if let Some(bad) = self.endpoints.iter().find(|e| !e.starts_with('/')) {
            return Err(SnapError::ConfigValidationError(format!(
                "Endpoint {:?} must start with '/'",
                bad
            )));
        }

        Ok(())
    }
}

/// The mesh dataplane is captured alongside the app, never as the app
pub fn validate_primary_container(container: &str) -> Result<()> {
    if container.is_empty() {
        return Err(SnapError::ConfigValidationError(
            "A primary container name is required".to_string(),
        ));
    }
    if container == DISALLOWED_PRIMARY_CONTAINER {
        return Err(SnapError::ConfigValidationError(format!(
            "'{}' cannot be used as the container value. Please specify the application container instead.",
            DISALLOWED_PRIMARY_CONTAINER
        )));
    }
    Ok(())
}
