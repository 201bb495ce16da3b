//! Scoped Envoy log-level changes
//!
//! Raising the level mutates a live process, so it is modelled as a lease:
//! acquired at cycle start, released once archiving is done. A lease that is
//! dropped without release (cancelled or panicked cycle) still restores the
//! level unless resets are suppressed.

use crate::capture::endpoint::{admin_url, shell_quote};
use crate::capture::ephemeral::EphemeralController;
use crate::Result;
use meshsnap_common::{CaptureTarget, Verbosity};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const VERBOSITY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct VerbosityController {
    controller: Arc<EphemeralController>,
    admin_port: u16,
}

impl VerbosityController {
    pub fn new(controller: Arc<EphemeralController>, admin_port: u16) -> Self {
        Self {
            controller,
            admin_port,
        }
    }

    /// POST the level to Envoy's `/logging` admin endpoint from inside the pod
    pub async fn set_level(&self, target: &CaptureTarget, level: Verbosity) -> Result<()> {
        let url = format!("{}?level={}", admin_url(self.admin_port, "/logging"), level);
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("curl -s -X POST {}", shell_quote(&url)),
        ];

        self.controller
            .run_to_completion(target, command, false, VERBOSITY_TIMEOUT)
            .await
            .map(|_| ())
    }

    /// Raise the level (best effort) and hand out the lease that restores it.
    ///
    /// With `suppress_reset` the lease never restores the level.
    pub async fn acquire(
        self: &Arc<Self>,
        target: &CaptureTarget,
        level: Verbosity,
        suppress_reset: bool,
    ) -> VerbosityLease {
        info!(pod = %target, level = %level, "Setting Envoy log level");
        if let Err(e) = self.set_level(target, level).await {
            warn!(pod = %target, level = %level, error = %e, "Failed to set log level");
        }

        VerbosityLease {
            verbosity: self.clone(),
            target: target.clone(),
            suppress_reset,
            released: false,
        }
    }
}

#[must_use = "a verbosity lease must be released"]
pub struct VerbosityLease {
    verbosity: Arc<VerbosityController>,
    target: CaptureTarget,
    suppress_reset: bool,
    released: bool,
}

impl VerbosityLease {
    /// Restore the normal level if this was the final cycle.
    ///
    /// Returns whether a reset was issued.
    pub async fn release(mut self, final_cycle: bool) -> bool {
        self.released = true;

        if self.suppress_reset || !final_cycle {
            debug!(pod = %self.target, final_cycle, "Leaving Envoy log level raised");
            return false;
        }

        info!(pod = %self.target, "Resetting Envoy log level back to 'info'");
        if let Err(e) = self
            .verbosity
            .set_level(&self.target, Verbosity::Normal)
            .await
        {
            warn!(pod = %self.target, error = %e, "Failed to reset log level to info");
        }
        true
    }
}

impl Drop for VerbosityLease {
    fn drop(&mut self) {
        if self.released || self.suppress_reset {
            return;
        }
        self.released = true;

        let verbosity = self.verbosity.clone();
        let target = self.target.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(pod = %target, "Cycle abandoned, restoring Envoy log level");
                runtime.spawn(async move {
                    if let Err(e) = verbosity.set_level(&target, Verbosity::Normal).await {
                        warn!(pod = %target, error = %e, "Failed to reset log level to info");
                    }
                });
            }
            Err(_) => warn!(pod = %target, "No runtime left to restore Envoy log level"),
        }
    }
}
