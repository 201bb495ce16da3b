//! Admin endpoint retrieval through an ordered chain of fetch tiers
//!
//! The default chain tries a port-forward tunnel a few times, then falls
//! back to running an HTTP client inside the pod's network namespace through
//! an ephemeral task. Tiers share one attempt counter so the final result
//! reports the total number of tries.

use crate::capture::ephemeral::EphemeralController;
use crate::k8s::ClusterGateway;
use crate::{Result, SnapError};
use async_trait::async_trait;
use bytes::Bytes;
use meshsnap_common::{CaptureTarget, FetchMethod};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TUNNEL_ATTEMPTS: u32 = 5;
pub const TUNNEL_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const FALLBACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on a single GET through an open tunnel
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EndpointResult {
    pub path: String,
    pub payload: Bytes,
    pub method: FetchMethod,
    pub attempts: u32,
}

#[async_trait]
pub trait FetchTier: Send + Sync {
    fn method(&self) -> FetchMethod;

    /// Fetch `path` from the admin listener on `port`, adding every attempt
    /// made to `attempts`. An empty payload counts as a miss.
    async fn fetch(
        &self,
        target: &CaptureTarget,
        port: u16,
        path: &str,
        attempts: &mut u32,
    ) -> Result<Bytes>;
}

pub fn admin_url(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", port, path)
}

/// Single-quote `value` for `sh -c`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// GET over a fresh port-forward tunnel, retried with a fixed delay
pub struct TunnelTier {
    gateway: Arc<dyn ClusterGateway>,
    http: reqwest::Client,
    attempts: u32,
    retry_delay: Duration,
}

impl TunnelTier {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(|e| SnapError::TunnelError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            gateway,
            http,
            attempts: TUNNEL_ATTEMPTS,
            retry_delay: TUNNEL_RETRY_DELAY,
        })
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    async fn get_once(&self, target: &CaptureTarget, port: u16, path: &str) -> Result<Bytes> {
        let tunnel = self.gateway.open_tunnel(target, port).await?;

        let response = self
            .http
            .get(tunnel.url(path))
            .send()
            .await
            .map_err(|e| SnapError::TunnelError(format!("GET {} failed: {}", path, e)))?;

        if !response.status().is_success() {
            return Err(SnapError::TunnelError(format!(
                "GET {} returned HTTP {}",
                path,
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| SnapError::TunnelError(format!("Reading {} failed: {}", path, e)))
    }
}

#[async_trait]
impl FetchTier for TunnelTier {
    fn method(&self) -> FetchMethod {
        FetchMethod::Tunnel
    }

    async fn fetch(
        &self,
        target: &CaptureTarget,
        port: u16,
        path: &str,
        attempts: &mut u32,
    ) -> Result<Bytes> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            *attempts += 1;
            match self.get_once(target, port, path).await {
                Ok(payload) if !payload.is_empty() => return Ok(payload),
                Ok(_) => debug!(pod = %target, path, attempt, "Tunnel returned an empty payload"),
                Err(e) if e.is_transient() => {
                    debug!(pod = %target, path, attempt, error = %e, "Tunnel attempt failed");
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(pod = %target, path, attempt, error = %e, "Tunnel attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SnapError::TunnelError(format!("{} returned an empty payload", path))
        }))
    }
}

/// HTTP client run directly in an existing container of the pod
pub struct ContainerExecTier {
    gateway: Arc<dyn ClusterGateway>,
    container: String,
}

impl ContainerExecTier {
    pub fn new(gateway: Arc<dyn ClusterGateway>, container: impl Into<String>) -> Self {
        Self {
            gateway,
            container: container.into(),
        }
    }
}

#[async_trait]
impl FetchTier for ContainerExecTier {
    fn method(&self) -> FetchMethod {
        FetchMethod::ContainerExec
    }

    async fn fetch(
        &self,
        target: &CaptureTarget,
        port: u16,
        path: &str,
        attempts: &mut u32,
    ) -> Result<Bytes> {
        *attempts += 1;
        let url = shell_quote(&admin_url(port, path));
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("curl -sf {url} || wget -qO- {url}"),
        ];

        let output = self
            .gateway
            .exec_in_container(target, &self.container, &command)
            .await?;
        Ok(output.stdout)
    }
}

/// HTTP client run in an ephemeral container sharing the pod's network
pub struct EphemeralExecTier {
    controller: Arc<EphemeralController>,
    timeout: Duration,
}

impl EphemeralExecTier {
    pub fn new(controller: Arc<EphemeralController>) -> Self {
        Self {
            controller,
            timeout: FALLBACK_TIMEOUT,
        }
    }
}

#[async_trait]
impl FetchTier for EphemeralExecTier {
    fn method(&self) -> FetchMethod {
        FetchMethod::FallbackExec
    }

    async fn fetch(
        &self,
        target: &CaptureTarget,
        port: u16,
        path: &str,
        attempts: &mut u32,
    ) -> Result<Bytes> {
        *attempts += 1;
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("curl -s {}", shell_quote(&admin_url(port, path))),
        ];

        self.controller
            .run_to_completion(target, command, false, self.timeout)
            .await
    }
}

#[derive(Default)]
pub struct EndpointFetcher {
    tiers: Vec<Box<dyn FetchTier>>,
}

impl EndpointFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tier(mut self, tier: impl FetchTier + 'static) -> Self {
        self.tiers.push(Box::new(tier));
        self
    }

    /// Tunnel first, then an optional direct exec, then the ephemeral fallback
    pub fn standard(
        gateway: Arc<dyn ClusterGateway>,
        controller: Arc<EphemeralController>,
        exec_container: Option<&str>,
    ) -> Result<Self> {
        let mut fetcher = Self::new().with_tier(TunnelTier::new(gateway.clone())?);
        if let Some(container) = exec_container {
            fetcher = fetcher.with_tier(ContainerExecTier::new(gateway, container));
        }
        Ok(fetcher.with_tier(EphemeralExecTier::new(controller)))
    }

    pub async fn fetch_endpoint(
        &self,
        target: &CaptureTarget,
        port: u16,
        path: &str,
    ) -> Result<EndpointResult> {
        let mut attempts = 0;

        for tier in &self.tiers {
            match tier.fetch(target, port, path, &mut attempts).await {
                Ok(payload) if !payload.is_empty() => {
                    info!(
                        pod = %target,
                        path,
                        method = %tier.method(),
                        attempts,
                        bytes = payload.len(),
                        "Fetched admin endpoint"
                    );
                    return Ok(EndpointResult {
                        path: path.to_string(),
                        payload,
                        method: tier.method(),
                        attempts,
                    });
                }
                Ok(_) => debug!(pod = %target, path, method = %tier.method(), "Empty payload"),
                Err(e) => debug!(pod = %target, path, method = %tier.method(), error = %e, "Fetch tier exhausted"),
            }
        }

        Err(SnapError::CaptureError {
            endpoint: path.to_string(),
            attempts,
        })
    }
}
