use crate::k8s::types::PodInfo;
use crate::{Result, SnapError};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use meshsnap_common::CaptureTarget;
use tracing::{debug, info, warn};

pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    pub async fn try_default() -> Result<Self> {
        debug!("Initializing Kubernetes client");

        let client = Client::try_default().await.map_err(|e| {
            SnapError::KubernetesError(format!("Failed to create K8s client: {}", e))
        })?;

        info!("Successfully connected to Kubernetes cluster");

        Ok(Self { client })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| pod_lookup_error(e, name, namespace))
    }

    pub async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let pod_list = self
            .pods(namespace)
            .list(&Default::default())
            .await
            .map_err(|e| SnapError::KubernetesError(format!("Failed to list pods: {}", e)))?;

        Ok(pod_list.items)
    }

    /// Resolve the pods to capture.
    ///
    /// With an explicit pod name only that pod is considered; otherwise every
    /// mesh-injected pod in the namespace. Pods that are not running or have
    /// no known Envoy sidecar are logged and skipped.
    pub async fn discover_targets(
        &self,
        pod: Option<&str>,
        primary_container: &str,
        namespace: &str,
    ) -> Result<Vec<CaptureTarget>> {
        let pods: Vec<PodInfo> = match pod {
            Some(name) => vec![PodInfo::from_k8s_pod(&self.get_pod(name, namespace).await?)],
            None => self
                .list_pods(namespace)
                .await?
                .iter()
                .map(PodInfo::from_k8s_pod)
                .filter(|p| p.mesh_injected)
                .collect(),
        };

        Ok(select_targets(pods, primary_container))
    }
}

/// Map a failed pod GET, keeping a 404 distinguishable
pub(crate) fn pod_lookup_error(e: kube::Error, name: &str, namespace: &str) -> SnapError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => SnapError::PodNotFound {
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        e => SnapError::KubernetesError(format!(
            "Failed to get pod {}/{}: {}",
            namespace, name, e
        )),
    }
}

/// Running pods with a known Envoy sidecar; the rest are logged and skipped
fn select_targets(pods: Vec<PodInfo>, primary_container: &str) -> Vec<CaptureTarget> {
    let mut targets = Vec::with_capacity(pods.len());
    for info in pods {
        if !info.is_running() {
            warn!(pod = %info.name, phase = %info.phase, "Pod is not running, skipping");
            continue;
        }
        match info.capture_target(primary_container) {
            Some(target) => {
                debug!(pod = %target, sidecar = ?target.extra_containers, "Resolved capture target");
                targets.push(target);
            }
            None => warn!(
                pod = %info.name,
                containers = ?info.containers,
                "No known Envoy sidecar found, skipping pod"
            ),
        }
    }
    targets
}
