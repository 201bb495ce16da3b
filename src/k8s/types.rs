use meshsnap_common::{CaptureTarget, CONNECT_INJECT_ANNOTATION, SIDECAR_CONTAINERS};

#[derive(Debug, Clone)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub containers: Vec<String>,
    pub mesh_injected: bool,
}

impl PodInfo {
    pub fn from_k8s_pod(pod: &k8s_openapi::api::core::v1::Pod) -> Self {
        let metadata = &pod.metadata;
        let spec = pod.spec.as_ref();
        let status = pod.status.as_ref();

        let mesh_injected = metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CONNECT_INJECT_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false);

        Self {
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata.namespace.clone().unwrap_or_default(),
            phase: status
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            containers: spec
                .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
            mesh_injected,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }

    /// First known Envoy sidecar container in the pod
    pub fn sidecar(&self) -> Option<&str> {
        SIDECAR_CONTAINERS
            .into_iter()
            .find(|name| self.containers.iter().any(|c| c == name))
    }

    /// Capture target for this pod, or `None` when no Envoy sidecar is present
    pub fn capture_target(&self, primary_container: &str) -> Option<CaptureTarget> {
        let sidecar = self.sidecar()?;
        Some(
            CaptureTarget::new(&self.name, primary_container, &self.namespace)
                .with_extra_container(sidecar),
        )
    }
}
