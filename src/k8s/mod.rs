pub mod client;
pub mod gateway;
pub mod kube_gateway;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use client::K8sClient;
pub use gateway::{ClusterGateway, EphemeralSpec, ExecOutput, Tunnel};
pub use kube_gateway::KubeGateway;
pub use types::PodInfo;
