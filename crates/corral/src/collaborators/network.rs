//! Network plugin manager interface.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use corral_common::{ContainerId, CorralResult};
use serde::{Deserialize, Serialize};

/// Result of a network setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    /// Assigned addresses in CIDR form.
    pub addresses: Vec<String>,
    /// DNS servers.
    pub dns: Vec<String>,
}

/// Network namespaces and plugin invocation.
///
/// `setup` returns `NetworkNotReady` while no default network is configured.
#[async_trait]
pub trait NetworkManager: Send + Sync + std::fmt::Debug {
    /// Create a network namespace for the container.
    async fn create_namespace(&self, id: &ContainerId) -> CorralResult<PathBuf>;

    /// Attach the namespace to the pod network.
    async fn setup(
        &self,
        netns: &Path,
        pod_name: &str,
        id: &ContainerId,
    ) -> CorralResult<NetworkStatus>;

    /// Release network allocations for the namespace.
    async fn teardown(&self, netns: &Path, pod_name: &str, id: &ContainerId) -> CorralResult<()>;

    /// Remove the namespace.
    async fn destroy_namespace(&self, netns: &Path) -> CorralResult<()>;
}
