//! Immutable container configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use corral_common::{ContainerId, PodId};
use serde::{Deserialize, Serialize};

use super::restart::RestartPolicy;
use crate::health::HealthCheck;

/// SIGTERM.
pub const SIGTERM: i32 = 15;
/// SIGKILL.
pub const SIGKILL: i32 = 9;

/// How a container obtains one kind of namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceMode {
    /// A namespace of its own.
    #[default]
    Private,
    /// The host's namespace.
    Host,
    /// The namespace of another container.
    Container(ContainerId),
}

impl NamespaceMode {
    /// The container this mode joins, if any.
    #[must_use]
    pub const fn source(&self) -> Option<&ContainerId> {
        match self {
            Self::Container(id) => Some(id),
            _ => None,
        }
    }
}

/// Namespace configuration per kind.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Namespaces {
    pub network: NamespaceMode,
    pub pid: NamespaceMode,
    pub ipc: NamespaceMode,
    pub uts: NamespaceMode,
}

impl Namespaces {
    /// Containers whose namespaces are joined, without duplicates.
    #[must_use]
    pub fn sources(&self) -> Vec<ContainerId> {
        let mut sources: Vec<ContainerId> = Vec::new();
        for mode in [&self.network, &self.pid, &self.ipc, &self.uts] {
            if let Some(id) = mode.source() {
                if !sources.contains(id) {
                    sources.push(id.clone());
                }
            }
        }
        sources
    }
}

/// A named volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name.
    pub name: String,
    /// Mount destination inside the container.
    pub destination: PathBuf,
    /// Mount options.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Immutable container configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container ID.
    pub id: ContainerId,
    /// Unique human-readable name.
    pub name: String,
    /// Owning pod.
    #[serde(default)]
    pub pod: Option<PodId>,
    /// Command of the main process.
    #[serde(default)]
    pub command: Vec<String>,
    /// Containers that must be running before this one starts.
    #[serde(default)]
    pub dependencies: Vec<ContainerId>,
    /// Namespace sharing.
    #[serde(default)]
    pub namespaces: Namespaces,
    /// Restart policy.
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Signal sent by stop.
    #[serde(default = "default_stop_signal")]
    pub stop_signal: i32,
    /// Stop timeout in seconds, overriding the runtime default.
    #[serde(default)]
    pub stop_timeout: Option<u64>,
    /// Named volumes.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Holds the shared namespaces of its pod.
    #[serde(default)]
    pub is_infra: bool,
    /// Periodic health check.
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

const fn default_stop_signal() -> i32 {
    SIGTERM
}

impl ContainerConfig {
    /// Create a configuration with defaults for everything but id and name.
    #[must_use]
    pub fn new(id: ContainerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            pod: None,
            command: Vec::new(),
            dependencies: Vec::new(),
            namespaces: Namespaces::default(),
            restart_policy: RestartPolicy::default(),
            stop_signal: SIGTERM,
            stop_timeout: None,
            volumes: Vec::new(),
            is_infra: false,
            health_check: None,
            labels: BTreeMap::new(),
        }
    }

    /// Set the main process command.
    #[must_use]
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Place the container in a pod.
    #[must_use]
    pub fn with_pod(mut self, pod: PodId) -> Self {
        self.pod = Some(pod);
        self
    }

    /// Add a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dependency: ContainerId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Set namespace sharing.
    #[must_use]
    pub fn with_namespaces(mut self, namespaces: Namespaces) -> Self {
        self.namespaces = namespaces;
        self
    }

    /// Set the restart policy.
    #[must_use]
    pub const fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Set the stop timeout in seconds.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: u64) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    /// Mount a named volume.
    #[must_use]
    pub fn with_volume(mut self, name: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        self.volumes.push(VolumeMount {
            name: name.into(),
            destination: destination.into(),
            options: Vec::new(),
        });
        self
    }

    /// Configure a health check.
    #[must_use]
    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }

    /// All containers this one depends on: declared dependencies followed by
    /// containers whose namespaces it joins.
    #[must_use]
    pub fn dependencies(&self) -> Vec<ContainerId> {
        let mut all = Vec::with_capacity(self.dependencies.len());
        for id in self.dependencies.iter().cloned().chain(self.namespaces.sources()) {
            if !all.contains(&id) {
                all.push(id);
            }
        }
        all
    }

    /// Name used for network plugin calls: the pod, or the container itself.
    #[must_use]
    pub fn network_name(&self) -> &str {
        self.pod.as_ref().map_or(self.name.as_str(), PodId::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ContainerId {
        ContainerId::new(s).unwrap()
    }

    #[test]
    fn dependencies_include_namespace_sources_once() {
        let config = ContainerConfig::new(id("app"), "app")
            .with_dependency(id("db"))
            .with_namespaces(Namespaces {
                network: NamespaceMode::Container(id("infra")),
                ipc: NamespaceMode::Container(id("infra")),
                pid: NamespaceMode::Container(id("db")),
                uts: NamespaceMode::Host,
            });

        assert_eq!(config.dependencies(), vec![id("db"), id("infra")]);
    }

    #[test]
    fn defaults_round_trip_through_json() {
        let json = r#"{"id":"web","name":"web"}"#;
        let config: ContainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.stop_signal, SIGTERM);
        assert_eq!(config.namespaces.network, NamespaceMode::Private);
        assert!(config.dependencies().is_empty());
    }

    #[test]
    fn network_name_prefers_pod() {
        let config = ContainerConfig::new(id("a"), "alpha");
        assert_eq!(config.network_name(), "alpha");
        let config = config.with_pod(PodId::new("pod1").unwrap());
        assert_eq!(config.network_name(), "pod1");
    }
}
