//! Persisted state store.
//!
//! The store is the durable source of truth. In-memory state is a shadow
//! copy that every operation reloads before acting and writes back after
//! changing.

mod file;
mod memory;

use corral_common::{ContainerId, CorralResult, PodId};
use serde::{Deserialize, Serialize};

use crate::container::{ContainerConfig, ContainerState};
use crate::pod::{PodConfig, PodState};
use crate::volume::{VolumeConfig, VolumeState};

pub use file::FileStore;
pub use memory::MemoryStore;

/// A persisted container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Immutable configuration.
    pub config: ContainerConfig,
    /// Mutable state.
    pub state: ContainerState,
    /// Index of the container's lock.
    pub lock_index: u32,
}

/// A persisted pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    /// Immutable configuration.
    pub config: PodConfig,
    /// Mutable state.
    pub state: PodState,
    /// Index of the pod's lock.
    pub lock_index: u32,
}

/// A persisted named volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Immutable configuration.
    pub config: VolumeConfig,
    /// Mutable state.
    pub state: VolumeState,
    /// Index of the volume's lock.
    pub lock_index: u32,
}

/// Durable storage of containers, pods and volumes.
///
/// Adding an existing entity fails with `AlreadyExists`; reading, updating or
/// removing a missing one fails with `NotFound`.
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Add a container.
    fn add_container(&self, record: &ContainerRecord) -> CorralResult<()>;
    /// Replace a container's state.
    fn save_container_state(&self, id: &ContainerId, state: &ContainerState) -> CorralResult<()>;
    /// Read a container.
    fn container(&self, id: &ContainerId) -> CorralResult<ContainerRecord>;
    /// Remove a container.
    fn remove_container(&self, id: &ContainerId) -> CorralResult<()>;
    /// All containers.
    fn all_containers(&self) -> CorralResult<Vec<ContainerRecord>>;

    /// Add a pod.
    fn add_pod(&self, record: &PodRecord) -> CorralResult<()>;
    /// Replace a pod's state.
    fn save_pod_state(&self, id: &PodId, state: &PodState) -> CorralResult<()>;
    /// Read a pod.
    fn pod(&self, id: &PodId) -> CorralResult<PodRecord>;
    /// Remove a pod.
    fn remove_pod(&self, id: &PodId) -> CorralResult<()>;
    /// All pods.
    fn all_pods(&self) -> CorralResult<Vec<PodRecord>>;

    /// Add a volume.
    fn add_volume(&self, record: &VolumeRecord) -> CorralResult<()>;
    /// Replace a volume's state.
    fn save_volume_state(&self, name: &str, state: &VolumeState) -> CorralResult<()>;
    /// Read a volume.
    fn volume(&self, name: &str) -> CorralResult<VolumeRecord>;
    /// Remove a volume.
    fn remove_volume(&self, name: &str) -> CorralResult<()>;
    /// All volumes.
    fn all_volumes(&self) -> CorralResult<Vec<VolumeRecord>>;

    /// Containers that depend on `id`, sorted.
    fn container_in_use(&self, id: &ContainerId) -> CorralResult<Vec<ContainerId>> {
        let mut dependents: Vec<ContainerId> = self
            .all_containers()?
            .into_iter()
            .filter(|record| record.config.dependencies().contains(id))
            .map(|record| record.config.id)
            .collect();
        dependents.sort();
        Ok(dependents)
    }

    /// Members of a pod, sorted.
    fn pod_containers(&self, pod: &PodId) -> CorralResult<Vec<ContainerId>> {
        let mut members: Vec<ContainerId> = self
            .all_containers()?
            .into_iter()
            .filter(|record| record.config.pod.as_ref() == Some(pod))
            .map(|record| record.config.id)
            .collect();
        members.sort();
        Ok(members)
    }

    /// Containers that mount a named volume, sorted.
    fn volume_users(&self, name: &str) -> CorralResult<Vec<ContainerId>> {
        let mut users: Vec<ContainerId> = self
            .all_containers()?
            .into_iter()
            .filter(|record| record.config.volumes.iter().any(|v| v.name == name))
            .map(|record| record.config.id)
            .collect();
        users.sort();
        Ok(users)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use corral_common::CorralError;

    pub(crate) fn record(id: &str, deps: &[&str]) -> ContainerRecord {
        let mut config = ContainerConfig::new(ContainerId::new(id).unwrap(), id);
        for dep in deps {
            config = config.with_dependency(ContainerId::new(*dep).unwrap());
        }
        ContainerRecord {
            config,
            state: ContainerState::default(),
            lock_index: 0,
        }
    }

    /// Behaviour every store implementation must share.
    pub(crate) fn exercise_store(store: &dyn StateStore) {
        let a = record("a", &[]);
        let b = record("b", &["a"]);
        store.add_container(&a).unwrap();
        store.add_container(&b).unwrap();
        assert!(matches!(
            store.add_container(&a),
            Err(CorralError::AlreadyExists { .. })
        ));

        let mut state = b.state.clone();
        state.restart_count = 4;
        store.save_container_state(&b.config.id, &state).unwrap();
        assert_eq!(store.container(&b.config.id).unwrap().state.restart_count, 4);

        assert_eq!(
            store.container_in_use(&a.config.id).unwrap(),
            vec![b.config.id.clone()]
        );
        assert_eq!(store.all_containers().unwrap().len(), 2);

        store.remove_container(&b.config.id).unwrap();
        assert!(store.container(&b.config.id).unwrap_err().is_not_found());
        assert!(
            store
                .save_container_state(&b.config.id, &state)
                .unwrap_err()
                .is_not_found()
        );
        assert!(store.container_in_use(&a.config.id).unwrap().is_empty());
    }
}
