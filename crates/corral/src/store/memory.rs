//! In-memory state store.

use std::sync::atomic::{AtomicU64, Ordering};

use corral_common::{ContainerId, CorralError, CorralResult, PodId};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{ContainerRecord, PodRecord, StateStore, VolumeRecord};
use crate::container::ContainerState;
use crate::pod::PodState;
use crate::volume::VolumeState;

/// State store kept entirely in memory.
///
/// Counts writes so callers can verify that refused operations persisted
/// nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    containers: DashMap<ContainerId, ContainerRecord>,
    pods: DashMap<PodId, PodRecord>,
    volumes: DashMap<String, VolumeRecord>,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes since creation.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn insert_new<K, V>(map: &DashMap<K, V>, key: K, value: V, kind: &'static str) -> CorralResult<()>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
{
    match map.entry(key) {
        Entry::Occupied(entry) => Err(CorralError::AlreadyExists {
            kind,
            id: entry.key().to_string(),
        }),
        Entry::Vacant(entry) => {
            entry.insert(value);
            Ok(())
        }
    }
}

impl StateStore for MemoryStore {
    fn add_container(&self, record: &ContainerRecord) -> CorralResult<()> {
        insert_new(
            &self.containers,
            record.config.id.clone(),
            record.clone(),
            "container",
        )?;
        self.wrote();
        Ok(())
    }

    fn save_container_state(&self, id: &ContainerId, state: &ContainerState) -> CorralResult<()> {
        let mut record = self
            .containers
            .get_mut(id)
            .ok_or_else(|| CorralError::not_found("container", id))?;
        record.state = state.clone();
        self.wrote();
        Ok(())
    }

    fn container(&self, id: &ContainerId) -> CorralResult<ContainerRecord> {
        self.containers
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CorralError::not_found("container", id))
    }

    fn remove_container(&self, id: &ContainerId) -> CorralResult<()> {
        self.containers
            .remove(id)
            .ok_or_else(|| CorralError::not_found("container", id))?;
        self.wrote();
        Ok(())
    }

    fn all_containers(&self) -> CorralResult<Vec<ContainerRecord>> {
        Ok(self.containers.iter().map(|r| r.value().clone()).collect())
    }

    fn add_pod(&self, record: &PodRecord) -> CorralResult<()> {
        insert_new(&self.pods, record.config.id.clone(), record.clone(), "pod")?;
        self.wrote();
        Ok(())
    }

    fn save_pod_state(&self, id: &PodId, state: &PodState) -> CorralResult<()> {
        let mut record = self
            .pods
            .get_mut(id)
            .ok_or_else(|| CorralError::not_found("pod", id))?;
        record.state = state.clone();
        self.wrote();
        Ok(())
    }

    fn pod(&self, id: &PodId) -> CorralResult<PodRecord> {
        self.pods
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| CorralError::not_found("pod", id))
    }

    fn remove_pod(&self, id: &PodId) -> CorralResult<()> {
        self.pods
            .remove(id)
            .ok_or_else(|| CorralError::not_found("pod", id))?;
        self.wrote();
        Ok(())
    }

    fn all_pods(&self) -> CorralResult<Vec<PodRecord>> {
        Ok(self.pods.iter().map(|r| r.value().clone()).collect())
    }

    fn add_volume(&self, record: &VolumeRecord) -> CorralResult<()> {
        insert_new(
            &self.volumes,
            record.config.name.clone(),
            record.clone(),
            "volume",
        )?;
        self.wrote();
        Ok(())
    }

    fn save_volume_state(&self, name: &str, state: &VolumeState) -> CorralResult<()> {
        let mut record = self
            .volumes
            .get_mut(name)
            .ok_or_else(|| CorralError::not_found("volume", name))?;
        record.state = state.clone();
        self.wrote();
        Ok(())
    }

    fn volume(&self, name: &str) -> CorralResult<VolumeRecord> {
        self.volumes
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| CorralError::not_found("volume", name))
    }

    fn remove_volume(&self, name: &str) -> CorralResult<()> {
        self.volumes
            .remove(name)
            .ok_or_else(|| CorralError::not_found("volume", name))?;
        self.wrote();
        Ok(())
    }

    fn all_volumes(&self) -> CorralResult<Vec<VolumeRecord>> {
        Ok(self.volumes.iter().map(|r| r.value().clone()).collect())
    }
}
