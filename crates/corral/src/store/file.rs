//! JSON file state store.

use std::path::{Path, PathBuf};

use corral_common::{ContainerId, CorralError, CorralResult, PodId};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{ContainerRecord, PodRecord, StateStore, VolumeRecord};
use crate::container::ContainerState;
use crate::pod::PodState;
use crate::volume::VolumeState;

const CONFIG_FILE: &str = "config.json";
const STATE_FILE: &str = "state.json";

/// Entity configuration together with its lock index.
#[derive(serde::Serialize, serde::Deserialize)]
struct Header<C> {
    lock_index: u32,
    config: C,
}

/// State store writing one directory per entity:
///
/// ```text
/// <root>/containers/<id>/config.json
/// <root>/containers/<id>/state.json
/// <root>/pods/<id>/...
/// <root>/volumes/<name>/...
/// ```
///
/// Configuration is written once; state is rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> CorralResult<Self> {
        let root = root.into();
        for kind in ["containers", "pods", "volumes"] {
            std::fs::create_dir_all(root.join(kind))?;
        }
        tracing::debug!(path = %root.display(), "Opened state store");
        Ok(Self { root })
    }

    fn entity_dir(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(id)
    }

    fn add<C: Serialize, S: Serialize>(
        &self,
        kind: &'static str,
        dir_name: &str,
        id: &str,
        lock_index: u32,
        config: &C,
        state: &S,
    ) -> CorralResult<()> {
        let dir = self.entity_dir(dir_name, id);
        if dir.join(CONFIG_FILE).exists() {
            return Err(CorralError::AlreadyExists {
                kind,
                id: id.to_string(),
            });
        }
        std::fs::create_dir_all(&dir)?;
        write_json(&dir.join(CONFIG_FILE), &Header { lock_index, config })?;
        write_json(&dir.join(STATE_FILE), state)?;

        tracing::debug!(kind, id, path = %dir.display(), "Saved new record");
        Ok(())
    }

    fn save_state<S: Serialize>(
        &self,
        kind: &'static str,
        dir_name: &str,
        id: &str,
        state: &S,
    ) -> CorralResult<()> {
        let dir = self.entity_dir(dir_name, id);
        if !dir.join(CONFIG_FILE).exists() {
            return Err(CorralError::not_found(kind, id));
        }
        write_json(&dir.join(STATE_FILE), state)?;
        tracing::trace!(kind, id, "Saved state");
        Ok(())
    }

    fn load<C: DeserializeOwned, S: DeserializeOwned>(
        &self,
        kind: &'static str,
        dir_name: &str,
        id: &str,
    ) -> CorralResult<(Header<C>, S)> {
        let dir = self.entity_dir(dir_name, id);
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(CorralError::not_found(kind, id));
        }
        let header: Header<C> = read_json(&config_path)?;
        let state: S = read_json(&dir.join(STATE_FILE))?;
        Ok((header, state))
    }

    fn remove(&self, kind: &'static str, dir_name: &str, id: &str) -> CorralResult<()> {
        let dir = self.entity_dir(dir_name, id);
        if !dir.exists() {
            return Err(CorralError::not_found(kind, id));
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::debug!(kind, id, path = %dir.display(), "Deleted record");
        Ok(())
    }

    fn list(&self, dir_name: &str) -> CorralResult<Vec<String>> {
        let mut ids = Vec::new();
        let dir = self.root.join(dir_name);
        if !dir.exists() {
            return Ok(ids);
        }

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().join(CONFIG_FILE).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> CorralResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> CorralResult<T> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

impl StateStore for FileStore {
    fn add_container(&self, record: &ContainerRecord) -> CorralResult<()> {
        self.add(
            "container",
            "containers",
            record.config.id.as_str(),
            record.lock_index,
            &record.config,
            &record.state,
        )
    }

    fn save_container_state(&self, id: &ContainerId, state: &ContainerState) -> CorralResult<()> {
        self.save_state("container", "containers", id.as_str(), state)
    }

    fn container(&self, id: &ContainerId) -> CorralResult<ContainerRecord> {
        let (header, state) = self.load("container", "containers", id.as_str())?;
        Ok(ContainerRecord {
            config: header.config,
            state,
            lock_index: header.lock_index,
        })
    }

    fn remove_container(&self, id: &ContainerId) -> CorralResult<()> {
        self.remove("container", "containers", id.as_str())
    }

    fn all_containers(&self) -> CorralResult<Vec<ContainerRecord>> {
        self.list("containers")?
            .into_iter()
            .map(|id| self.container(&ContainerId::new(id)?))
            .collect()
    }

    fn add_pod(&self, record: &PodRecord) -> CorralResult<()> {
        self.add(
            "pod",
            "pods",
            record.config.id.as_str(),
            record.lock_index,
            &record.config,
            &record.state,
        )
    }

    fn save_pod_state(&self, id: &PodId, state: &PodState) -> CorralResult<()> {
        self.save_state("pod", "pods", id.as_str(), state)
    }

    fn pod(&self, id: &PodId) -> CorralResult<PodRecord> {
        let (header, state) = self.load("pod", "pods", id.as_str())?;
        Ok(PodRecord {
            config: header.config,
            state,
            lock_index: header.lock_index,
        })
    }

    fn remove_pod(&self, id: &PodId) -> CorralResult<()> {
        self.remove("pod", "pods", id.as_str())
    }

    fn all_pods(&self) -> CorralResult<Vec<PodRecord>> {
        self.list("pods")?
            .into_iter()
            .map(|id| self.pod(&PodId::new(id)?))
            .collect()
    }

    fn add_volume(&self, record: &VolumeRecord) -> CorralResult<()> {
        self.add(
            "volume",
            "volumes",
            &record.config.name,
            record.lock_index,
            &record.config,
            &record.state,
        )
    }

    fn save_volume_state(&self, name: &str, state: &VolumeState) -> CorralResult<()> {
        self.save_state("volume", "volumes", name, state)
    }

    fn volume(&self, name: &str) -> CorralResult<VolumeRecord> {
        let (header, state) = self.load("volume", "volumes", name)?;
        Ok(VolumeRecord {
            config: header.config,
            state,
            lock_index: header.lock_index,
        })
    }

    fn remove_volume(&self, name: &str) -> CorralResult<()> {
        self.remove("volume", "volumes", name)
    }

    fn all_volumes(&self) -> CorralResult<Vec<VolumeRecord>> {
        self.list("volumes")?
            .into_iter()
            .map(|name| self.volume(&name))
            .collect()
    }
}
