//! Named volumes with reference-counted mounts.
//!
//! A volume is physically mounted when its first user mounts it and released
//! when the last user unmounts it. The count is guarded by the volume's own
//! lock, which is only held while the count changes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use corral_common::{CorralError, CorralResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::{Event, EventKind};
use crate::lock::LockHandle;
use crate::runtime::Runtime;
use crate::store::VolumeRecord;

/// Named volume configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Unique volume name.
    pub name: String,
    /// Driver options passed to storage.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl VolumeConfig {
    /// Configuration for a volume called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
            labels: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// Mutable volume state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeState {
    /// Number of active mounts.
    pub mount_count: u32,
    /// Physical mount point while mounted.
    pub mountpoint: Option<PathBuf>,
}

#[derive(Debug)]
pub(crate) struct Volume {
    config: VolumeConfig,
    state: RwLock<VolumeState>,
    lock: LockHandle,
    valid: AtomicBool,
}

impl Volume {
    pub(crate) fn from_record(record: VolumeRecord, lock: LockHandle) -> Self {
        Self {
            config: record.config,
            state: RwLock::new(record.state),
            lock,
            valid: AtomicBool::new(true),
        }
    }
}

/// Handle to a named volume.
#[derive(Clone)]
pub struct VolumeRef {
    runtime: Runtime,
    inner: Arc<Volume>,
}

impl fmt::Debug for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeRef")
            .field("name", &self.name())
            .field("mount_count", &self.mount_count())
            .finish_non_exhaustive()
    }
}

impl VolumeRef {
    pub(crate) const fn new(runtime: Runtime, inner: Arc<Volume>) -> Self {
        Self { runtime, inner }
    }

    /// Volume name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Volume configuration.
    #[must_use]
    pub fn config(&self) -> &VolumeConfig {
        &self.inner.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> VolumeState {
        self.inner.state.read().clone()
    }

    /// Number of active mounts.
    #[must_use]
    pub fn mount_count(&self) -> u32 {
        self.inner.state.read().mount_count
    }

    /// Index of the volume's lock.
    #[must_use]
    pub fn lock_index(&self) -> u32 {
        self.inner.lock.index()
    }

    /// Host path of the volume's data.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.runtime.config().paths.volume(self.name())
    }

    fn ensure_valid(&self) -> CorralResult<()> {
        if self.inner.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CorralError::Removed {
                kind: "volume",
                id: self.name().to_string(),
            })
        }
    }

    fn commit(&self, state: VolumeState) -> CorralResult<()> {
        self.runtime.store().save_volume_state(self.name(), &state)?;
        *self.inner.state.write() = state;
        Ok(())
    }

    fn emit(&self, kind: EventKind) {
        self.runtime.emit(Event::new(kind).volume(self.name()));
    }

    /// Take a mount reference and return the mount point.
    ///
    /// The first reference mounts the volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the physical mount fails; the count is unchanged.
    pub async fn mount(&self) -> CorralResult<PathBuf> {
        let _guard = self.inner.lock.lock().await;
        self.ensure_valid()?;

        let mut state = self.state();
        let mountpoint = match state.mountpoint.clone() {
            Some(path) if state.mount_count > 0 => path,
            _ => {
                let path = self.data_path();
                let mountpoint = self
                    .runtime
                    .storage()
                    .mount_volume(self.name(), &path)
                    .await?;
                tracing::info!(volume = %self.name(), path = %mountpoint.display(), "Mounted volume");
                state.mountpoint = Some(mountpoint.clone());
                mountpoint
            }
        };
        state.mount_count += 1;
        tracing::debug!(volume = %self.name(), mount_count = state.mount_count, "Volume mount count raised");
        self.commit(state)?;
        self.emit(EventKind::VolumeMount);
        Ok(mountpoint)
    }

    /// Drop a mount reference; `force` drops every reference.
    ///
    /// The physical mount is released when the count reaches zero.
    /// Unmounting an unmounted volume does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the physical unmount fails; the count is unchanged.
    pub async fn unmount(&self, force: bool) -> CorralResult<()> {
        let _guard = self.inner.lock.lock().await;
        self.ensure_valid()?;

        let mut state = self.state();
        if state.mount_count == 0 {
            tracing::debug!(volume = %self.name(), "Volume is not mounted");
            return Ok(());
        }

        state.mount_count = if force { 0 } else { state.mount_count - 1 };
        if state.mount_count == 0 {
            self.runtime.storage().unmount_volume(self.name()).await?;
            state.mountpoint = None;
            tracing::info!(volume = %self.name(), force, "Unmounted volume");
        }
        tracing::debug!(volume = %self.name(), mount_count = state.mount_count, "Volume mount count lowered");
        self.commit(state)?;
        self.emit(EventKind::VolumeUnmount);
        Ok(())
    }

    /// Forget all mounts without touching storage. Used after a reboot.
    pub(crate) async fn reset(&self) -> CorralResult<()> {
        let _guard = self.inner.lock.lock().await;
        self.ensure_valid()?;
        self.commit(VolumeState::default())
    }

    pub(crate) fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::SeqCst);
    }
}

impl Runtime {
    /// Create a named volume.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the name is taken.
    pub async fn new_volume(&self, config: VolumeConfig) -> CorralResult<VolumeRef> {
        if config.name.is_empty() || config.name.contains('/') {
            return Err(CorralError::Config {
                message: format!("invalid volume name: {:?}", config.name),
            });
        }
        if self.inner().volumes.contains_key(&config.name) {
            return Err(CorralError::AlreadyExists {
                kind: "volume",
                id: config.name,
            });
        }

        let lock = self.locks().allocate()?;
        let record = VolumeRecord {
            config,
            state: VolumeState::default(),
            lock_index: lock.index(),
        };
        if let Err(e) = self.store().add_volume(&record) {
            self.locks().free(lock.index());
            return Err(e);
        }

        let name = record.config.name.clone();
        let volume = Arc::new(Volume::from_record(record, lock));
        self.inner().volumes.insert(name.clone(), Arc::clone(&volume));
        tracing::info!(volume = %name, "Created volume");

        let volume = VolumeRef::new(self.clone(), volume);
        volume.emit(EventKind::VolumeCreate);
        Ok(volume)
    }

    /// Look up a volume by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such volume.
    pub fn volume(&self, name: &str) -> CorralResult<VolumeRef> {
        self.inner()
            .volumes
            .get(name)
            .map(|v| VolumeRef::new(self.clone(), Arc::clone(v.value())))
            .ok_or_else(|| CorralError::not_found("volume", name))
    }

    /// All volumes, sorted by name.
    #[must_use]
    pub fn volumes(&self) -> Vec<VolumeRef> {
        let mut volumes: Vec<VolumeRef> = self
            .inner()
            .volumes
            .iter()
            .map(|v| VolumeRef::new(self.clone(), Arc::clone(v.value())))
            .collect();
        volumes.sort_by(|a, b| a.name().cmp(b.name()));
        volumes
    }

    /// Remove a volume.
    ///
    /// With `force`, containers using the volume are removed first and any
    /// remaining mount is released.
    ///
    /// # Errors
    ///
    /// Returns `InUse` if containers use the volume and `force` is not set.
    pub async fn remove_volume(&self, name: &str, force: bool) -> CorralResult<()> {
        let volume = self.volume(name)?;
        let users = self.store().volume_users(name)?;
        if !users.is_empty() {
            if !force {
                return Err(CorralError::InUse {
                    kind: "volume",
                    id: name.to_string(),
                    dependents: users.iter().map(ToString::to_string).collect(),
                });
            }
            for id in &users {
                self.remove_container(id, true).await?;
            }
        }

        if volume.mount_count() > 0 {
            volume.unmount(true).await?;
        }

        let _guard = volume.inner.lock.lock().await;
        volume.ensure_valid()?;
        self.store().remove_volume(name)?;
        volume.invalidate();
        self.locks().free(volume.lock_index());
        self.inner().volumes.remove(name);
        tracing::info!(volume = %name, "Removed volume");
        volume.emit(EventKind::VolumeRemove);
        Ok(())
    }
}
