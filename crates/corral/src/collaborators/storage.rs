//! Storage service interface.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use corral_common::{ContainerId, CorralResult};

use crate::container::ContainerConfig;

/// Container root filesystems and named volume mounts.
///
/// Lookups of unknown containers return `NotFound`.
#[async_trait]
pub trait StorageService: Send + Sync + std::fmt::Debug {
    /// Allocate storage for a new container.
    async fn create_container_storage(&self, config: &ContainerConfig) -> CorralResult<()>;

    /// Mount the container's root filesystem and return the mount point.
    async fn mount(&self, id: &ContainerId) -> CorralResult<PathBuf>;

    /// Unmount the container's root filesystem.
    async fn unmount(&self, id: &ContainerId, force: bool) -> CorralResult<()>;

    /// Delete the container's storage.
    async fn delete_container(&self, id: &ContainerId) -> CorralResult<()>;

    /// Per-container run directory.
    async fn run_dir(&self, id: &ContainerId) -> CorralResult<PathBuf>;

    /// Physically mount a named volume at `path` and return the mount point.
    async fn mount_volume(&self, name: &str, path: &Path) -> CorralResult<PathBuf>;

    /// Release a named volume's physical mount.
    async fn unmount_volume(&self, name: &str) -> CorralResult<()>;
}
