//! Batched operations on a single container.

use corral_common::CorralResult;
use tokio::sync::OwnedMutexGuard;

use super::state::{ContainerState, ContainerStatus};
use super::ContainerRef;

/// Holds a container's lock across a sequence of operations.
///
/// Obtained from [`ContainerRef::begin_batch`], which locks and syncs once.
/// The operations here neither lock nor sync again, so state observed
/// through a batch can go stale if the supervisor changes the container
/// underneath it. Call [`Batch::sync`] to refresh explicitly.
///
/// A batch is for one caller running operations in sequence. Dropping it
/// releases the lock.
#[derive(Debug)]
pub struct Batch {
    container: ContainerRef,
    _guard: OwnedMutexGuard<()>,
}

impl Batch {
    pub(super) const fn new(container: ContainerRef, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            container,
            _guard: guard,
        }
    }

    /// The batched container.
    #[must_use]
    pub const fn container(&self) -> &ContainerRef {
        &self.container
    }

    /// Current in-memory state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.container.state()
    }

    /// Current in-memory status.
    #[must_use]
    pub fn status(&self) -> ContainerStatus {
        self.container.status()
    }

    /// Synchronize now.
    ///
    /// # Errors
    ///
    /// See [`ContainerRef::sync`].
    pub async fn sync(&self) -> CorralResult<()> {
        self.container.sync_locked().await
    }

    /// See [`ContainerRef::init`].
    ///
    /// # Errors
    ///
    /// See [`ContainerRef::init`].
    pub async fn init(&self, recursive: bool) -> CorralResult<()> {
        self.container.init_locked(recursive).await
    }

    /// See [`ContainerRef::start`].
    ///
    /// # Errors
    ///
    /// See [`ContainerRef::start`].
    pub async fn start(&self, recursive: bool) -> CorralResult<()> {
        self.container.start_locked(recursive).await
    }

    /// See [`ContainerRef::stop`].
    ///
    /// # Errors
    ///
    /// See [`ContainerRef::stop`].
    pub async fn stop(&self, timeout: Option<u64>) -> CorralResult<()> {
        self.container.stop_locked(timeout).await
    }

    /// See [`ContainerRef::kill`].
    ///
    /// # Errors
    ///
    /// See [`ContainerRef::kill`].
    pub async fn kill(&self, signal: i32) -> CorralResult<()> {
        self.container.kill_locked(signal).await
    }

    /// See [`ContainerRef::pause`].
    ///
    /// # Errors
    ///
    /// See [`ContainerRef::pause`].
    pub async fn pause(&self) -> CorralResult<()> {
        self.container.pause_locked().await
    }

    /// See [`ContainerRef::unpause`].
    ///
    /// # Errors
    ///
    /// See [`ContainerRef::unpause`].
    pub async fn unpause(&self) -> CorralResult<()> {
        self.container.unpause_locked().await
    }

    /// See [`ContainerRef::restart`].
    ///
    /// # Errors
    ///
    /// See [`ContainerRef::restart`].
    pub async fn restart(&self, timeout: Option<u64>) -> CorralResult<()> {
        self.container.restart_locked(timeout).await
    }

    /// See [`ContainerRef::cleanup`].
    ///
    /// # Errors
    ///
    /// See [`ContainerRef::cleanup`].
    pub async fn cleanup(&self) -> CorralResult<()> {
        self.container.cleanup_locked().await
    }
}
