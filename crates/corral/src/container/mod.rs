//! Containers and their lifecycle state machine.
//!
//! Every public operation on [`ContainerRef`] follows the same shape:
//! acquire the container lock, synchronize state with the store and the
//! supervisor, check the operation's precondition, drive collaborators, then
//! persist the new state. A refused precondition returns `InvalidState`
//! without persisting anything.
//!
//! The `*_locked` variants skip locking and syncing. They are used by the
//! graph walker, by pod removal and by [`Batch`], which already hold the
//! lock.

mod batch;
mod config;
mod exec;
mod lifecycle;
mod remove;
mod restart;
mod state;
mod sync;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use corral_common::{ContainerId, CorralError, CorralResult, PodId};
use parking_lot::RwLock;
use tokio::sync::OwnedMutexGuard;

use crate::events::{Event, EventKind};
use crate::lock::LockHandle;
use crate::runtime::Runtime;
use crate::store::ContainerRecord;

pub use batch::Batch;
pub use config::{
    ContainerConfig, NamespaceMode, Namespaces, SIGKILL, SIGTERM, VolumeMount,
};
pub use exec::ExecConfig;
pub use restart::{RestartPolicy, RestartPolicyKind, policy_matches_exit, should_restart};
pub use state::{BindMount, ContainerState, ContainerStatus, ExecSession};
pub use sync::{read_exit_marker, wait_for_exit_marker};

/// A container held in the runtime's arena.
#[derive(Debug)]
pub(crate) struct Container {
    config: Arc<ContainerConfig>,
    state: RwLock<ContainerState>,
    lock: LockHandle,
    valid: AtomicBool,
}

impl Container {
    pub(crate) fn from_record(record: ContainerRecord, lock: LockHandle) -> Self {
        Self {
            config: Arc::new(record.config),
            state: RwLock::new(record.state),
            lock,
            valid: AtomicBool::new(true),
        }
    }

    pub(crate) fn id(&self) -> &ContainerId {
        &self.config.id
    }

    pub(crate) fn config(&self) -> &ContainerConfig {
        &self.config
    }
}

/// Handle to a container.
///
/// Cheap to clone; all clones address the same container.
#[derive(Clone)]
pub struct ContainerRef {
    runtime: Runtime,
    inner: Arc<Container>,
}

impl fmt::Debug for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerRef")
            .field("id", self.id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ContainerRef {
    pub(crate) const fn new(runtime: Runtime, inner: Arc<Container>) -> Self {
        Self { runtime, inner }
    }

    /// Container ID.
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        self.inner.id()
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Immutable configuration.
    #[must_use]
    pub fn config(&self) -> &ContainerConfig {
        self.inner.config()
    }

    /// Owning pod.
    #[must_use]
    pub fn pod_id(&self) -> Option<&PodId> {
        self.inner.config.pod.as_ref()
    }

    /// Index of the container's lock.
    #[must_use]
    pub fn lock_index(&self) -> u32 {
        self.inner.lock.index()
    }

    /// Last known state, without synchronizing.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.inner.state.read().clone()
    }

    /// Last known status, without synchronizing.
    #[must_use]
    pub fn status(&self) -> ContainerStatus {
        self.inner.state.read().status
    }

    /// Whether the container is still present in the runtime.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::SeqCst)
    }

    /// Running exec sessions.
    #[must_use]
    pub fn exec_sessions(&self) -> Vec<ExecSession> {
        self.inner
            .state
            .read()
            .exec_sessions
            .values()
            .cloned()
            .collect()
    }

    pub(crate) const fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) async fn lock(&self) -> OwnedMutexGuard<()> {
        self.inner.lock.lock().await
    }

    pub(crate) fn invalidate(&self) {
        self.inner.valid.store(false, Ordering::SeqCst);
    }

    pub(crate) fn ensure_valid(&self) -> CorralResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CorralError::Removed {
                kind: "container",
                id: self.id().to_string(),
            })
        }
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ContainerState) -> R) -> R {
        f(&mut self.inner.state.write())
    }

    /// Write the in-memory state back to the store.
    pub(crate) fn save(&self) -> CorralResult<()> {
        let state = self.state();
        self.runtime.store().save_container_state(self.id(), &state)
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        self.emit_with_code(kind, None);
    }

    pub(crate) fn emit_with_code(&self, kind: EventKind, exit_code: Option<i32>) {
        self.runtime.emit(
            Event::new(kind)
                .container(self.id())
                .pod(self.pod_id())
                .exit_code(exit_code),
        );
    }

    pub(crate) fn invalid_state(&self, operation: &str, status: ContainerStatus) -> CorralError {
        CorralError::invalid_state(
            self.id(),
            format!("{operation} container"),
            format!("container is {status}"),
        )
    }

    /// Synchronize with the store and the supervisor.
    ///
    /// # Errors
    ///
    /// Returns `Removed` if the container no longer exists.
    pub async fn sync(&self) -> CorralResult<()> {
        let _guard = self.lock().await;
        self.sync_locked().await
    }

    /// Initialize the container in the supervisor without starting it.
    ///
    /// With `recursive`, stopped dependencies are started first; otherwise
    /// every dependency must already be running.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the container is configured, stopped or
    /// exited.
    pub async fn init(&self, recursive: bool) -> CorralResult<()> {
        let _guard = self.lock().await;
        self.sync_locked().await?;
        self.init_locked(recursive).await
    }

    /// Start the container, initializing it first if needed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the container is running, paused or being
    /// removed.
    pub async fn start(&self, recursive: bool) -> CorralResult<()> {
        let _guard = self.lock().await;
        self.sync_locked().await?;
        self.start_locked(recursive).await
    }

    /// Stop the container. A stopped or exited container is left alone.
    ///
    /// `timeout` overrides the configured stop timeout (seconds).
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the container is configured, paused or in an
    /// unknown state.
    pub async fn stop(&self, timeout: Option<u64>) -> CorralResult<()> {
        let _guard = self.lock().await;
        self.sync_locked().await?;
        self.stop_locked(timeout).await
    }

    /// Send a signal to a running container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the container is running.
    pub async fn kill(&self, signal: i32) -> CorralResult<()> {
        let _guard = self.lock().await;
        self.sync_locked().await?;
        self.kill_locked(signal).await
    }

    /// Freeze a running container.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` without cgroups and `InvalidState` unless the
    /// container is running.
    pub async fn pause(&self) -> CorralResult<()> {
        let _guard = self.lock().await;
        self.sync_locked().await?;
        self.pause_locked().await
    }

    /// Thaw a paused container.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` without cgroups and `InvalidState` unless the
    /// container is paused.
    pub async fn unpause(&self) -> CorralResult<()> {
        let _guard = self.lock().await;
        self.sync_locked().await?;
        self.unpause_locked().await
    }

    /// Stop (if running), reinitialize and start the container.
    ///
    /// Never counts towards the restart policy's retry cap.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the container is paused, unknown or being
    /// removed.
    pub async fn restart(&self, timeout: Option<u64>) -> CorralResult<()> {
        let _guard = self.lock().await;
        self.sync_locked().await?;
        self.restart_locked(timeout).await
    }

    /// Release everything the last run held.
    ///
    /// If the restart policy matched the last exit, the container is
    /// restarted instead.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the container is running or paused;
    /// otherwise the first error of any cleanup step, after all steps ran.
    pub async fn cleanup(&self) -> CorralResult<()> {
        let _guard = self.lock().await;
        self.sync_locked().await?;
        self.cleanup_locked().await
    }

    /// Reset the container after a reboot and restore its prior status.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset could not be persisted or the restore
    /// failed.
    pub async fn refresh(&self) -> CorralResult<()> {
        let _guard = self.lock().await;
        self.reset_locked().await?;
        self.restore_locked(true).await
    }

    /// Resource usage of a running or paused container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the container is running or paused.
    pub async fn stats(&self) -> CorralResult<crate::collaborators::ContainerStats> {
        let _guard = self.lock().await;
        self.sync_locked().await?;
        let status = self.status();
        if !matches!(status, ContainerStatus::Running | ContainerStatus::Paused) {
            return Err(self.invalid_state("get stats of", status));
        }
        self.runtime
            .supervisor()
            .stats(self.id())
            .await
            .map_err(|e| CorralError::runtime("stats", self.id(), e))
    }

    /// Acquire the lock and sync once for a sequence of operations.
    ///
    /// # Errors
    ///
    /// Returns `Removed` if the container no longer exists.
    pub async fn begin_batch(&self) -> CorralResult<Batch> {
        let guard = self.lock().await;
        self.sync_locked().await?;
        Ok(Batch::new(self.clone(), guard))
    }
}
