//! Runtime supervisor interface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use corral_common::{ContainerId, CorralResult, ExecSessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::container::{BindMount, ContainerConfig, ExecConfig};

/// Status of a container as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorStatus {
    /// Created, main process not started.
    Created,
    /// Main process running.
    Running,
    /// Frozen.
    Paused,
    /// Main process gone.
    Stopped,
}

/// Everything the supervisor needs to create a container.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Immutable container configuration.
    pub config: Arc<ContainerConfig>,
    /// Root filesystem mount point.
    pub mountpoint: PathBuf,
    /// Per-container run directory from storage.
    pub run_dir: PathBuf,
    /// Network namespace to join, when the container owns one.
    pub netns_path: Option<PathBuf>,
    /// Named volume mounts.
    pub bind_mounts: Vec<BindMount>,
    /// Where the exit code must be written once the main process exits.
    pub exit_marker: PathBuf,
    /// Place the container without cgroups.
    pub no_cgroups: bool,
}

/// Processes created for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedProcess {
    /// Main process PID.
    pub pid: u32,
    /// PID of the supervisor process monitoring it.
    pub supervisor_pid: Option<u32>,
}

/// Request to start an exec session.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Session identifier.
    pub session: ExecSessionId,
    /// What to run.
    pub config: ExecConfig,
    /// File the supervisor writes the session PID to once it is running.
    pub pid_file: PathBuf,
}

/// A launched exec session.
#[derive(Debug)]
pub struct ExecProcess {
    /// Resolves with the exit code once the process has been reaped.
    pub exited: oneshot::Receiver<i32>,
}

/// Output of a synchronous exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSyncOutput {
    /// Exit code of the process.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

/// Container statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// CPU usage in microseconds.
    pub cpu_usage_usec: u64,
    /// Memory usage in bytes.
    pub memory_usage_bytes: u64,
    /// Number of processes.
    pub pids: u64,
}

/// The external process supervisor that actually runs containers.
///
/// Failures are fatal to the requested transition only.
#[async_trait]
pub trait RuntimeSupervisor: Send + Sync + std::fmt::Debug {
    /// Create the container without starting its main process.
    async fn create(&self, request: &CreateRequest) -> CorralResult<CreatedProcess>;

    /// Start the main process of a created container.
    async fn start(&self, id: &ContainerId) -> CorralResult<()>;

    /// Send `signal`, wait up to `timeout`, then SIGKILL.
    ///
    /// With `kill_all` every process in the container's cgroup is signalled.
    async fn stop(
        &self,
        id: &ContainerId,
        signal: i32,
        timeout: Duration,
        kill_all: bool,
    ) -> CorralResult<()>;

    /// Send a signal.
    async fn kill(&self, id: &ContainerId, signal: i32, kill_all: bool) -> CorralResult<()>;

    /// Freeze every process in the container.
    async fn pause(&self, id: &ContainerId) -> CorralResult<()>;

    /// Thaw a frozen container.
    async fn unpause(&self, id: &ContainerId) -> CorralResult<()>;

    /// Deregister the container. Returns `NotFound` if it is not registered.
    async fn delete(&self, id: &ContainerId) -> CorralResult<()>;

    /// Current status. Returns `NotFound` if it is not registered.
    async fn status(&self, id: &ContainerId) -> CorralResult<SupervisorStatus>;

    /// Launch an exec session.
    async fn exec(&self, id: &ContainerId, request: &ExecRequest) -> CorralResult<ExecProcess>;

    /// Run a command to completion inside the container.
    async fn exec_sync(
        &self,
        id: &ContainerId,
        command: &[String],
        timeout: Duration,
    ) -> CorralResult<ExecSyncOutput>;

    /// Stop a running exec session.
    async fn stop_exec(
        &self,
        id: &ContainerId,
        session: &ExecSessionId,
        timeout: Duration,
    ) -> CorralResult<()>;

    /// Resource usage.
    async fn stats(&self, id: &ContainerId) -> CorralResult<ContainerStats>;

    /// Whether the supervisor manages cgroups.
    fn supports_cgroups(&self) -> bool;

    /// Kill a leftover supervisor process by PID.
    async fn kill_stale_supervisor(&self, supervisor_pid: u32) -> CorralResult<()>;
}
