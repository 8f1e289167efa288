//! Mutable container state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use corral_common::ExecSessionId;
use serde::{Deserialize, Serialize};

use crate::collaborators::NetworkStatus;
use crate::health::HealthState;

/// Container status values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Configured, nothing exists in the supervisor.
    #[default]
    Configured,
    /// Created in the supervisor, main process not started.
    Created,
    /// Main process running.
    Running,
    /// Frozen.
    Paused,
    /// Main process exited, still registered with the supervisor.
    Stopped,
    /// Exited and cleaned up.
    Exited,
    /// Being removed.
    Removing,
    /// State could not be determined.
    Unknown,
}

impl ContainerStatus {
    /// Statuses whose process may still be alive in the supervisor.
    ///
    /// A stopped container's exit has already been recorded.
    #[must_use]
    pub const fn has_live_process(&self) -> bool {
        matches!(self, Self::Created | Self::Running | Self::Paused)
    }

    /// Returns true if the container can be initialized.
    #[must_use]
    pub const fn can_init(&self) -> bool {
        matches!(self, Self::Configured | Self::Stopped | Self::Exited)
    }

    /// Returns true if the container can be started.
    #[must_use]
    pub const fn can_start(&self) -> bool {
        matches!(
            self,
            Self::Configured | Self::Created | Self::Stopped | Self::Exited
        )
    }

    /// Returns true if the container can be restarted.
    #[must_use]
    pub const fn can_restart(&self) -> bool {
        matches!(
            self,
            Self::Configured | Self::Created | Self::Running | Self::Stopped | Self::Exited
        )
    }

    /// Returns true if the container is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the main process has exited.
    #[must_use]
    pub const fn has_exited(&self) -> bool {
        matches!(self, Self::Stopped | Self::Exited)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configured => "configured",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Removing => "removing",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// An exec session running inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSession {
    /// Session ID.
    pub id: ExecSessionId,
    /// Command being run.
    pub command: Vec<String>,
    /// PID of the session process.
    pub pid: u32,
    /// When the session started.
    pub started_at: DateTime<Utc>,
}

/// A named volume mounted into a container by init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Volume name.
    pub volume: String,
    /// Host path of the volume data.
    pub source: PathBuf,
    /// Destination inside the container.
    pub destination: PathBuf,
    /// Mount options.
    #[serde(default)]
    pub options: Vec<String>,
}

/// Mutable container state, persisted after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerState {
    /// Current status.
    pub status: ContainerStatus,
    /// Main process PID.
    pub pid: Option<u32>,
    /// Supervisor process PID.
    pub supervisor_pid: Option<u32>,
    /// Exit code of the last run.
    pub exit_code: Option<i32>,
    /// When the container was last created in the supervisor.
    pub created_at: Option<DateTime<Utc>>,
    /// When the main process last started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the main process last exited.
    pub finished_at: Option<DateTime<Utc>>,
    /// Root filesystem mount point.
    pub mountpoint: Option<PathBuf>,
    /// Whether the root filesystem is mounted.
    pub mounted: bool,
    /// Running exec sessions.
    pub exec_sessions: BTreeMap<ExecSessionId, ExecSession>,
    /// Restarts performed by the restart policy.
    pub restart_count: u32,
    /// An exit was detected that the restart policy may act on.
    pub restart_policy_match: bool,
    /// The last stop was requested by a user.
    pub stopped_by_user: bool,
    /// Network namespace owned by the container.
    pub netns_path: Option<PathBuf>,
    /// Network configuration returned by the plugin.
    pub network: Option<NetworkStatus>,
    /// Named volumes mounted by init.
    pub bind_mounts: Vec<BindMount>,
    /// Health check status.
    pub health: Option<HealthState>,
    /// Status to restore after a refresh.
    pub restore_status: Option<ContainerStatus>,
}

impl ContainerState {
    /// Record an exit of the main process.
    pub fn set_exited(&mut self, exit_code: i32) {
        self.status = ContainerStatus::Stopped;
        self.exit_code = Some(exit_code);
        self.finished_at = Some(Utc::now());
        self.pid = None;
    }

    /// Clear fields that do not survive a reboot.
    pub fn reset_ephemeral(&mut self) {
        self.pid = None;
        self.supervisor_pid = None;
        self.mountpoint = None;
        self.mounted = false;
        self.exec_sessions.clear();
        self.bind_mounts.clear();
        self.netns_path = None;
        self.network = None;
        self.health = None;
    }
}
