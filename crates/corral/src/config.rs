//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use corral_common::{CorralError, CorralPaths, CorralResult};
use serde::Deserialize;

/// Runtime configuration options.
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// stop_timeout = 30
/// exit_marker_timeout_ms = 2000
///
/// [paths]
/// root = "/var/lib/corral"
/// runtime = "/run/corral"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Paths for runtime data.
    pub paths: CorralPaths,
    /// Default stop timeout (seconds) before the supervisor escalates to SIGKILL.
    pub stop_timeout: u64,
    /// Bound on the wait for an exit marker once the process is known gone.
    pub exit_marker_timeout_ms: u64,
    /// Bound on the wait for an exec session's pid file.
    pub exec_pid_timeout_ms: u64,
    /// Poll interval used by unbounded waits.
    pub wait_poll_interval_ms: u64,
    /// Number of locks in the allocator pool.
    pub num_locks: u32,
    /// Run containers without cgroups; disables pause and group signalling.
    pub no_cgroups: bool,
    /// Kill a stale supervisor process left behind by older supervisors on restart.
    pub kill_stale_supervisor: bool,
    /// Command run by infra containers.
    pub infra_command: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: CorralPaths::new(),
            stop_timeout: 10,
            exit_marker_timeout_ms: 5000,
            exec_pid_timeout_ms: 5000,
            wait_poll_interval_ms: 100,
            num_locks: 2048,
            no_cgroups: false,
            kill_stale_supervisor: false,
            infra_command: vec!["/pause".to_string()],
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from TOML.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the document is malformed or contains
    /// unknown keys.
    pub fn from_toml_str(content: &str) -> CorralResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| CorralError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_toml_file(path: impl AsRef<Path>) -> CorralResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loaded runtime configuration");
        Self::from_toml_str(&content)
    }

    /// Check invariants that serde cannot express.
    fn validate(&self) -> CorralResult<()> {
        if self.num_locks == 0 {
            return Err(CorralError::Config {
                message: "num_locks must be greater than zero".to_string(),
            });
        }
        if self.wait_poll_interval_ms == 0 {
            return Err(CorralError::Config {
                message: "wait_poll_interval_ms must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = CorralPaths::with_root(root);
        self
    }

    /// Set the default stop timeout (seconds).
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: u64) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the bounded exit-marker wait.
    #[must_use]
    pub fn with_exit_marker_timeout(mut self, timeout: Duration) -> Self {
        self.exit_marker_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the bounded exec pid-file wait.
    #[must_use]
    pub fn with_exec_pid_timeout(mut self, timeout: Duration) -> Self {
        self.exec_pid_timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the lock pool size.
    #[must_use]
    pub const fn with_num_locks(mut self, num_locks: u32) -> Self {
        self.num_locks = num_locks;
        self
    }

    /// Disable cgroups.
    #[must_use]
    pub const fn without_cgroups(mut self) -> Self {
        self.no_cgroups = true;
        self
    }

    /// Enable the legacy stale-supervisor kill on restart.
    #[must_use]
    pub const fn with_stale_supervisor_kill(mut self) -> Self {
        self.kill_stale_supervisor = true;
        self
    }

    /// Bounded wait applied to exit markers.
    #[must_use]
    pub const fn exit_marker_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_marker_timeout_ms)
    }

    /// Bounded wait applied to exec pid files.
    #[must_use]
    pub const fn exec_pid_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_pid_timeout_ms)
    }

    /// Poll interval for unbounded waits.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
