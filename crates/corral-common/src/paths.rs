//! Standard filesystem paths for Corral.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Default root directory for persisted Corral data.
pub static CORRAL_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CORRAL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/corral"))
});

/// Default runtime directory (exit markers, exec pid files).
pub static CORRAL_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CORRAL_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/corral"))
});

/// Standard paths used by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorralPaths {
    /// Root data directory (default: /var/lib/corral).
    pub root: PathBuf,
    /// Runtime directory (default: /run/corral). Expected to be wiped on reboot.
    pub runtime: PathBuf,
}

impl CorralPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    ///
    /// The runtime directory is placed under the root.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Directory holding the persisted state store.
    #[must_use]
    pub fn state(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Directory for per-container data.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// Directory where the supervisor writes exit markers.
    #[must_use]
    pub fn exits(&self) -> PathBuf {
        self.runtime.join("exits")
    }

    /// Exit marker for a container, holding its decimal exit code.
    #[must_use]
    pub fn exit_marker(&self, id: &str) -> PathBuf {
        self.exits().join(id)
    }

    /// Directory for a container's exec session artifacts.
    #[must_use]
    pub fn exec_dir(&self, id: &str) -> PathBuf {
        self.runtime.join("exec").join(id)
    }

    /// PID file written once an exec session's process is running.
    #[must_use]
    pub fn exec_pid_file(&self, id: &str, session: &str) -> PathBuf {
        self.exec_dir(id).join(format!("{session}.pid"))
    }

    /// Directory for named volume data.
    #[must_use]
    pub fn volumes(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Data directory of a named volume.
    #[must_use]
    pub fn volume(&self, name: &str) -> PathBuf {
        self.volumes().join(name).join("_data")
    }
}

impl Default for CorralPaths {
    fn default() -> Self {
        Self {
            root: CORRAL_ROOT.clone(),
            runtime: CORRAL_RUNTIME_DIR.clone(),
        }
    }
}
