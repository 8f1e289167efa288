//! Container removal, shared by single-container and pod removal.

use std::io::ErrorKind;
use std::time::Duration;

use corral_common::{CorralError, CorralResult};

use super::ContainerRef;
use super::state::ContainerStatus;
use crate::events::EventKind;
use crate::teardown::Teardown;

impl ContainerRef {
    /// Refuse removal of anything still running unless `force` is set.
    pub(crate) fn check_removable(&self, force: bool) -> CorralResult<()> {
        let status = self.status();
        if matches!(status, ContainerStatus::Removing | ContainerStatus::Unknown) {
            return Err(self.invalid_state("remove", status));
        }
        if force {
            return Ok(());
        }
        if matches!(status, ContainerStatus::Running | ContainerStatus::Paused) {
            return Err(CorralError::invalid_state(
                self.id(),
                "remove container",
                format!("container is {status}; stop it first or force removal"),
            ));
        }
        let sessions = self.exec_sessions().len();
        if sessions > 0 {
            return Err(CorralError::invalid_state(
                self.id(),
                "remove container",
                format!("{sessions} exec sessions are still running"),
            ));
        }
        Ok(())
    }

    /// Stop exec sessions and the main process ahead of a forced removal.
    pub(crate) async fn stop_for_removal_locked(&self) -> CorralResult<()> {
        let seconds = self
            .config()
            .stop_timeout
            .unwrap_or(self.runtime().config().stop_timeout);
        if !self.exec_sessions().is_empty() {
            self.stop_exec_sessions_locked(Duration::from_secs(seconds))
                .await?;
            self.update(|state| state.exec_sessions.clear());
            self.save()?;
        }
        if self.status() == ContainerStatus::Paused {
            self.unpause_locked().await?;
        }
        if self.status() == ContainerStatus::Running {
            self.stop_locked(None).await?;
        }
        Ok(())
    }

    /// Release everything the container holds and forget it.
    ///
    /// Every step is attempted; the first error is returned afterwards. The
    /// container is gone from the runtime either way.
    pub(crate) async fn remove_locked(&self) -> CorralResult<()> {
        let runtime = self.runtime();
        let id = self.id();
        tracing::info!(container_id = %id, "Removing container");
        let mut teardown = Teardown::new(format!("container {id}"));

        teardown.record("clean up", self.teardown_locked().await);

        let storage = match runtime.storage().delete_container(id).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        };
        teardown.record("delete storage", storage);

        let marker = runtime.config().paths.exit_marker(id.as_str());
        let marker: CorralResult<()> = match std::fs::remove_file(&marker) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other.map_err(Into::into),
        };
        teardown.record("remove exit marker", marker);

        let exec_dir = runtime.config().paths.exec_dir(id.as_str());
        let exec_dir: CorralResult<()> = match std::fs::remove_dir_all(&exec_dir) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other.map_err(Into::into),
        };
        teardown.record("remove exec directory", exec_dir);

        self.update(|state| state.status = ContainerStatus::Removing);
        teardown.record("remove from store", runtime.store().remove_container(id));

        self.invalidate();
        runtime.locks().free(self.lock_index());
        runtime.inner().containers.remove(id);
        self.emit(EventKind::Remove);
        tracing::info!(container_id = %id, "Removed container");
        teardown.finish()
    }
}
