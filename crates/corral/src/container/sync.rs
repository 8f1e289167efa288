//! State synchronization and exit detection.

use std::path::Path;
use std::time::Duration;

use corral_common::{CorralError, CorralResult};
use tokio::time::Instant;

use super::restart::policy_matches_exit;
use super::state::ContainerStatus;
use super::ContainerRef;
use crate::collaborators::SupervisorStatus;
use crate::events::EventKind;

/// First delay between exit-marker polls; doubled up to the poll interval.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Read an exit marker, returning the exit code it carries.
///
/// A missing or partially written marker reads as `None`.
#[must_use]
pub fn read_exit_marker(path: &Path) -> Option<i32> {
    match std::fs::read_to_string(path) {
        Ok(content) => content.trim().parse().ok(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read exit marker");
            None
        }
    }
}

/// Wait for an exit marker and return its exit code.
///
/// With a `bound`, gives up once it expires and returns -1 so callers never
/// hang on a marker the supervisor failed to write. Without one, waits until
/// the marker appears.
pub async fn wait_for_exit_marker(path: &Path, bound: Option<Duration>, poll: Duration) -> i32 {
    let deadline = bound.map(|b| Instant::now() + b);
    let mut delay = INITIAL_BACKOFF.min(poll);

    loop {
        if let Some(code) = read_exit_marker(path) {
            return code;
        }
        let mut sleep = delay;
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    path = %path.display(),
                    "Exit marker did not appear in time, assuming exit code -1"
                );
                return -1;
            }
            sleep = sleep.min(deadline - now);
        }
        tokio::time::sleep(sleep).await;
        delay = (delay * 2).min(poll);
    }
}

/// How long sync waits for a missing exit marker.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ExitWait {
    Bounded(Duration),
    Unbounded,
}

impl ContainerRef {
    /// Synchronize using the configured bounded exit-marker wait.
    pub(crate) async fn sync_locked(&self) -> CorralResult<()> {
        let bound = self.runtime().config().exit_marker_timeout();
        self.sync_with(ExitWait::Bounded(bound)).await
    }

    pub(crate) async fn sync_with(&self, wait: ExitWait) -> CorralResult<()> {
        self.ensure_valid()?;

        let record = match self.runtime().store().container(self.id()) {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                self.invalidate();
                return Err(CorralError::Removed {
                    kind: "container",
                    id: self.id().to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        let before = record.state;
        self.update(|state| *state = before.clone());

        let mut after = before.clone();
        let mut exited = None;

        if before.status.has_live_process() {
            let marker = self.runtime().config().paths.exit_marker(self.id().as_str());
            exited = read_exit_marker(&marker);

            if exited.is_none() {
                match self.runtime().supervisor().status(self.id()).await {
                    Ok(SupervisorStatus::Stopped) => {
                        exited = Some(self.await_exit_marker(&marker, wait).await);
                    }
                    Ok(SupervisorStatus::Running) => after.status = ContainerStatus::Running,
                    Ok(SupervisorStatus::Paused) => after.status = ContainerStatus::Paused,
                    Ok(SupervisorStatus::Created) => {}
                    Err(e) if e.is_not_found() => {
                        tracing::debug!(container_id = %self.id(), "Supervisor lost track of container");
                        if before.status != ContainerStatus::Created {
                            exited = Some(self.await_exit_marker(&marker, wait).await);
                        }
                    }
                    Err(e) => return Err(CorralError::runtime("query status of", self.id(), e)),
                }
            }
        }

        if let Some(code) = exited {
            after.set_exited(code);
            if policy_matches_exit(self.config().restart_policy, before.status)
                && !before.stopped_by_user
            {
                after.restart_policy_match = true;
            }
        }

        if after == before {
            return Ok(());
        }

        tracing::debug!(
            container_id = %self.id(),
            from = %before.status,
            to = %after.status,
            "Synchronized container state"
        );
        self.update(|state| *state = after);
        self.save()?;

        if let Some(code) = exited {
            self.runtime().health().stop(self.id());
            tracing::info!(container_id = %self.id(), exit_code = code, "Container exited");
            self.emit_with_code(EventKind::Died, Some(code));
        }
        Ok(())
    }

    async fn await_exit_marker(&self, marker: &Path, wait: ExitWait) -> i32 {
        let poll = self.runtime().config().poll_interval();
        match wait {
            ExitWait::Bounded(bound) => wait_for_exit_marker(marker, Some(bound), poll).await,
            ExitWait::Unbounded => wait_for_exit_marker(marker, None, poll).await,
        }
    }

    /// Wait for the main process to exit and return its exit code.
    ///
    /// Unbounded: waits as long as the container keeps running.
    ///
    /// # Errors
    ///
    /// Returns `Removed` if the container is removed while waiting.
    pub async fn wait(&self) -> CorralResult<i32> {
        let poll = self.runtime().config().poll_interval();
        loop {
            {
                let _guard = self.lock().await;
                self.sync_with(ExitWait::Unbounded).await?;
                let state = self.state();
                if state.status.has_exited() {
                    return Ok(state.exit_code.unwrap_or(-1));
                }
            }
            tokio::time::sleep(poll).await;
        }
    }
}
