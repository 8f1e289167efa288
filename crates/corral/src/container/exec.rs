//! Exec sessions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use corral_common::{CorralError, CorralResult, ExecSessionId};
use serde::{Deserialize, Serialize};

use super::state::{ContainerStatus, ExecSession};
use super::ContainerRef;
use crate::collaborators::{ExecProcess, ExecRequest};
use crate::events::EventKind;

const PID_FILE_POLL: Duration = Duration::from_millis(10);

/// Process to run inside a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Command and arguments.
    pub command: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// User to run as.
    #[serde(default)]
    pub user: Option<String>,
    /// Allocate a terminal.
    #[serde(default)]
    pub tty: bool,
}

impl ExecConfig {
    /// Run `command`.
    #[must_use]
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

enum Launch {
    Running(u32),
    Exited(i32),
}

async fn read_pid_file(path: &Path) -> u32 {
    loop {
        if let Ok(content) = tokio::fs::read_to_string(path).await {
            if let Ok(pid) = content.trim().parse() {
                return pid;
            }
        }
        tokio::time::sleep(PID_FILE_POLL).await;
    }
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "Failed to remove exec pid file");
        }
    }
}

impl ContainerRef {
    /// Run a process inside the running container and wait for it to exit.
    ///
    /// The container lock is released while the process runs, so other
    /// operations on the container are not blocked by long sessions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the container is running, and `Timeout`
    /// if the session's PID never appears.
    pub async fn exec(&self, config: ExecConfig) -> CorralResult<i32> {
        if config.command.is_empty() {
            return Err(CorralError::Config {
                message: "exec requires a command".to_string(),
            });
        }

        let guard = self.lock().await;
        self.sync_locked().await?;
        let status = self.status();
        if status != ContainerStatus::Running {
            return Err(self.invalid_state("exec in", status));
        }

        let session = {
            let state = self.inner.state.read();
            let mut session = ExecSessionId::generate();
            while state.exec_sessions.contains_key(&session) {
                session = ExecSessionId::generate();
            }
            session
        };

        let runtime = self.runtime();
        let pid_file = runtime
            .config()
            .paths
            .exec_pid_file(self.id().as_str(), session.as_str());
        if let Some(dir) = pid_file.parent() {
            std::fs::create_dir_all(dir)?;
        }

        tracing::info!(
            container_id = %self.id(),
            session = %session,
            command = ?config.command,
            "Starting exec session"
        );
        let request = ExecRequest {
            session: session.clone(),
            config: config.clone(),
            pid_file: pid_file.clone(),
        };
        let ExecProcess { mut exited } = runtime
            .supervisor()
            .exec(self.id(), &request)
            .await
            .map_err(|e| CorralError::runtime("exec in", self.id(), e))?;

        let bound = runtime.config().exec_pid_timeout();
        let launch = tokio::time::timeout(bound, async {
            tokio::select! {
                pid = read_pid_file(&pid_file) => Launch::Running(pid),
                code = &mut exited => Launch::Exited(code.unwrap_or(-1)),
            }
        })
        .await;

        let pid = match launch {
            Ok(Launch::Running(pid)) => pid,
            Ok(Launch::Exited(code)) => {
                tracing::debug!(container_id = %self.id(), session = %session, exit_code = code, "Exec session exited before reporting a pid");
                remove_pid_file(&pid_file);
                self.emit_with_code(EventKind::ExecDied, Some(code));
                return Ok(code);
            }
            Err(_) => {
                if let Err(e) = runtime
                    .supervisor()
                    .stop_exec(self.id(), &session, Duration::ZERO)
                    .await
                {
                    tracing::warn!(container_id = %self.id(), session = %session, error = %e, "Failed to stop timed out exec session");
                }
                remove_pid_file(&pid_file);
                return Err(CorralError::Timeout {
                    operation: "start exec session in".to_string(),
                    id: self.id().to_string(),
                    after_ms: runtime.config().exec_pid_timeout_ms,
                });
            }
        };

        self.update(|state| {
            state.exec_sessions.insert(
                session.clone(),
                ExecSession {
                    id: session.clone(),
                    command: config.command.clone(),
                    pid,
                    started_at: Utc::now(),
                },
            );
        });
        self.save()?;
        self.emit(EventKind::Exec);
        drop(guard);

        let code = exited.await.unwrap_or(-1);

        let _guard = self.lock().await;
        remove_pid_file(&pid_file);
        if self.is_valid() {
            let removed = self.update(|state| state.exec_sessions.remove(&session).is_some());
            if removed {
                self.save()?;
            }
        }
        tracing::info!(
            container_id = %self.id(),
            session = %session,
            exit_code = code,
            "Exec session exited"
        );
        self.emit_with_code(EventKind::ExecDied, Some(code));
        Ok(code)
    }

    /// Stop every running exec session. Used by forced removal.
    pub(crate) async fn stop_exec_sessions_locked(&self, timeout: Duration) -> CorralResult<()> {
        for session in self.exec_sessions() {
            self.runtime()
                .supervisor()
                .stop_exec(self.id(), &session.id, timeout)
                .await
                .map_err(|e| CorralError::runtime("stop exec session in", self.id(), e))?;
        }
        Ok(())
    }
}
