//! Lifecycle transitions of a single container.

use std::time::Duration;

use chrono::Utc;
use corral_common::{CorralError, CorralResult};

use super::restart::should_restart;
use super::state::{BindMount, ContainerStatus};
use super::ContainerRef;
use crate::collaborators::CreateRequest;
use crate::container::NamespaceMode;
use crate::events::EventKind;
use crate::graph::{self, DependencyGraph, WalkError, WalkOperation};
use crate::teardown::Teardown;

impl ContainerRef {
    /// Whether stop and kill signal every process in the container's cgroup
    /// rather than only the main process.
    ///
    /// Without a private PID namespace, killing the main process does not
    /// take the rest of the container down with it.
    fn signals_whole_group(&self) -> bool {
        self.config().namespaces.pid == NamespaceMode::Host
            && !self.runtime().config().no_cgroups
            && self.runtime().supervisor().supports_cgroups()
    }

    fn require_cgroups(&self, feature: &str) -> CorralResult<()> {
        if self.runtime().config().no_cgroups || !self.runtime().supervisor().supports_cgroups() {
            return Err(CorralError::Unsupported {
                feature: format!("{feature} without cgroups"),
            });
        }
        Ok(())
    }

    /// Make sure dependencies are running, starting them when `recursive`.
    async fn prepare_dependencies(&self, recursive: bool) -> CorralResult<()> {
        let dependencies = self.config().dependencies();
        if dependencies.is_empty() {
            return Ok(());
        }

        if recursive {
            let closure = graph::dependency_closure(self.runtime(), self.id())?;
            let graph = DependencyGraph::build(&closure)?;
            tracing::debug!(
                container_id = %self.id(),
                dependencies = graph.len(),
                "Starting dependencies"
            );
            return match graph::walk(&graph, WalkOperation::Start).await {
                Ok(()) => Ok(()),
                Err(WalkError::NotStarted(e)) => Err(e),
                Err(WalkError::Partial { failures, .. }) => {
                    let dependency = failures.keys().next().map(ToString::to_string);
                    Err(CorralError::DependencyFailed {
                        container: self.id().to_string(),
                        dependency: dependency.unwrap_or_default(),
                    })
                }
            };
        }

        let mut resolved = Vec::with_capacity(dependencies.len());
        for id in &dependencies {
            if id == self.id() {
                return Err(CorralError::CycleDetected {
                    containers: vec![id.to_string()],
                });
            }
            let dependency = self.runtime().container(id).map_err(|_| {
                CorralError::DependencyNotFound {
                    container: self.id().to_string(),
                    dependency: id.to_string(),
                }
            })?;
            resolved.push(dependency);
        }
        resolved.sort_by_key(ContainerRef::lock_index);

        // Dependency locks are held one at a time.
        let mut not_running = Vec::new();
        for dependency in &resolved {
            let _guard = dependency.lock().await;
            dependency.sync_locked().await?;
            if !dependency.status().is_running() {
                not_running.push(dependency.id().to_string());
            }
        }
        if not_running.is_empty() {
            Ok(())
        } else {
            Err(CorralError::invalid_state(
                self.id(),
                "init container",
                format!("dependencies are not running: {}", not_running.join(", ")),
            ))
        }
    }

    pub(crate) async fn init_locked(&self, recursive: bool) -> CorralResult<()> {
        let status = self.status();
        if !status.can_init() {
            return Err(self.invalid_state("init", status));
        }

        self.prepare_dependencies(recursive).await?;

        if status.has_exited() {
            tracing::debug!(container_id = %self.id(), "Reinitializing container");
            self.teardown_locked().await?;
        }

        if let Err(e) = self.create_in_runtime().await {
            if let Err(cleanup) = self.teardown_locked().await {
                tracing::warn!(
                    container_id = %self.id(),
                    error = %cleanup,
                    "Cleanup after failed init also failed"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    async fn create_in_runtime(&self) -> CorralResult<()> {
        let runtime = self.runtime();
        let id = self.id();
        tracing::info!(container_id = %id, "Initializing container");

        let marker = runtime.config().paths.exit_marker(id.as_str());
        match std::fs::remove_file(&marker) {
            Ok(()) => tracing::debug!(container_id = %id, "Removed stale exit marker"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mountpoint = runtime.storage().mount(id).await?;
        self.update(|state| {
            state.mountpoint = Some(mountpoint.clone());
            state.mounted = true;
        });

        for mount in &self.config().volumes {
            let volume = runtime.volume(&mount.name)?;
            let source = volume.mount().await?;
            self.update(|state| {
                state.bind_mounts.push(BindMount {
                    volume: mount.name.clone(),
                    source,
                    destination: mount.destination.clone(),
                    options: mount.options.clone(),
                });
            });
        }

        if self.config().namespaces.network == NamespaceMode::Private {
            let netns = runtime.network().create_namespace(id).await?;
            self.update(|state| state.netns_path = Some(netns.clone()));
            let network = runtime
                .network()
                .setup(&netns, self.config().network_name(), id)
                .await?;
            self.update(|state| state.network = Some(network));
        }

        let state = self.state();
        let request = CreateRequest {
            config: self.inner.config.clone(),
            mountpoint,
            run_dir: runtime.storage().run_dir(id).await?,
            netns_path: state.netns_path,
            bind_mounts: state.bind_mounts,
            exit_marker: marker,
            no_cgroups: runtime.config().no_cgroups,
        };
        let created = runtime
            .supervisor()
            .create(&request)
            .await
            .map_err(|e| CorralError::runtime("create", id, e))?;

        self.update(|state| {
            state.status = ContainerStatus::Created;
            state.pid = Some(created.pid);
            state.supervisor_pid = created.supervisor_pid;
            state.exit_code = None;
            state.created_at = Some(Utc::now());
        });
        self.save()?;
        self.emit(EventKind::Init);
        Ok(())
    }

    pub(crate) async fn start_locked(&self, recursive: bool) -> CorralResult<()> {
        let status = self.status();
        if !status.can_start() {
            return Err(self.invalid_state("start", status));
        }

        if status == ContainerStatus::Created {
            self.prepare_dependencies(recursive).await?;
        } else {
            self.init_locked(recursive).await?;
        }

        tracing::info!(container_id = %self.id(), "Starting container");
        if let Err(e) = self.runtime().supervisor().start(self.id()).await {
            if let Err(cleanup) = self.teardown_locked().await {
                tracing::warn!(
                    container_id = %self.id(),
                    error = %cleanup,
                    "Cleanup after failed start also failed"
                );
            }
            return Err(CorralError::runtime("start", self.id(), e));
        }

        self.update(|state| {
            state.status = ContainerStatus::Running;
            state.started_at = Some(Utc::now());
            state.stopped_by_user = false;
            state.restart_policy_match = false;
        });
        self.save()?;
        self.emit(EventKind::Start);
        self.runtime().health().start(self);
        Ok(())
    }

    pub(crate) async fn stop_locked(&self, timeout: Option<u64>) -> CorralResult<()> {
        let status = self.status();
        match status {
            ContainerStatus::Stopped | ContainerStatus::Exited => {
                tracing::debug!(container_id = %self.id(), %status, "Container already stopped");
                return Ok(());
            }
            ContainerStatus::Created | ContainerStatus::Running => {}
            _ => return Err(self.invalid_state("stop", status)),
        }

        let runtime = self.runtime();
        let timeout = timeout
            .or(self.config().stop_timeout)
            .unwrap_or(runtime.config().stop_timeout);
        let kill_all = self.signals_whole_group();
        tracing::info!(
            container_id = %self.id(),
            timeout,
            kill_all,
            "Stopping container"
        );

        runtime.health().stop(self.id());
        runtime
            .supervisor()
            .stop(
                self.id(),
                self.config().stop_signal,
                Duration::from_secs(timeout),
                kill_all,
            )
            .await
            .map_err(|e| CorralError::runtime("stop", self.id(), e))?;

        let marker = runtime.config().paths.exit_marker(self.id().as_str());
        let bound = Duration::from_secs(timeout) + runtime.config().exit_marker_timeout();
        let exit_code =
            super::wait_for_exit_marker(&marker, Some(bound), runtime.config().poll_interval())
                .await;

        self.update(|state| {
            state.set_exited(exit_code);
            state.stopped_by_user = true;
            state.restart_policy_match = false;
        });
        self.save()?;
        self.emit_with_code(EventKind::Stop, Some(exit_code));
        Ok(())
    }

    pub(crate) async fn kill_locked(&self, signal: i32) -> CorralResult<()> {
        let status = self.status();
        if status != ContainerStatus::Running {
            return Err(self.invalid_state("kill", status));
        }

        tracing::info!(container_id = %self.id(), signal, "Killing container");
        self.runtime()
            .supervisor()
            .kill(self.id(), signal, self.signals_whole_group())
            .await
            .map_err(|e| CorralError::runtime("kill", self.id(), e))?;
        self.emit(EventKind::Kill);
        Ok(())
    }

    pub(crate) async fn pause_locked(&self) -> CorralResult<()> {
        let status = self.status();
        if status != ContainerStatus::Running {
            return Err(self.invalid_state("pause", status));
        }
        self.require_cgroups("pause")?;

        tracing::info!(container_id = %self.id(), "Pausing container");
        self.runtime()
            .supervisor()
            .pause(self.id())
            .await
            .map_err(|e| CorralError::runtime("pause", self.id(), e))?;
        self.update(|state| state.status = ContainerStatus::Paused);
        self.save()?;
        self.emit(EventKind::Pause);
        Ok(())
    }

    pub(crate) async fn unpause_locked(&self) -> CorralResult<()> {
        let status = self.status();
        if status != ContainerStatus::Paused {
            return Err(self.invalid_state("unpause", status));
        }
        self.require_cgroups("unpause")?;

        tracing::info!(container_id = %self.id(), "Unpausing container");
        self.runtime()
            .supervisor()
            .unpause(self.id())
            .await
            .map_err(|e| CorralError::runtime("unpause", self.id(), e))?;
        self.update(|state| state.status = ContainerStatus::Running);
        self.save()?;
        self.emit(EventKind::Unpause);
        Ok(())
    }

    pub(crate) async fn restart_locked(&self, timeout: Option<u64>) -> CorralResult<()> {
        let status = self.status();
        if !status.can_restart() {
            return Err(self.invalid_state("restart", status));
        }
        tracing::info!(container_id = %self.id(), %status, "Restarting container");

        if self.runtime().config().kill_stale_supervisor {
            if let Some(pid) = self.state().supervisor_pid {
                if let Err(e) = self.runtime().supervisor().kill_stale_supervisor(pid).await {
                    tracing::warn!(
                        container_id = %self.id(),
                        supervisor_pid = pid,
                        error = %e,
                        "Failed to kill stale supervisor"
                    );
                }
            }
        }

        if status == ContainerStatus::Running {
            self.stop_locked(timeout).await?;
        }
        // From Stopped, start reinitializes, recreating the network namespace.
        self.start_locked(false).await?;
        self.emit(EventKind::Restart);
        Ok(())
    }

    pub(crate) async fn cleanup_locked(&self) -> CorralResult<()> {
        let status = self.status();
        if matches!(status, ContainerStatus::Running | ContainerStatus::Paused) {
            return Err(self.invalid_state("clean up", status));
        }

        let state = self.state();
        if state.restart_policy_match {
            let policy = self.config().restart_policy;
            let exit_code = state.exit_code.unwrap_or(-1);
            if should_restart(policy, exit_code, state.restart_count, true) {
                return self.handle_restart_policy().await;
            }
            tracing::debug!(
                container_id = %self.id(),
                exit_code,
                restart_count = state.restart_count,
                "Restart policy declined restart"
            );
            self.update(|state| state.restart_policy_match = false);
        }

        self.teardown_locked().await?;
        self.emit(EventKind::Cleanup);
        Ok(())
    }

    async fn handle_restart_policy(&self) -> CorralResult<()> {
        let count = self.update(|state| {
            state.restart_count += 1;
            state.restart_policy_match = false;
            state.restart_count
        });
        tracing::info!(
            container_id = %self.id(),
            restart_count = count,
            "Restarting container per restart policy"
        );
        self.save()?;
        self.start_locked(false).await?;
        self.emit(EventKind::Restart);
        Ok(())
    }

    /// Release everything held by the last run, attempting every step.
    ///
    /// Stopped becomes Exited and Created becomes Configured.
    pub(crate) async fn teardown_locked(&self) -> CorralResult<()> {
        let runtime = self.runtime();
        let id = self.id();
        let mut teardown = Teardown::new(format!("container {id}"));

        runtime.health().stop(id);

        let state = self.state();
        if let Some(netns) = &state.netns_path {
            let name = self.config().network_name();
            teardown.record(
                "tear down network",
                runtime.network().teardown(netns, name, id).await,
            );
            teardown.record(
                "destroy network namespace",
                runtime.network().destroy_namespace(netns).await,
            );
            self.update(|state| {
                state.netns_path = None;
                state.network = None;
            });
        }

        for mount in &state.bind_mounts {
            let result = match runtime.volume(&mount.volume) {
                Ok(volume) => volume.unmount(false).await,
                Err(e) => Err(e),
            };
            teardown.record("unmount volume", result);
        }
        self.update(|state| state.bind_mounts.clear());

        if state.mounted {
            teardown.record("unmount storage", runtime.storage().unmount(id, false).await);
            self.update(|state| {
                state.mounted = false;
                state.mountpoint = None;
            });
        }

        if matches!(state.status, ContainerStatus::Created | ContainerStatus::Stopped) {
            let result = match runtime.supervisor().delete(id).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other.map_err(|e| CorralError::runtime("delete", id, e)),
            };
            teardown.record("delete from supervisor", result);
        }

        self.update(|state| {
            state.pid = None;
            state.status = match state.status {
                ContainerStatus::Stopped => ContainerStatus::Exited,
                ContainerStatus::Created => ContainerStatus::Configured,
                other => other,
            };
        });
        teardown.record("save state", self.save());
        teardown.finish()
    }

    /// Reset state that does not survive a reboot, remembering what to
    /// restore.
    pub(crate) async fn reset_locked(&self) -> CorralResult<()> {
        self.ensure_valid()?;
        let state = self.state();
        let restore = state.status.has_live_process().then_some(state.status);

        if let Some(netns) = &state.netns_path {
            let network = self.runtime().network();
            let name = self.config().network_name();
            if let Err(e) = network.teardown(netns, name, self.id()).await {
                tracing::warn!(container_id = %self.id(), error = %e, "Failed to release stale network");
            }
            if let Err(e) = network.destroy_namespace(netns).await {
                tracing::warn!(container_id = %self.id(), error = %e, "Failed to remove stale network namespace");
            }
        }

        for mount in &state.bind_mounts {
            let released = match self.runtime().volume(&mount.volume) {
                Ok(volume) => volume.unmount(false).await,
                Err(e) => Err(e),
            };
            if let Err(e) = released {
                tracing::warn!(container_id = %self.id(), volume = %mount.volume, error = %e, "Failed to release stale volume mount");
            }
        }

        self.update(|state| {
            if state.status != ContainerStatus::Exited {
                state.status = ContainerStatus::Configured;
            }
            state.restore_status = restore;
            state.reset_ephemeral();
        });
        self.save()?;
        tracing::debug!(container_id = %self.id(), ?restore, "Refreshed container state");
        self.emit(EventKind::Refresh);
        Ok(())
    }

    /// Bring the container back to the status recorded by the last reset.
    pub(crate) async fn restore_locked(&self, recursive: bool) -> CorralResult<()> {
        let Some(target) = self.state().restore_status else {
            return Ok(());
        };
        self.update(|state| state.restore_status = None);
        self.save()?;

        tracing::info!(container_id = %self.id(), status = %target, "Restoring container");
        match target {
            ContainerStatus::Running => self.start_locked(recursive).await,
            ContainerStatus::Paused => {
                self.start_locked(recursive).await?;
                self.pause_locked().await
            }
            ContainerStatus::Created => self.init_locked(recursive).await,
            _ => Ok(()),
        }
    }
}
