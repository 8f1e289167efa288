//! Health check monitoring.

use std::time::Duration;

use chrono::{DateTime, Utc};
use corral_common::{ContainerId, CorralError, CorralResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::container::{ContainerRef, ContainerStatus};
use crate::events::EventKind;

/// Health check command run periodically inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Command to run; exit code zero means healthy.
    pub command: Vec<String>,
    /// Time between checks in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Per-check timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before the container is unhealthy.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

const fn default_interval_ms() -> u64 {
    30_000
}

const fn default_timeout_ms() -> u64 {
    30_000
}

const fn default_retries() -> u32 {
    3
}

impl HealthCheck {
    /// Check with default interval, timeout and retries.
    #[must_use]
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
        }
    }

    /// Set the interval between checks.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the failure threshold.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Time between checks.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Per-check timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Health status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No verdict yet.
    #[default]
    Starting,
    /// Last check passed.
    Healthy,
    /// Failed `retries` checks in a row.
    Unhealthy,
}

/// Recorded health of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    /// Current verdict.
    pub status: HealthStatus,
    /// Consecutive failed checks.
    pub failing_streak: u32,
    /// When the last check finished.
    pub last_check: Option<DateTime<Utc>>,
}

impl HealthState {
    /// Fold one check result into the state.
    pub fn record(&mut self, passed: bool, retries: u32) {
        self.last_check = Some(Utc::now());
        if passed {
            self.failing_streak = 0;
            self.status = HealthStatus::Healthy;
        } else {
            self.failing_streak = self.failing_streak.saturating_add(1);
            if self.failing_streak >= retries.max(1) {
                self.status = HealthStatus::Unhealthy;
            }
        }
    }
}

/// Periodic health check timers, one per running container.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    timers: DashMap<ContainerId, JoinHandle<()>>,
}

impl HealthMonitor {
    /// Create a monitor with no timers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a timer is running for the container.
    #[must_use]
    pub fn is_active(&self, id: &ContainerId) -> bool {
        self.timers.contains_key(id)
    }

    /// Start the timer for a container that has a health check configured.
    ///
    /// The timer only holds a weak reference to the runtime and ends on its
    /// own once the runtime or the container is gone.
    pub(crate) fn start(&self, container: &ContainerRef) {
        let Some(check) = container.config().health_check.clone() else {
            return;
        };
        let runtime = container.runtime().downgrade();
        let id = container.id().clone();

        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check.interval());
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(runtime) = runtime.upgrade() else { break };
                let Ok(container) = runtime.container(&task_id) else { break };
                match container.run_health_check().await {
                    Ok(_) => {}
                    Err(e) if e.is_invalid_state() => break,
                    Err(CorralError::Removed { .. }) => break,
                    Err(e) => {
                        tracing::warn!(container_id = %task_id, error = %e, "Health check failed to run");
                    }
                }
            }
        });

        tracing::debug!(container_id = %id, "Started health check timer");
        if let Some(previous) = self.timers.insert(id, handle) {
            previous.abort();
        }
    }

    /// Cancel a container's timer.
    pub(crate) fn stop(&self, id: &ContainerId) {
        if let Some((_, handle)) = self.timers.remove(id) {
            handle.abort();
            tracing::debug!(container_id = %id, "Stopped health check timer");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.value().abort();
        }
    }
}

impl ContainerRef {
    /// Run the configured health check once and record the result.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the container is running, and a
    /// configuration error if it has no health check.
    pub async fn run_health_check(&self) -> CorralResult<HealthStatus> {
        let check = self
            .config()
            .health_check
            .clone()
            .ok_or_else(|| CorralError::Config {
                message: format!("container {} has no health check", self.id()),
            })?;
        let status = self.status();
        if status != ContainerStatus::Running {
            return Err(self.invalid_state("health check", status));
        }

        let passed = match self
            .runtime()
            .supervisor()
            .exec_sync(self.id(), &check.command, check.timeout())
            .await
        {
            Ok(output) => output.exit_code == 0,
            Err(e) => {
                tracing::debug!(container_id = %self.id(), error = %e, "Health check command failed");
                false
            }
        };

        let _guard = self.lock().await;
        self.ensure_valid()?;
        let (before, after) = self.update(|state| {
            let health = state.health.get_or_insert_with(HealthState::default);
            let before = health.status;
            health.record(passed, check.retries);
            (before, health.status)
        });
        self.save()?;

        if before != after {
            tracing::info!(container_id = %self.id(), health = ?after, "Health status changed");
            self.emit(EventKind::HealthStatus);
        }
        Ok(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streak_reaches_unhealthy_after_retries() {
        let mut state = HealthState::default();
        state.record(false, 3);
        state.record(false, 3);
        assert_eq!(state.status, HealthStatus::Starting);
        state.record(false, 3);
        assert_eq!(state.status, HealthStatus::Unhealthy);
        assert_eq!(state.failing_streak, 3);
    }

    #[test]
    fn success_resets_streak() {
        let mut state = HealthState::default();
        state.record(false, 2);
        state.record(true, 2);
        assert_eq!(state.status, HealthStatus::Healthy);
        assert_eq!(state.failing_streak, 0);
    }

    #[test]
    fn check_defaults_from_json() {
        let check: HealthCheck = serde_json::from_str(r#"{"command":["true"]}"#).unwrap();
        assert_eq!(check.interval(), Duration::from_secs(30));
        assert_eq!(check.retries, 3);
    }
}
