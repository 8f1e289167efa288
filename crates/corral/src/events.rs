//! Lifecycle event definitions and bus.

use std::fmt;

use chrono::{DateTime, Utc};
use corral_common::{ContainerId, CorralResult, PodId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kind of lifecycle event.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Init,
    Start,
    Stop,
    Kill,
    Pause,
    Unpause,
    Restart,
    Cleanup,
    Refresh,
    /// The main process exited without being asked to.
    Died,
    Exec,
    ExecDied,
    HealthStatus,
    Remove,
    PodCreate,
    PodStart,
    PodStop,
    PodKill,
    PodPause,
    PodUnpause,
    PodRestart,
    PodRemove,
    VolumeCreate,
    VolumeMount,
    VolumeUnmount,
    VolumeRemove,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&name)
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Container concerned, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<ContainerId>,
    /// Pod concerned, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_id: Option<PodId>,
    /// Named volume concerned, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Exit code, for exit-related events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Event {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            container_id: None,
            pod_id: None,
            volume: None,
            timestamp: Utc::now(),
            exit_code: None,
        }
    }

    /// Attach a container.
    #[must_use]
    pub fn container(mut self, id: &ContainerId) -> Self {
        self.container_id = Some(id.clone());
        self
    }

    /// Attach a pod.
    #[must_use]
    pub fn pod(mut self, id: Option<&PodId>) -> Self {
        self.pod_id = id.cloned();
        self
    }

    /// Attach a named volume.
    #[must_use]
    pub fn volume(mut self, name: &str) -> Self {
        self.volume = Some(name.to_string());
        self
    }

    /// Attach an exit code.
    #[must_use]
    pub const fn exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }
}

/// Consumer of lifecycle events.
///
/// Delivery is fire-and-forget: a failing sink is logged and never retried.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Publish one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink could not accept the event.
    fn publish(&self, event: Event) -> CorralResult<()>;
}

/// In-process event bus backed by a broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: Event) -> CorralResult<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}
