//! Pods: groups of containers that may share namespaces.
//!
//! A pod references its members by ID. Group operations build a dependency
//! graph over exactly the pod's members and walk it while holding the pod
//! lock.

mod remove;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use corral_common::{ContainerId, CorralError, CorralResult, PodId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::container::{ContainerConfig, ContainerRef, ContainerStatus, NamespaceMode, Namespaces};
use crate::events::{Event, EventKind};
use crate::graph::{DependencyGraph, WalkError, WalkOperation, walk};
use crate::lock::LockHandle;
use crate::runtime::Runtime;
use crate::store::PodRecord;

/// Namespaces shared by a pod's members through its infra container.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodNamespaces {
    pub network: bool,
    pub ipc: bool,
    pub uts: bool,
    pub pid: bool,
}

impl Default for PodNamespaces {
    fn default() -> Self {
        Self {
            network: true,
            ipc: true,
            uts: true,
            pid: false,
        }
    }
}

impl PodNamespaces {
    /// Point every shared, still private namespace of `namespaces` at the
    /// infra container.
    fn join(self, namespaces: &mut Namespaces, infra: &ContainerId) {
        let slots = [
            (self.network, &mut namespaces.network),
            (self.ipc, &mut namespaces.ipc),
            (self.uts, &mut namespaces.uts),
            (self.pid, &mut namespaces.pid),
        ];
        for (shared, mode) in slots {
            if shared && *mode == NamespaceMode::Private {
                *mode = NamespaceMode::Container(infra.clone());
            }
        }
    }
}

/// Pod configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodConfig {
    /// Pod ID.
    pub id: PodId,
    /// Unique human-readable name.
    pub name: String,
    /// Namespace sharing.
    #[serde(default)]
    pub namespaces: PodNamespaces,
    /// Parent cgroup for the pod's cgroup.
    #[serde(default)]
    pub cgroup_parent: Option<String>,
    /// Create and start an infra container with the pod.
    #[serde(default)]
    pub infra: bool,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl PodConfig {
    /// Pod with an infra container and default namespace sharing.
    #[must_use]
    pub fn new(id: PodId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            namespaces: PodNamespaces::default(),
            cgroup_parent: None,
            infra: true,
            labels: BTreeMap::new(),
        }
    }

    /// Create the pod without an infra container.
    #[must_use]
    pub const fn without_infra(mut self) -> Self {
        self.infra = false;
        self
    }

    /// Set the parent cgroup.
    #[must_use]
    pub fn with_cgroup_parent(mut self, parent: impl Into<String>) -> Self {
        self.cgroup_parent = Some(parent.into());
        self
    }

    fn cgroup_path(&self) -> String {
        let parent = self.cgroup_parent.as_deref().unwrap_or("corral.slice");
        format!("{}/corral-pod-{}", parent.trim_end_matches('/'), self.id)
    }
}

/// Mutable pod state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodState {
    /// Cgroup of the pod.
    pub cgroup_path: Option<String>,
    /// Infra container, once created.
    pub infra_container: Option<ContainerId>,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub(crate) struct Pod {
    config: Arc<PodConfig>,
    state: RwLock<PodState>,
    lock: LockHandle,
    valid: AtomicBool,
}

impl Pod {
    pub(crate) fn from_record(record: PodRecord, lock: LockHandle) -> Self {
        Self {
            config: Arc::new(record.config),
            state: RwLock::new(record.state),
            lock,
            valid: AtomicBool::new(true),
        }
    }

    pub(crate) fn config(&self) -> &PodConfig {
        &self.config
    }
}

/// Handle to a pod.
#[derive(Clone)]
pub struct PodRef {
    runtime: Runtime,
    inner: Arc<Pod>,
}

impl fmt::Debug for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodRef")
            .field("id", self.id())
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

impl PodRef {
    pub(crate) const fn new(runtime: Runtime, inner: Arc<Pod>) -> Self {
        Self { runtime, inner }
    }

    /// Pod ID.
    #[must_use]
    pub fn id(&self) -> &PodId {
        &self.inner.config.id
    }

    /// Pod name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Pod configuration.
    #[must_use]
    pub fn config(&self) -> &PodConfig {
        &self.inner.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> PodState {
        self.inner.state.read().clone()
    }

    /// Index of the pod's lock.
    #[must_use]
    pub fn lock_index(&self) -> u32 {
        self.inner.lock.index()
    }

    /// The infra container, if the pod has one.
    #[must_use]
    pub fn infra_container(&self) -> Option<ContainerRef> {
        let id = self.inner.state.read().infra_container.clone()?;
        self.runtime.container(&id).ok()
    }

    /// Member containers, sorted by ID.
    #[must_use]
    pub fn containers(&self) -> Vec<ContainerRef> {
        self.runtime
            .containers()
            .into_iter()
            .filter(|c| c.pod_id() == Some(self.id()))
            .collect()
    }

    /// Synchronized status of every member.
    ///
    /// # Errors
    ///
    /// Returns the first synchronization error.
    pub async fn status(&self) -> CorralResult<BTreeMap<ContainerId, ContainerStatus>> {
        let mut statuses = BTreeMap::new();
        for container in self.containers() {
            container.sync().await?;
            statuses.insert(container.id().clone(), container.status());
        }
        Ok(statuses)
    }

    fn ensure_valid(&self) -> CorralResult<()> {
        if self.inner.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CorralError::Removed {
                kind: "pod",
                id: self.id().to_string(),
            })
        }
    }

    fn emit(&self, kind: EventKind) {
        self.runtime.emit(Event::new(kind).pod(Some(self.id())));
    }

    async fn walk_members(&self, op: WalkOperation, kind: EventKind) -> Result<(), WalkError> {
        let _guard = self.inner.lock.lock().await;
        self.ensure_valid()?;

        let members = self.containers();
        tracing::info!(pod_id = %self.id(), operation = %op, members = members.len(), "Applying operation to pod");
        let graph = DependencyGraph::build(&members)?;
        let result = walk(&graph, op).await;
        self.emit(kind);
        result
    }

    /// Start every member in dependency order.
    ///
    /// # Errors
    ///
    /// See [`walk`].
    pub async fn start(&self) -> Result<(), WalkError> {
        self.walk_members(WalkOperation::Start, EventKind::PodStart).await
    }

    /// Stop every running member.
    ///
    /// # Errors
    ///
    /// See [`walk`].
    pub async fn stop(&self, timeout: Option<u64>) -> Result<(), WalkError> {
        self.walk_members(WalkOperation::Stop { timeout }, EventKind::PodStop)
            .await
    }

    /// Signal every running member.
    ///
    /// # Errors
    ///
    /// See [`walk`].
    pub async fn kill(&self, signal: i32) -> Result<(), WalkError> {
        self.walk_members(WalkOperation::Kill { signal }, EventKind::PodKill)
            .await
    }

    /// Pause every running member.
    ///
    /// # Errors
    ///
    /// See [`walk`].
    pub async fn pause(&self) -> Result<(), WalkError> {
        self.walk_members(WalkOperation::Pause, EventKind::PodPause).await
    }

    /// Unpause every paused member.
    ///
    /// # Errors
    ///
    /// See [`walk`].
    pub async fn unpause(&self) -> Result<(), WalkError> {
        self.walk_members(WalkOperation::Unpause, EventKind::PodUnpause)
            .await
    }

    /// Restart every member.
    ///
    /// # Errors
    ///
    /// See [`walk`].
    pub async fn restart(&self, timeout: Option<u64>) -> Result<(), WalkError> {
        self.walk_members(WalkOperation::Restart { timeout }, EventKind::PodRestart)
            .await
    }
}

impl Runtime {
    /// Create a pod, and its infra container if requested.
    ///
    /// The infra container is started before this returns. Containers added
    /// to the pod afterwards join its shared namespaces.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the ID or name is taken, or the infra
    /// container's error, in which case nothing is left behind.
    pub async fn new_pod(&self, config: PodConfig) -> CorralResult<PodRef> {
        if self.inner().pods.contains_key(&config.id) {
            return Err(CorralError::AlreadyExists {
                kind: "pod",
                id: config.id.to_string(),
            });
        }
        if self.pods().iter().any(|p| p.name() == config.name) {
            return Err(CorralError::AlreadyExists {
                kind: "pod name",
                id: config.name,
            });
        }

        let lock = self.locks().allocate()?;
        let record = PodRecord {
            state: PodState {
                cgroup_path: Some(config.cgroup_path()),
                infra_container: None,
                created_at: Some(Utc::now()),
            },
            config,
            lock_index: lock.index(),
        };
        if let Err(e) = self.store().add_pod(&record) {
            self.locks().free(lock.index());
            return Err(e);
        }

        let id = record.config.id.clone();
        let wants_infra = record.config.infra;
        let pod = PodRef::new(self.clone(), Arc::new(Pod::from_record(record, lock)));
        self.inner().pods.insert(id.clone(), Arc::clone(&pod.inner));
        tracing::info!(pod_id = %id, name = %pod.name(), "Created pod");
        pod.emit(EventKind::PodCreate);

        if wants_infra {
            if let Err(e) = self.create_infra(&pod).await {
                tracing::warn!(pod_id = %id, error = %e, "Failed to create infra container, removing pod");
                if let Err(cleanup) = self.remove_pod(&id, true).await {
                    tracing::warn!(pod_id = %id, error = %cleanup, "Failed to remove pod after infra failure");
                }
                return Err(e);
            }
        }
        Ok(pod)
    }

    async fn create_infra(&self, pod: &PodRef) -> CorralResult<()> {
        let id = ContainerId::generate();
        let config = ContainerConfig {
            is_infra: true,
            ..ContainerConfig::new(id.clone(), format!("{}-infra", pod.name()))
                .with_pod(pod.id().clone())
                .with_command(self.config().infra_command.clone())
        };
        let infra = self.new_container(config).await?;

        let state = {
            let mut state = pod.inner.state.write();
            state.infra_container = Some(id.clone());
            state.clone()
        };
        self.store().save_pod_state(pod.id(), &state)?;

        infra.start(false).await?;
        tracing::info!(pod_id = %pod.id(), container_id = %id, "Started infra container");
        Ok(())
    }

    /// Rewrite a new member's namespaces to join the pod's infra container.
    pub(crate) fn join_pod(&self, config: &mut ContainerConfig) -> CorralResult<()> {
        let Some(pod_id) = config.pod.clone() else {
            return Ok(());
        };
        let pod = self.pod(&pod_id)?;
        pod.ensure_valid()?;
        if config.is_infra {
            return Ok(());
        }
        if let Some(infra) = pod.state().infra_container {
            pod.config()
                .namespaces
                .join(&mut config.namespaces, &infra);
        }
        Ok(())
    }

    /// Look up a pod.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such pod.
    pub fn pod(&self, id: &PodId) -> CorralResult<PodRef> {
        self.inner()
            .pods
            .get(id)
            .map(|p| PodRef::new(self.clone(), Arc::clone(p.value())))
            .ok_or_else(|| CorralError::not_found("pod", id))
    }

    /// All pods, sorted by ID.
    #[must_use]
    pub fn pods(&self) -> Vec<PodRef> {
        let mut pods: Vec<PodRef> = self
            .inner()
            .pods
            .iter()
            .map(|p| PodRef::new(self.clone(), Arc::clone(p.value())))
            .collect();
        pods.sort_by(|a, b| a.id().cmp(b.id()));
        pods
    }
}
