//! The runtime context shared by every container, pod and volume.
//!
//! A [`Runtime`] owns the collaborators, the state store, the lock pool and
//! the in-memory arenas. Entities refer to each other by ID and resolve
//! those IDs through the runtime; nothing holds a direct reference to
//! another entity.

use std::fmt;
use std::sync::{Arc, Weak};

use corral_common::{ContainerId, CorralError, CorralResult, PodId};
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::collaborators::{EventSink, NetworkManager, RuntimeSupervisor, StorageService};
use crate::config::RuntimeConfig;
use crate::container::{Container, ContainerConfig, ContainerRef, ContainerState};
use crate::events::{Event, EventBus, EventKind};
use crate::graph::{DependencyGraph, WalkError, WalkOperation, walk};
use crate::health::HealthMonitor;
use crate::lock::LockManager;
use crate::pod::Pod;
use crate::store::{ContainerRecord, FileStore, StateStore};
use crate::volume::Volume;

#[derive(Debug)]
pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    store: Arc<dyn StateStore>,
    supervisor: Arc<dyn RuntimeSupervisor>,
    storage: Arc<dyn StorageService>,
    network: Arc<dyn NetworkManager>,
    sinks: Vec<Arc<dyn EventSink>>,
    events: EventBus,
    locks: LockManager,
    health: HealthMonitor,
    pub(crate) containers: DashMap<ContainerId, Arc<Container>>,
    pub(crate) pods: DashMap<PodId, Arc<Pod>>,
    pub(crate) volumes: DashMap<String, Arc<Volume>>,
}

/// Handle to the runtime. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Non-owning runtime handle, for background tasks.
#[derive(Debug, Clone)]
pub struct WeakRuntime {
    inner: Weak<RuntimeInner>,
}

impl WeakRuntime {
    /// The runtime, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    supervisor: Option<Arc<dyn RuntimeSupervisor>>,
    storage: Option<Arc<dyn StorageService>>,
    network: Option<Arc<dyn NetworkManager>>,
    store: Option<Arc<dyn StateStore>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("config", &self.config)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl RuntimeBuilder {
    /// Set the runtime supervisor. Required.
    #[must_use]
    pub fn supervisor(mut self, supervisor: Arc<dyn RuntimeSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Set the storage service. Required.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn StorageService>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the network manager. Required.
    #[must_use]
    pub fn network(mut self, network: Arc<dyn NetworkManager>) -> Self {
        self.network = Some(network);
        self
    }

    /// Use a state store other than the default file store under
    /// `<root>/state`.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add a sink that receives every event, next to the built-in bus.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build the runtime and reload every persisted entity.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a collaborator is missing, and any
    /// error raised while opening the store or reloading entities.
    pub fn build(self) -> CorralResult<Runtime> {
        let supervisor = self.supervisor.ok_or_else(|| missing("runtime supervisor"))?;
        let storage = self.storage.ok_or_else(|| missing("storage service"))?;
        let network = self.network.ok_or_else(|| missing("network manager"))?;

        let paths = &self.config.paths;
        std::fs::create_dir_all(paths.exits())?;
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(FileStore::open(paths.state())?),
        };

        let inner = RuntimeInner {
            locks: LockManager::new(self.config.num_locks),
            config: self.config,
            store,
            supervisor,
            storage,
            network,
            sinks: self.sinks,
            events: EventBus::new(),
            health: HealthMonitor::new(),
            containers: DashMap::new(),
            pods: DashMap::new(),
            volumes: DashMap::new(),
        };
        let runtime = Runtime {
            inner: Arc::new(inner),
        };
        runtime.load()?;
        Ok(runtime)
    }
}

fn missing(what: &str) -> CorralError {
    CorralError::Config {
        message: format!("a {what} is required"),
    }
}

impl Runtime {
    /// Start building a runtime.
    #[must_use]
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            supervisor: None,
            storage: None,
            network: None,
            store: None,
            sinks: Vec::new(),
        }
    }

    fn load(&self) -> CorralResult<()> {
        let inner = &self.inner;
        for record in inner.store.all_volumes()? {
            let lock = inner.locks.reserve(record.lock_index)?;
            let name = record.config.name.clone();
            inner
                .volumes
                .insert(name, Arc::new(Volume::from_record(record, lock)));
        }
        for record in inner.store.all_pods()? {
            let lock = inner.locks.reserve(record.lock_index)?;
            let id = record.config.id.clone();
            inner.pods.insert(id, Arc::new(Pod::from_record(record, lock)));
        }
        for record in inner.store.all_containers()? {
            let lock = inner.locks.reserve(record.lock_index)?;
            let id = record.config.id.clone();
            inner
                .containers
                .insert(id, Arc::new(Container::from_record(record, lock)));
        }
        tracing::info!(
            containers = inner.containers.len(),
            pods = inner.pods.len(),
            volumes = inner.volumes.len(),
            "Runtime loaded"
        );
        Ok(())
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &dyn StateStore {
        self.inner.store.as_ref()
    }

    /// The lock pool.
    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Health check timers.
    #[must_use]
    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    pub(crate) fn supervisor(&self) -> &dyn RuntimeSupervisor {
        self.inner.supervisor.as_ref()
    }

    pub(crate) fn storage(&self) -> &dyn StorageService {
        self.inner.storage.as_ref()
    }

    pub(crate) fn network(&self) -> &dyn NetworkManager {
        self.inner.network.as_ref()
    }

    pub(crate) fn inner(&self) -> &RuntimeInner {
        &self.inner
    }

    /// Non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        tracing::debug!(
            event = %event.kind,
            container_id = ?event.container_id,
            pod_id = ?event.pod_id,
            "Event"
        );
        for sink in &self.inner.sinks {
            if let Err(e) = sink.publish(event.clone()) {
                tracing::warn!(event = %event.kind, error = %e, "Event sink rejected event");
            }
        }
        if let Err(e) = self.inner.events.publish(event) {
            tracing::warn!(error = %e, "Event bus rejected event");
        }
    }

    /// Create a container.
    ///
    /// A container joining a pod with an infra container shares the pod's
    /// namespaces through it. Dependencies must already exist and belong to
    /// the same pod; named volumes must exist.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` for a duplicate ID or name,
    /// `DependencyNotFound` for an unknown dependency, `NotFound` for an
    /// unknown pod or volume and `LocksExhausted` when no lock is free.
    pub async fn new_container(&self, mut config: ContainerConfig) -> CorralResult<ContainerRef> {
        if self.inner.containers.contains_key(&config.id) {
            return Err(CorralError::AlreadyExists {
                kind: "container",
                id: config.id.to_string(),
            });
        }
        if self
            .inner
            .containers
            .iter()
            .any(|c| c.value().config().name == config.name)
        {
            return Err(CorralError::AlreadyExists {
                kind: "container name",
                id: config.name,
            });
        }

        self.join_pod(&mut config)?;

        for dependency in config.dependencies() {
            let found = self
                .container(&dependency)
                .map_err(|_| CorralError::DependencyNotFound {
                    container: config.id.to_string(),
                    dependency: dependency.to_string(),
                })?;
            if found.pod_id() != config.pod.as_ref() {
                return Err(CorralError::invalid_state(
                    &config.id,
                    "create container",
                    format!("dependency {dependency} is not in the same pod"),
                ));
            }
        }
        for mount in &config.volumes {
            self.volume(&mount.name)?;
        }

        let lock = self.locks().allocate()?;
        if let Err(e) = self.storage().create_container_storage(&config).await {
            self.locks().free(lock.index());
            return Err(e);
        }

        let record = ContainerRecord {
            config,
            state: ContainerState::default(),
            lock_index: lock.index(),
        };
        let id = record.config.id.clone();
        if let Err(e) = self.store().add_container(&record) {
            if let Err(cleanup) = self.storage().delete_container(&id).await {
                tracing::warn!(container_id = %id, error = %cleanup, "Failed to release storage of unsaved container");
            }
            self.locks().free(lock.index());
            return Err(e);
        }

        let container = Arc::new(Container::from_record(record, lock));
        self.inner.containers.insert(id.clone(), Arc::clone(&container));
        let container = ContainerRef::new(self.clone(), container);
        tracing::info!(container_id = %id, name = %container.name(), pod_id = ?container.pod_id(), "Created container");
        container.emit(EventKind::Create);
        Ok(container)
    }

    /// Look up a container by ID.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such container.
    pub fn container(&self, id: &ContainerId) -> CorralResult<ContainerRef> {
        self.inner
            .containers
            .get(id)
            .map(|c| ContainerRef::new(self.clone(), Arc::clone(c.value())))
            .ok_or_else(|| CorralError::not_found("container", id))
    }

    /// Look up a container by ID or name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if neither matches.
    pub fn lookup_container(&self, id_or_name: &str) -> CorralResult<ContainerRef> {
        if let Ok(id) = ContainerId::new(id_or_name) {
            if let Ok(container) = self.container(&id) {
                return Ok(container);
            }
        }
        self.inner
            .containers
            .iter()
            .find(|c| c.value().config().name == id_or_name)
            .map(|c| ContainerRef::new(self.clone(), Arc::clone(c.value())))
            .ok_or_else(|| CorralError::not_found("container", id_or_name))
    }

    /// All containers, sorted by ID.
    #[must_use]
    pub fn containers(&self) -> Vec<ContainerRef> {
        let mut containers: Vec<ContainerRef> = self
            .inner
            .containers
            .iter()
            .map(|c| ContainerRef::new(self.clone(), Arc::clone(c.value())))
            .collect();
        containers.sort_by(|a, b| a.id().cmp(b.id()));
        containers
    }

    /// Remove a container.
    ///
    /// With `force`, exec sessions are stopped and a running or paused
    /// container is stopped first.
    ///
    /// # Errors
    ///
    /// Returns `InUse` if other containers depend on it, `InvalidState` if
    /// it is running without `force` or is the infra container of an
    /// existing pod, and the first teardown error otherwise.
    pub async fn remove_container(&self, id: &ContainerId, force: bool) -> CorralResult<()> {
        let container = self.container(id)?;
        if container.config().is_infra {
            if let Some(pod) = container.pod_id().filter(|pod| self.inner.pods.contains_key(*pod)) {
                return Err(CorralError::invalid_state(
                    id,
                    "remove container",
                    format!("it is the infra container of pod {pod}; remove the pod instead"),
                ));
            }
        }

        let _guard = container.lock().await;
        container.sync_locked().await?;

        let dependents = self.store().container_in_use(id)?;
        if !dependents.is_empty() {
            return Err(CorralError::InUse {
                kind: "container",
                id: id.to_string(),
                dependents: dependents.iter().map(ToString::to_string).collect(),
            });
        }

        container.check_removable(force)?;
        if force {
            container.stop_for_removal_locked().await?;
        }
        container.remove_locked().await
    }

    /// Recover after a host reboot.
    ///
    /// Every volume mount count is reset, every container is reset to its
    /// configured state, and the containers that were created, running or
    /// paused are brought back in dependency order.
    ///
    /// # Errors
    ///
    /// Returns `NotStarted` if a reset failed and `Partial` with the
    /// containers that could not be restored.
    pub async fn refresh(&self) -> Result<(), WalkError> {
        tracing::info!("Refreshing runtime state");
        for volume in self.volumes() {
            volume.reset().await?;
        }

        let containers = self.containers();
        for container in &containers {
            let _guard = container.lock().await;
            container.reset_locked().await?;
        }
        if containers.is_empty() {
            return Ok(());
        }

        let graph = DependencyGraph::build(&containers)?;
        walk(&graph, WalkOperation::Restore).await
    }
}
