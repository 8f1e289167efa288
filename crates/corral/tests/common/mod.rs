//! Fake collaborators shared by the integration tests.
//!
//! The fakes keep just enough state to behave like a real supervisor, storage
//! layer and network plugin: exit markers are written when a container is
//! stopped or killed, and every call is recorded in order.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use corral::collaborators::{
    ContainerStats, CreateRequest, CreatedProcess, ExecProcess, ExecRequest, ExecSyncOutput,
    NetworkManager, NetworkStatus, RuntimeSupervisor, StorageService, SupervisorStatus,
};
use corral::{
    ContainerConfig, ContainerRef, Event, MemoryStore, Runtime, RuntimeBuilder, RuntimeConfig,
};
use corral_common::{ContainerId, CorralError, CorralResult, ExecSessionId};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{broadcast, oneshot};

/// Shared, ordered log of collaborator calls such as `start:web`.
#[derive(Debug, Default, Clone)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, op: &str, subject: impl std::fmt::Display) {
        self.0.lock().push(format!("{op}:{subject}"));
    }

    /// Every recorded call.
    pub fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Subjects of the calls to `op`, in order.
    pub fn of(&self, op: &str) -> Vec<String> {
        let prefix = format!("{op}:");
        self.0
            .lock()
            .iter()
            .filter_map(|call| call.strip_prefix(&prefix).map(str::to_owned))
            .collect()
    }

    /// Position of a call in the log.
    pub fn position(&self, call: &str) -> Option<usize> {
        self.0.lock().iter().position(|c| c == call)
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

#[derive(Debug)]
struct Process {
    status: SupervisorStatus,
    marker: PathBuf,
}

/// Supervisor that tracks container processes in memory.
#[derive(Debug, Default)]
pub struct FakeSupervisor {
    pub calls: CallLog,
    processes: Mutex<HashMap<ContainerId, Process>>,
    failures: Mutex<HashSet<String>>,
    start_delays: Mutex<HashMap<ContainerId, Duration>>,
    /// Containers whose stop leaves no exit marker behind.
    silent_stop: Mutex<HashSet<ContainerId>>,
    exec_sessions: Mutex<HashMap<ExecSessionId, oneshot::Sender<i32>>>,
    /// Exit code of exec sessions that exit before reporting a pid.
    exec_exits_early: Mutex<Option<i32>>,
    /// Exec sessions never report a pid.
    exec_hangs: AtomicBool,
    health_exit_code: Mutex<i32>,
    no_cgroups: AtomicBool,
    next_pid: AtomicUsize,
    starting: AtomicUsize,
    pub max_concurrent_starts: AtomicUsize,
}

impl FakeSupervisor {
    /// Make `op` fail for container `id`.
    pub fn fail(&self, op: &str, id: &str) {
        self.failures.lock().insert(format!("{op}:{id}"));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    fn check(&self, op: &str, id: &ContainerId) -> CorralResult<()> {
        if self.failures.lock().contains(&format!("{op}:{id}")) {
            return Err(CorralError::external("supervisor", format!("injected {op} failure")));
        }
        Ok(())
    }

    pub fn delay_start(&self, id: &str, delay: Duration) {
        self.start_delays
            .lock()
            .insert(ContainerId::new(id).unwrap(), delay);
    }

    pub fn stop_without_marker(&self, id: &str) {
        self.silent_stop.lock().insert(ContainerId::new(id).unwrap());
    }

    pub fn exec_exits_early(&self, code: i32) {
        *self.exec_exits_early.lock() = Some(code);
    }

    pub fn exec_hangs(&self) {
        self.exec_hangs.store(true, Ordering::SeqCst);
    }

    pub fn set_health_exit_code(&self, code: i32) {
        *self.health_exit_code.lock() = code;
    }

    pub fn without_cgroups(&self) {
        self.no_cgroups.store(true, Ordering::SeqCst);
    }

    /// Finish every running exec session with `code`.
    pub fn finish_exec_sessions(&self, code: i32) {
        for (_, sender) in self.exec_sessions.lock().drain() {
            let _ = sender.send(code);
        }
    }

    pub fn exec_session_count(&self) -> usize {
        self.exec_sessions.lock().len()
    }

    /// The main process exits on its own with `code`.
    pub fn exit(&self, id: &ContainerId, code: i32) {
        let mut processes = self.processes.lock();
        if let Some(process) = processes.get_mut(id) {
            process.status = SupervisorStatus::Stopped;
            std::fs::write(&process.marker, code.to_string()).unwrap();
        }
    }

    /// The main process is gone but nothing wrote an exit marker.
    pub fn vanish(&self, id: &ContainerId) {
        if let Some(process) = self.processes.lock().get_mut(id) {
            process.status = SupervisorStatus::Stopped;
        }
    }

    pub fn is_registered(&self, id: &ContainerId) -> bool {
        self.processes.lock().contains_key(id)
    }

    fn terminate(&self, id: &ContainerId, code: i32) -> CorralResult<()> {
        let silent = self.silent_stop.lock().contains(id);
        let mut processes = self.processes.lock();
        let process = processes
            .get_mut(id)
            .ok_or_else(|| CorralError::not_found("container", id))?;
        process.status = SupervisorStatus::Stopped;
        if !silent {
            std::fs::write(&process.marker, code.to_string())?;
        }
        Ok(())
    }

    fn set_status(&self, id: &ContainerId, status: SupervisorStatus) -> CorralResult<()> {
        let mut processes = self.processes.lock();
        let process = processes
            .get_mut(id)
            .ok_or_else(|| CorralError::not_found("container", id))?;
        process.status = status;
        Ok(())
    }
}

#[async_trait]
impl RuntimeSupervisor for FakeSupervisor {
    async fn create(&self, request: &CreateRequest) -> CorralResult<CreatedProcess> {
        let id = &request.config.id;
        self.calls.push("create", id);
        self.check("create", id)?;
        self.processes.lock().insert(
            id.clone(),
            Process {
                status: SupervisorStatus::Created,
                marker: request.exit_marker.clone(),
            },
        );
        let pid = 1000 + u32::try_from(self.next_pid.fetch_add(2, Ordering::SeqCst)).unwrap();
        Ok(CreatedProcess {
            pid,
            supervisor_pid: Some(pid + 1),
        })
    }

    async fn start(&self, id: &ContainerId) -> CorralResult<()> {
        let delay = self.start_delays.lock().get(id).copied();
        let in_flight = self.starting.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_starts
            .fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.starting.fetch_sub(1, Ordering::SeqCst);

        self.calls.push("start", id);
        self.check("start", id)?;
        self.set_status(id, SupervisorStatus::Running)
    }

    async fn stop(
        &self,
        id: &ContainerId,
        signal: i32,
        _timeout: Duration,
        kill_all: bool,
    ) -> CorralResult<()> {
        self.calls.push("stop", id);
        if kill_all {
            self.calls.push("kill_all", id);
        }
        self.check("stop", id)?;
        self.terminate(id, 128 + signal)
    }

    async fn kill(&self, id: &ContainerId, signal: i32, _kill_all: bool) -> CorralResult<()> {
        self.calls.push("kill", id);
        self.check("kill", id)?;
        if signal == corral::container::SIGKILL || signal == corral::container::SIGTERM {
            self.terminate(id, 128 + signal)?;
        }
        Ok(())
    }

    async fn pause(&self, id: &ContainerId) -> CorralResult<()> {
        self.calls.push("pause", id);
        self.check("pause", id)?;
        self.set_status(id, SupervisorStatus::Paused)
    }

    async fn unpause(&self, id: &ContainerId) -> CorralResult<()> {
        self.calls.push("unpause", id);
        self.check("unpause", id)?;
        self.set_status(id, SupervisorStatus::Running)
    }

    async fn delete(&self, id: &ContainerId) -> CorralResult<()> {
        self.calls.push("delete", id);
        self.processes
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CorralError::not_found("container", id))
    }

    async fn status(&self, id: &ContainerId) -> CorralResult<SupervisorStatus> {
        self.processes
            .lock()
            .get(id)
            .map(|p| p.status)
            .ok_or_else(|| CorralError::not_found("container", id))
    }

    async fn exec(&self, id: &ContainerId, request: &ExecRequest) -> CorralResult<ExecProcess> {
        self.calls.push("exec", id);
        self.check("exec", id)?;
        let (sender, exited) = oneshot::channel();
        if let Some(code) = *self.exec_exits_early.lock() {
            let _ = sender.send(code);
            return Ok(ExecProcess { exited });
        }
        if !self.exec_hangs.load(Ordering::SeqCst) {
            std::fs::write(&request.pid_file, "4242")?;
        }
        self.exec_sessions
            .lock()
            .insert(request.session.clone(), sender);
        Ok(ExecProcess { exited })
    }

    async fn exec_sync(
        &self,
        id: &ContainerId,
        _command: &[String],
        _timeout: Duration,
    ) -> CorralResult<ExecSyncOutput> {
        self.calls.push("exec_sync", id);
        Ok(ExecSyncOutput {
            exit_code: *self.health_exit_code.lock(),
            ..ExecSyncOutput::default()
        })
    }

    async fn stop_exec(
        &self,
        id: &ContainerId,
        session: &ExecSessionId,
        _timeout: Duration,
    ) -> CorralResult<()> {
        self.calls.push("stop_exec", id);
        if let Some(sender) = self.exec_sessions.lock().remove(session) {
            let _ = sender.send(137);
        }
        Ok(())
    }

    async fn stats(&self, id: &ContainerId) -> CorralResult<ContainerStats> {
        self.check("stats", id)?;
        Ok(ContainerStats {
            cpu_usage_usec: 10,
            memory_usage_bytes: 4096,
            pids: 1,
        })
    }

    fn supports_cgroups(&self) -> bool {
        !self.no_cgroups.load(Ordering::SeqCst)
    }

    async fn kill_stale_supervisor(&self, supervisor_pid: u32) -> CorralResult<()> {
        self.calls.push("kill_stale_supervisor", supervisor_pid);
        Ok(())
    }
}

/// Storage that hands out directories under a temporary root.
#[derive(Debug)]
pub struct FakeStorage {
    pub calls: CallLog,
    root: PathBuf,
    failures: Mutex<HashSet<String>>,
}

impl FakeStorage {
    pub fn new(root: &Path, calls: CallLog) -> Self {
        Self {
            calls,
            root: root.join("storage"),
            failures: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail(&self, op: &str, subject: &str) {
        self.failures.lock().insert(format!("{op}:{subject}"));
    }

    fn check(&self, op: &str, subject: &str) -> CorralResult<()> {
        if self.failures.lock().contains(&format!("{op}:{subject}")) {
            return Err(CorralError::external("storage", format!("injected {op} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageService for FakeStorage {
    async fn create_container_storage(&self, config: &ContainerConfig) -> CorralResult<()> {
        self.calls.push("create_storage", &config.id);
        self.check("create_storage", config.id.as_str())
    }

    async fn mount(&self, id: &ContainerId) -> CorralResult<PathBuf> {
        self.calls.push("mount", id);
        self.check("mount", id.as_str())?;
        Ok(self.root.join(id.as_str()).join("merged"))
    }

    async fn unmount(&self, id: &ContainerId, _force: bool) -> CorralResult<()> {
        self.calls.push("unmount", id);
        self.check("unmount", id.as_str())
    }

    async fn delete_container(&self, id: &ContainerId) -> CorralResult<()> {
        self.calls.push("delete_storage", id);
        self.check("delete_storage", id.as_str())
    }

    async fn run_dir(&self, id: &ContainerId) -> CorralResult<PathBuf> {
        Ok(self.root.join(id.as_str()).join("userdata"))
    }

    async fn mount_volume(&self, name: &str, path: &Path) -> CorralResult<PathBuf> {
        self.calls.push("mount_volume", name);
        self.check("mount_volume", name)?;
        Ok(path.to_path_buf())
    }

    async fn unmount_volume(&self, name: &str) -> CorralResult<()> {
        self.calls.push("unmount_volume", name);
        self.check("unmount_volume", name)
    }
}

/// Network plugin that hands out namespace paths without touching the host.
#[derive(Debug)]
pub struct FakeNetwork {
    pub calls: CallLog,
    not_ready: AtomicBool,
}

impl FakeNetwork {
    pub fn new(calls: CallLog) -> Self {
        Self {
            calls,
            not_ready: AtomicBool::new(false),
        }
    }

    pub fn not_ready(&self) {
        self.not_ready.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkManager for FakeNetwork {
    async fn create_namespace(&self, id: &ContainerId) -> CorralResult<PathBuf> {
        self.calls.push("create_netns", id);
        Ok(PathBuf::from("/run/netns").join(id.as_str()))
    }

    async fn setup(&self, _netns: &Path, pod_name: &str, id: &ContainerId) -> CorralResult<NetworkStatus> {
        self.calls.push("setup_network", id);
        if self.not_ready.load(Ordering::SeqCst) {
            return Err(CorralError::NetworkNotReady {
                message: format!("no default network for {pod_name}"),
            });
        }
        Ok(NetworkStatus {
            addresses: vec!["10.88.0.2/16".to_string()],
            dns: Vec::new(),
        })
    }

    async fn teardown(&self, _netns: &Path, _pod_name: &str, id: &ContainerId) -> CorralResult<()> {
        self.calls.push("teardown_network", id);
        Ok(())
    }

    async fn destroy_namespace(&self, netns: &Path) -> CorralResult<()> {
        self.calls.push("destroy_netns", netns.display());
        Ok(())
    }
}

/// A runtime wired to fakes, rooted in a temporary directory.
pub struct Harness {
    pub runtime: Runtime,
    pub supervisor: Arc<FakeSupervisor>,
    pub storage: Arc<FakeStorage>,
    pub network: Arc<FakeNetwork>,
    pub store: Arc<MemoryStore>,
    /// Every collaborator call, in order.
    pub calls: CallLog,
    pub dir: TempDir,
}

/// Configuration with short waits, rooted at `root`.
pub fn test_config(root: &Path) -> RuntimeConfig {
    RuntimeConfig::default()
        .with_root(root)
        .with_stop_timeout(1)
        .with_exit_marker_timeout(Duration::from_millis(200))
        .with_exec_pid_timeout(Duration::from_millis(300))
        .with_num_locks(64)
}

impl Harness {
    pub fn new() -> Self {
        Self::build(|config| config, Arc::new(MemoryStore::new()))
    }

    pub fn with_config(customize: impl FnOnce(RuntimeConfig) -> RuntimeConfig) -> Self {
        Self::build(customize, Arc::new(MemoryStore::new()))
    }

    /// Runtime over a store that already holds records.
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self::build(|config| config, store)
    }

    fn build(
        customize: impl FnOnce(RuntimeConfig) -> RuntimeConfig,
        store: Arc<MemoryStore>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let calls = CallLog::default();
        let supervisor = Arc::new(FakeSupervisor {
            calls: calls.clone(),
            ..FakeSupervisor::default()
        });
        let storage = Arc::new(FakeStorage::new(dir.path(), calls.clone()));
        let network = Arc::new(FakeNetwork::new(calls.clone()));

        let runtime = Runtime::builder(customize(test_config(dir.path())))
            .supervisor(supervisor.clone())
            .storage(storage.clone())
            .network(network.clone())
            .store(store.clone())
            .build()
            .unwrap();

        Self {
            runtime,
            supervisor,
            storage,
            network,
            store,
            calls,
            dir,
        }
    }

    /// Create a container with the given dependencies.
    pub async fn container(&self, name: &str, deps: &[&str]) -> ContainerRef {
        let mut config = config(name);
        for dep in deps {
            config = config.with_dependency(id(dep));
        }
        self.runtime.new_container(config).await.unwrap()
    }
}

/// Builder wired to fresh fakes, using the default file store under `root`.
pub fn fake_builder(root: &Path) -> RuntimeBuilder {
    let calls = CallLog::default();
    Runtime::builder(test_config(root))
        .supervisor(Arc::new(FakeSupervisor {
            calls: calls.clone(),
            ..FakeSupervisor::default()
        }))
        .storage(Arc::new(FakeStorage::new(root, calls.clone())))
        .network(Arc::new(FakeNetwork::new(calls)))
}

/// Every event received so far.
pub fn drain(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    received
}

pub fn id(name: &str) -> ContainerId {
    ContainerId::new(name).unwrap()
}

pub fn config(name: &str) -> ContainerConfig {
    ContainerConfig::new(id(name), name).with_command(["/bin/app"])
}
