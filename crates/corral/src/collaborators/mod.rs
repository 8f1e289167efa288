//! Interfaces to the processes and services the engine drives.
//!
//! The engine never spawns container processes, mounts layers or configures
//! network interfaces itself. It asks these collaborators to, and records the
//! outcome as container state.

pub mod network;
pub mod storage;
pub mod supervisor;

pub use crate::events::EventSink;
pub use network::{NetworkManager, NetworkStatus};
pub use storage::StorageService;
pub use supervisor::{
    ContainerStats, CreateRequest, CreatedProcess, ExecProcess, ExecRequest, ExecSyncOutput,
    RuntimeSupervisor, SupervisorStatus,
};
