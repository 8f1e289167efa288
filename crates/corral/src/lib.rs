//! # Corral
//!
//! Corral drives the lifecycle of OCI containers grouped into pods.
//!
//! ## Features
//!
//! - **State machine**: every container operation is gated on the current
//!   status and persisted before it returns
//! - **Exit detection**: state is synchronized with the runtime supervisor
//!   and exit markers, with a bounded fail-safe wait
//! - **Dependencies**: acyclic dependency graphs walked concurrently, with
//!   per-container error reporting
//! - **Pods**: group operations, shared namespaces through an infra
//!   container, and all-or-nothing removal
//! - **Restart policies**, **named volumes** and **health checks**
//!
//! The engine never runs processes itself. It drives a
//! [`RuntimeSupervisor`](collaborators::RuntimeSupervisor), a
//! [`StorageService`](collaborators::StorageService) and a
//! [`NetworkManager`](collaborators::NetworkManager) supplied by the embedder.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use corral::collaborators::{NetworkManager, RuntimeSupervisor, StorageService};
//! use corral::{ContainerConfig, Runtime, RuntimeConfig};
//! use corral_common::ContainerId;
//!
//! # async fn example(
//! #     supervisor: Arc<dyn RuntimeSupervisor>,
//! #     storage: Arc<dyn StorageService>,
//! #     network: Arc<dyn NetworkManager>,
//! # ) -> corral_common::CorralResult<()> {
//! let runtime = Runtime::builder(RuntimeConfig::default())
//!     .supervisor(supervisor)
//!     .storage(storage)
//!     .network(network)
//!     .build()?;
//!
//! let config = ContainerConfig::new(ContainerId::new("web")?, "web").with_command(["nginx"]);
//! let container = runtime.new_container(config).await?;
//! container.start(true).await?;
//!
//! let exit_code = container.wait().await?;
//! # let _ = exit_code;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod collaborators;
pub mod config;
pub mod container;
pub mod events;
pub mod graph;
pub mod health;
pub mod lock;
pub mod pod;
pub mod runtime;
pub mod store;
pub mod volume;

mod teardown;

pub use config::RuntimeConfig;
pub use container::{
    Batch, ContainerConfig, ContainerRef, ContainerState, ContainerStatus, ExecConfig,
    NamespaceMode, Namespaces, RestartPolicy, RestartPolicyKind,
};
pub use events::{Event, EventBus, EventKind};
pub use graph::{DependencyGraph, WalkError, WalkOperation};
pub use health::{HealthCheck, HealthStatus};
pub use pod::{PodConfig, PodNamespaces, PodRef, PodState};
pub use runtime::{Runtime, RuntimeBuilder, WeakRuntime};
pub use store::{FileStore, MemoryStore, StateStore};
pub use volume::{VolumeConfig, VolumeRef};
