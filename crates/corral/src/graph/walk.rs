//! Concurrent traversal of a dependency graph.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use corral_common::{ContainerId, CorralError, CorralResult};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use miette::Diagnostic;
use thiserror::Error;

use super::DependencyGraph;
use crate::container::{ContainerRef, ContainerStatus};

/// Operation applied to every container of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOperation {
    /// Start containers that are not running.
    Start,
    /// Stop running containers.
    Stop {
        /// Stop timeout in seconds, overriding each container's own.
        timeout: Option<u64>,
    },
    /// Signal running containers.
    Kill {
        /// Signal number.
        signal: i32,
    },
    /// Pause running containers.
    Pause,
    /// Unpause paused containers.
    Unpause,
    /// Restart containers.
    Restart {
        /// Stop timeout in seconds.
        timeout: Option<u64>,
    },
    /// Restore the status recorded before a refresh.
    Restore,
}

impl WalkOperation {
    /// Whether the operation should run for a container in `status`.
    /// Containers it does not apply to are skipped without error.
    #[must_use]
    pub const fn applies_to(&self, status: ContainerStatus) -> bool {
        match self {
            Self::Start => !matches!(status, ContainerStatus::Running),
            Self::Stop { .. } | Self::Kill { .. } | Self::Pause => {
                matches!(status, ContainerStatus::Running)
            }
            Self::Unpause => matches!(status, ContainerStatus::Paused),
            Self::Restart { .. } | Self::Restore => true,
        }
    }

    async fn apply(self, container: &ContainerRef) -> CorralResult<()> {
        match self {
            Self::Start => container.start_locked(false).await,
            Self::Stop { timeout } => container.stop_locked(timeout).await,
            Self::Kill { signal } => container.kill_locked(signal).await,
            Self::Pause => container.pause_locked().await,
            Self::Unpause => container.unpause_locked().await,
            Self::Restart { timeout } => container.restart_locked(timeout).await,
            Self::Restore => container.restore_locked(false).await,
        }
    }
}

impl fmt::Display for WalkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Stop { .. } => "stop",
            Self::Kill { .. } => "kill",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::Restart { .. } => "restart",
            Self::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Failure of a graph walk.
#[derive(Error, Diagnostic, Debug)]
pub enum WalkError {
    /// Nothing was attempted.
    #[error("Operation did not start: {0}")]
    #[diagnostic(code(corral::graph::not_started))]
    NotStarted(#[source] CorralError),

    /// Some containers failed; the others completed.
    #[error("{} of {total} containers failed", failures.len())]
    #[diagnostic(code(corral::graph::partial_failure))]
    Partial {
        /// Error per failed container, including dependents that were never
        /// attempted because a dependency failed.
        failures: BTreeMap<ContainerId, CorralError>,
        /// Containers in the walk.
        total: usize,
    },
}

impl WalkError {
    /// Per-container errors; empty when nothing was attempted.
    #[must_use]
    pub fn failures(&self) -> Option<&BTreeMap<ContainerId, CorralError>> {
        match self {
            Self::NotStarted(_) => None,
            Self::Partial { failures, .. } => Some(failures),
        }
    }
}

impl From<CorralError> for WalkError {
    fn from(err: CorralError) -> Self {
        Self::NotStarted(err)
    }
}

type NodeResult = (ContainerId, CorralResult<()>);

fn run_node(container: ContainerRef, op: WalkOperation) -> BoxFuture<'static, CorralResult<()>> {
    async move {
        let _guard = container.lock().await;
        container.sync_locked().await?;
        let status = container.status();
        if !op.applies_to(status) {
            tracing::debug!(container_id = %container.id(), %status, operation = %op, "Skipping container");
            return Ok(());
        }
        op.apply(&container).await
    }
    .boxed()
}

fn spawn_node(container: ContainerRef, op: WalkOperation) -> BoxFuture<'static, NodeResult> {
    let id = container.id().clone();
    let task = tokio::spawn(run_node(container, op));
    async move {
        let result = task.await.unwrap_or_else(|e| {
            Err(CorralError::Internal {
                message: format!("{op} task for container {id} failed: {e}"),
            })
        });
        (id, result)
    }
    .boxed()
}

/// Apply `op` to every container of the graph, in dependency order.
///
/// Every root starts at once; a container runs once all of its dependencies
/// succeeded, each in its own task holding only its own lock. A failed
/// container fails its dependents, transitively, without attempting them.
/// Independent subtrees always run to completion.
///
/// # Errors
///
/// Returns `NotStarted` for an empty graph and `Partial` with an error for
/// every failed container otherwise.
pub async fn walk(graph: &DependencyGraph, op: WalkOperation) -> Result<(), WalkError> {
    if graph.is_empty() {
        return Err(WalkError::NotStarted(CorralError::invalid_state(
            "dependency graph",
            op.to_string(),
            "no containers to operate on",
        )));
    }
    if graph.roots().is_empty() {
        return Err(WalkError::NotStarted(CorralError::invalid_state(
            "dependency graph",
            op.to_string(),
            "no container is free of dependencies",
        )));
    }

    tracing::debug!(operation = %op, containers = graph.len(), "Walking dependency graph");

    let mut remaining: HashMap<&ContainerId, usize> = graph
        .nodes()
        .map(|node| (node.container().id(), node.depends_on().len()))
        .collect();
    let mut failures: BTreeMap<ContainerId, CorralError> = BTreeMap::new();
    let mut pending = FuturesUnordered::new();

    for id in graph.roots() {
        if let Some(node) = graph.node(id) {
            pending.push(spawn_node(node.container().clone(), op));
        }
    }

    while let Some((id, result)) = pending.next().await {
        let Some(node) = graph.node(&id) else {
            continue;
        };
        match result {
            Ok(()) => {
                for dependent in node.depended_on_by() {
                    if failures.contains_key(dependent) {
                        continue;
                    }
                    let Some(count) = remaining.get_mut(dependent) else {
                        continue;
                    };
                    *count -= 1;
                    if *count == 0 {
                        if let Some(next) = graph.node(dependent) {
                            pending.push(spawn_node(next.container().clone(), op));
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(container_id = %id, operation = %op, error = %err, "Container operation failed");
                failures.insert(id.clone(), err);
                fail_dependents(graph, &id, &mut failures);
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(WalkError::Partial {
            failures,
            total: graph.len(),
        })
    }
}

/// Mark every transitive dependent of `failed` as failed.
fn fail_dependents(
    graph: &DependencyGraph,
    failed: &ContainerId,
    failures: &mut BTreeMap<ContainerId, CorralError>,
) {
    let mut stack = vec![failed.clone()];
    while let Some(current) = stack.pop() {
        let Some(node) = graph.node(&current) else {
            continue;
        };
        for dependent in node.depended_on_by() {
            if failures.contains_key(dependent) {
                continue;
            }
            failures.insert(
                dependent.clone(),
                CorralError::DependencyFailed {
                    container: dependent.to_string(),
                    dependency: current.to_string(),
                },
            );
            stack.push(dependent.clone());
        }
    }
}
