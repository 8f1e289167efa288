//! Dependency graphs over a set of containers.
//!
//! Graphs are built for one operation and thrown away afterwards. Edges are
//! container IDs resolved inside the set; nothing outside the set is ever
//! looked up.

mod walk;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use corral_common::{ContainerId, CorralError, CorralResult};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use crate::container::ContainerRef;
use crate::runtime::Runtime;

pub use walk::{WalkError, WalkOperation, walk};

/// A container in a dependency graph.
#[derive(Debug, Clone)]
pub struct Node {
    container: ContainerRef,
    depends_on: Vec<ContainerId>,
    depended_on_by: Vec<ContainerId>,
}

impl Node {
    /// The container.
    #[must_use]
    pub const fn container(&self) -> &ContainerRef {
        &self.container
    }

    /// Containers this one depends on.
    #[must_use]
    pub fn depends_on(&self) -> &[ContainerId] {
        &self.depends_on
    }

    /// Containers that depend on this one.
    #[must_use]
    pub fn depended_on_by(&self) -> &[ContainerId] {
        &self.depended_on_by
    }
}

/// Acyclic dependency graph over a set of containers.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<ContainerId, Node>,
    roots: Vec<ContainerId>,
}

impl DependencyGraph {
    /// Build the graph for exactly `containers`.
    ///
    /// # Errors
    ///
    /// Returns `DependencyNotFound` if a dependency is not in the set and
    /// `CycleDetected` if the dependencies form a cycle.
    pub fn build(containers: &[ContainerRef]) -> CorralResult<Self> {
        let mut nodes: BTreeMap<ContainerId, Node> = containers
            .iter()
            .map(|container| {
                let node = Node {
                    container: container.clone(),
                    depends_on: container.config().dependencies(),
                    depended_on_by: Vec::new(),
                };
                (container.id().clone(), node)
            })
            .collect();

        let mut edges = Vec::new();
        for (id, node) in &nodes {
            for dependency in &node.depends_on {
                if dependency == id {
                    return Err(CorralError::CycleDetected {
                        containers: vec![id.to_string()],
                    });
                }
                if !nodes.contains_key(dependency) {
                    return Err(CorralError::DependencyNotFound {
                        container: id.to_string(),
                        dependency: dependency.to_string(),
                    });
                }
                edges.push((id.clone(), dependency.clone()));
            }
        }

        check_acyclic(nodes.keys(), &edges)?;

        for (dependent, dependency) in edges {
            if let Some(node) = nodes.get_mut(&dependency) {
                node.depended_on_by.push(dependent);
            }
        }

        let roots = nodes
            .iter()
            .filter(|(_, node)| node.depends_on.is_empty())
            .map(|(id, _)| id.clone())
            .collect();

        Ok(Self { nodes, roots })
    }

    /// Containers with no dependencies, sorted.
    #[must_use]
    pub fn roots(&self) -> &[ContainerId] {
        &self.roots
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, id: &ContainerId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All nodes, sorted by ID.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Number of containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no containers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Fail with every container that is part of a strongly connected component
/// larger than one.
fn check_acyclic<'a>(
    ids: impl Iterator<Item = &'a ContainerId>,
    edges: &[(ContainerId, ContainerId)],
) -> CorralResult<()> {
    let mut graph = DiGraph::<&ContainerId, ()>::new();
    let index: HashMap<&ContainerId, _> = ids.map(|id| (id, graph.add_node(id))).collect();
    for (from, to) in edges {
        if let (Some(&a), Some(&b)) = (index.get(from), index.get(to)) {
            graph.add_edge(a, b, ());
        }
    }

    let mut cyclic: Vec<String> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .flatten()
        .map(|ix| graph[ix].to_string())
        .collect();

    if cyclic.is_empty() {
        return Ok(());
    }
    cyclic.sort();
    Err(CorralError::CycleDetected { containers: cyclic })
}

/// Transitive dependencies of a container, not including itself.
///
/// # Errors
///
/// Returns `DependencyNotFound` if a dependency does not exist and
/// `CycleDetected` if the container depends on itself.
pub fn dependency_closure(runtime: &Runtime, id: &ContainerId) -> CorralResult<Vec<ContainerRef>> {
    let origin = runtime.container(id)?;
    let mut seen = BTreeSet::new();
    let mut closure = Vec::new();
    let mut queue: VecDeque<ContainerRef> = VecDeque::from([origin]);

    while let Some(container) = queue.pop_front() {
        for dependency in container.config().dependencies() {
            if &dependency == id {
                let mut containers = vec![id.to_string(), container.id().to_string()];
                containers.sort();
                containers.dedup();
                return Err(CorralError::CycleDetected { containers });
            }
            if !seen.insert(dependency.clone()) {
                continue;
            }
            let found = runtime
                .container(&dependency)
                .map_err(|_| CorralError::DependencyNotFound {
                    container: container.id().to_string(),
                    dependency: dependency.to_string(),
                })?;
            closure.push(found.clone());
            queue.push_back(found);
        }
    }
    Ok(closure)
}
