//! Content dependency graph.
//!
//! Nodes are units of cacheable content; edges declare "depends on"
//! relationships in both directions. The graph is acyclic by construction:
//! edge insertions that would create a cycle are rejected, so hybrid
//! invalidation can traverse dependents without a depth bound.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use time::OffsetDateTime;

use crate::invalidation::InvalidationError;
use crate::key::ResourceKind;
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "invalidation::graph";

/// One unit of cacheable content with declared relationships.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub id: String,
    pub kind: ResourceKind,
    /// Upstream ids this node is derived from.
    pub dependencies: HashSet<String>,
    /// Downstream ids derived from this node.
    pub dependents: HashSet<String>,
    pub version: String,
    pub last_modified: OffsetDateTime,
    /// Relative recomputation cost, used by warming to order predictions.
    pub complexity: u32,
}

pub struct DependencyGraph {
    nodes: RwLock<HashMap<String, DependencyNode>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a node if absent. Returns whether it was newly created.
    pub fn register(&self, id: &str, kind: ResourceKind, complexity: u32) -> bool {
        let mut nodes = rw_write(&self.nodes, SOURCE, "register");
        if nodes.contains_key(id) {
            return false;
        }
        nodes.insert(
            id.to_string(),
            DependencyNode {
                id: id.to_string(),
                kind,
                dependencies: HashSet::new(),
                dependents: HashSet::new(),
                version: "0".to_string(),
                last_modified: OffsetDateTime::now_utc(),
                complexity,
            },
        );
        true
    }

    /// Declare that `dependent` is derived from `dependency`.
    ///
    /// Rejects unknown ids, self-edges, and edges that would close a cycle.
    pub fn add_dependency(&self, dependent: &str, dependency: &str) -> Result<(), InvalidationError> {
        if dependent == dependency {
            return Err(InvalidationError::SelfDependency {
                id: dependent.to_string(),
            });
        }

        let mut nodes = rw_write(&self.nodes, SOURCE, "add_dependency");
        if !nodes.contains_key(dependent) {
            return Err(InvalidationError::UnknownNode {
                id: dependent.to_string(),
            });
        }
        if !nodes.contains_key(dependency) {
            return Err(InvalidationError::UnknownNode {
                id: dependency.to_string(),
            });
        }

        // The edge closes a cycle iff `dependent` is already upstream of
        // `dependency`.
        if reachable_upstream(&nodes, dependency, dependent) {
            return Err(InvalidationError::CycleDetected {
                dependent: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }

        if let Some(node) = nodes.get_mut(dependent) {
            node.dependencies.insert(dependency.to_string());
        }
        if let Some(node) = nodes.get_mut(dependency) {
            node.dependents.insert(dependent.to_string());
        }
        Ok(())
    }

    /// Bump a node's version, stamping `last_modified`.
    pub fn bump_version(&self, id: &str, version: &str) -> Result<(), InvalidationError> {
        let mut nodes = rw_write(&self.nodes, SOURCE, "bump_version");
        let node = nodes.get_mut(id).ok_or_else(|| InvalidationError::UnknownNode {
            id: id.to_string(),
        })?;
        node.version = version.to_string();
        node.last_modified = OffsetDateTime::now_utc();
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<DependencyNode> {
        rw_read(&self.nodes, SOURCE, "node").get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        rw_read(&self.nodes, SOURCE, "contains").contains_key(id)
    }

    /// All transitive dependents of `id`, excluding `id` itself.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let nodes = rw_read(&self.nodes, SOURCE, "dependents_of");
        let mut visited = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);

        let mut collected = Vec::new();
        while let Some(current) = queue.pop_front() {
            let Some(node) = nodes.get(current) else {
                continue;
            };
            for dependent in &node.dependents {
                if visited.insert(dependent.clone()) {
                    collected.push(dependent.clone());
                    queue.push_back(dependent);
                }
            }
        }
        collected
    }

    /// Detach and remove a node.
    pub fn remove(&self, id: &str) -> bool {
        let mut nodes = rw_write(&self.nodes, SOURCE, "remove");
        let Some(node) = nodes.remove(id) else {
            return false;
        };
        for dependency in &node.dependencies {
            if let Some(upstream) = nodes.get_mut(dependency) {
                upstream.dependents.remove(id);
            }
        }
        for dependent in &node.dependents {
            if let Some(downstream) = nodes.get_mut(dependent) {
                downstream.dependencies.remove(id);
            }
        }
        true
    }

    /// Explicit maintenance pass: drop leaf nodes (no dependents) untouched
    /// for longer than `max_age`. Returns the prune count.
    pub fn prune_stale(&self, max_age: Duration) -> usize {
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let stale: Vec<String> = {
            let nodes = rw_read(&self.nodes, SOURCE, "prune_stale");
            nodes
                .values()
                .filter(|node| node.dependents.is_empty() && node.last_modified < cutoff)
                .map(|node| node.id.clone())
                .collect()
        };
        for id in &stale {
            self.remove(id);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.nodes, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `target` is reachable from `from` by walking dependency edges.
fn reachable_upstream(
    nodes: &HashMap<String, DependencyNode>,
    from: &str,
    target: &str,
) -> bool {
    let mut visited = HashSet::new();
    let mut stack = vec![from];
    while let Some(current) = stack.pop() {
        if current == target {
            return true;
        }
        let Some(node) = nodes.get(current) else {
            continue;
        };
        for dependency in &node.dependencies {
            if visited.insert(dependency.as_str()) {
                stack.push(dependency.as_str());
            }
        }
    }
    false
}
