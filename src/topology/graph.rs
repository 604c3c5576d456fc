//! Directed dependency graph with eager cycle detection.
//!
//! Nodes live in an arena and edges reference them by index; slots vacated
//! by removed nodes are reused. An edge
//! `dependant -> dependency` that would close a cycle is rejected when it is
//! added, so [`DependencyGraph::topological_order`] always succeeds.

use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

#[derive(Debug)]
struct Node<T> {
    value: T,
    /// Nodes this node depends on.
    dependencies: BTreeSet<usize>,
    /// Nodes depending on this node.
    dependants: BTreeSet<usize>,
}

/// Arena-backed graph of "must start after" relations.
#[derive(Debug)]
pub struct DependencyGraph<T> {
    nodes: Vec<Option<Node<T>>>,
    /// Vacated slots, reused before the arena grows.
    free: Vec<usize>,
    index: HashMap<T, usize>,
}

impl<T> Default for DependencyGraph<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> DependencyGraph<T>
where
    T: Clone + Eq + Hash + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.index.contains_key(value)
    }

    /// Add a node without edges. No-op if present.
    pub fn add(&mut self, value: T) {
        self.slot(value);
    }

    /// Record that `dependant` depends on `dependency`.
    ///
    /// Fails with [`Error::CyclicDependency`] if `dependency` already
    /// (transitively) depends on `dependant`. The graph is left unchanged in
    /// that case.
    pub fn add_dependency(&mut self, dependant: T, dependency: T) -> Result<()> {
        if dependant == dependency {
            return Err(Error::CyclicDependency {
                from: dependant.to_string(),
                to: dependency.to_string(),
            });
        }
        if let (Some(&from), Some(&to)) = (self.index.get(&dependant), self.index.get(&dependency))
        {
            if self.reaches(to, from) {
                return Err(Error::CyclicDependency {
                    from: dependant.to_string(),
                    to: dependency.to_string(),
                });
            }
        }

        let from = self.slot(dependant);
        let to = self.slot(dependency);
        if let Some(node) = self.nodes[from].as_mut() {
            node.dependencies.insert(to);
        }
        if let Some(node) = self.nodes[to].as_mut() {
            node.dependants.insert(from);
        }
        Ok(())
    }

    /// Drop one edge. Returns whether it existed.
    pub fn remove_dependency(&mut self, dependant: &T, dependency: &T) -> bool {
        let (Some(&from), Some(&to)) = (self.index.get(dependant), self.index.get(dependency))
        else {
            return false;
        };
        let removed = self.nodes[from]
            .as_mut()
            .is_some_and(|node| node.dependencies.remove(&to));
        if let Some(node) = self.nodes[to].as_mut() {
            node.dependants.remove(&from);
        }
        removed
    }

    /// Remove a node with all its edges.
    pub fn remove(&mut self, value: &T) -> bool {
        let Some(idx) = self.index.remove(value) else {
            return false;
        };
        let Some(node) = self.nodes[idx].take() else {
            return false;
        };
        self.free.push(idx);
        for dependency in node.dependencies {
            if let Some(other) = self.nodes[dependency].as_mut() {
                other.dependants.remove(&idx);
            }
        }
        for dependant in node.dependants {
            if let Some(other) = self.nodes[dependant].as_mut() {
                other.dependencies.remove(&idx);
            }
        }
        true
    }

    /// Direct dependencies of `value`.
    pub fn dependencies_of(&self, value: &T) -> Vec<T> {
        self.neighbours(value, |node| &node.dependencies)
    }

    /// Direct dependants of `value`.
    pub fn dependants_of(&self, value: &T) -> Vec<T> {
        self.neighbours(value, |node| &node.dependants)
    }

    pub fn has_dependants(&self, value: &T) -> bool {
        self.index
            .get(value)
            .and_then(|&idx| self.nodes[idx].as_ref())
            .is_some_and(|node| !node.dependants.is_empty())
    }

    /// All nodes, dependencies before their dependants.
    ///
    /// Ties are broken by arena slot, so the result is deterministic for a
    /// given sequence of edits.
    pub fn topological_order(&self) -> Vec<T> {
        let mut remaining: Vec<usize> = self
            .nodes
            .iter()
            .map(|node| node.as_ref().map_or(0, |node| node.dependencies.len()))
            .collect();
        let mut ready: VecDeque<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(idx, node)| node.is_some() && remaining[*idx] == 0)
            .map(|(idx, _)| idx)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(idx) = ready.pop_front() {
            let Some(node) = self.nodes[idx].as_ref() else {
                continue;
            };
            order.push(node.value.clone());
            for &dependant in &node.dependants {
                remaining[dependant] -= 1;
                if remaining[dependant] == 0 {
                    ready.push_back(dependant);
                }
            }
        }
        order
    }

    fn slot(&mut self, value: T) -> usize {
        if let Some(&idx) = self.index.get(&value) {
            return idx;
        }
        let node = Some(Node {
            value: value.clone(),
            dependencies: BTreeSet::new(),
            dependants: BTreeSet::new(),
        });
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(value, idx);
        idx
    }

    /// Depth-first search along dependency edges.
    fn reaches(&self, from: usize, target: usize) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![from];
        while let Some(idx) = stack.pop() {
            if idx == target {
                return true;
            }
            if std::mem::replace(&mut visited[idx], true) {
                continue;
            }
            if let Some(node) = self.nodes[idx].as_ref() {
                stack.extend(node.dependencies.iter().copied());
            }
        }
        false
    }

    fn neighbours(&self, value: &T, edges: impl Fn(&Node<T>) -> &BTreeSet<usize>) -> Vec<T> {
        let Some(node) = self.index.get(value).and_then(|&idx| self.nodes[idx].as_ref()) else {
            return Vec::new();
        };
        edges(node)
            .iter()
            .filter_map(|&idx| self.nodes[idx].as_ref().map(|n| n.value.clone()))
            .collect()
    }
}
