//! Dependency graph over resource instances.
//!
//! An edge `a -> b` means `a` depends on `b`: `b` is created or updated
//! before `a`, and `a` is destroyed before `b`. The graph must be acyclic;
//! cycles are reported with every participating address.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::ConfigError;

use super::address::ResourceAddress;

/// Directed dependency graph keyed by resource address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    nodes: BTreeSet<ResourceAddress>,
    edges: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node.
    pub fn add_node(&mut self, address: ResourceAddress) {
        self.nodes.insert(address);
    }

    /// Records that `from` depends on `to`.
    pub fn add_edge(&mut self, from: ResourceAddress, to: ResourceAddress) {
        self.nodes.insert(from.clone());
        self.nodes.insert(to.clone());
        self.edges.entry(from).or_default().insert(to);
    }

    /// Returns true if the graph contains `address`.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.nodes.contains(address)
    }

    /// Returns all nodes in address order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceAddress> {
        self.nodes.iter()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the direct dependencies of `address`.
    pub fn dependencies(&self, address: &ResourceAddress) -> impl Iterator<Item = &ResourceAddress> {
        self.edges.get(address).into_iter().flatten()
    }

    /// Returns the direct dependents of `address`.
    pub fn dependents<'a>(
        &'a self,
        address: &'a ResourceAddress,
    ) -> impl Iterator<Item = &'a ResourceAddress> + 'a {
        self.edges
            .iter()
            .filter(move |(_, deps)| deps.contains(address))
            .map(|(from, _)| from)
    }

    /// Returns every node that depends on `address`, directly or not.
    #[must_use]
    pub fn transitive_dependents(&self, address: &ResourceAddress) -> BTreeSet<ResourceAddress> {
        let reverse = self.reverse_edges();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([address.clone()]);
        while let Some(current) = queue.pop_front() {
            for dependent in reverse.get(&current).into_iter().flatten() {
                if seen.insert((*dependent).clone()) {
                    queue.push_back((*dependent).clone());
                }
            }
        }
        seen
    }

    /// Returns every node `address` depends on, directly or not.
    #[must_use]
    pub fn transitive_dependencies(&self, address: &ResourceAddress) -> BTreeSet<ResourceAddress> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([address.clone()]);
        while let Some(current) = queue.pop_front() {
            for dependency in self.dependencies(&current) {
                if seen.insert(dependency.clone()) {
                    queue.push_back(dependency.clone());
                }
            }
        }
        seen
    }

    /// Returns true if there is a path from `from` to `to`.
    #[must_use]
    pub fn has_path(&self, from: &ResourceAddress, to: &ResourceAddress) -> bool {
        self.transitive_dependencies(from).contains(to)
    }

    /// Returns the strongly connected components that form cycles.
    ///
    /// A component is a cycle if it has more than one node or a self-edge.
    #[must_use]
    pub fn find_cycles(&self) -> Vec<Vec<ResourceAddress>> {
        let mut tarjan = Tarjan::new(self);
        for node in &self.nodes {
            if !tarjan.index.contains_key(node) {
                tarjan.visit(node);
            }
        }

        tarjan
            .components
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|node| self.dependencies(node).any(|dep| dep == node))
            })
            .map(|mut component| {
                component.sort();
                component
            })
            .collect()
    }

    /// Fails if the graph has any cycle.
    ///
    /// # Errors
    ///
    /// Returns `CircularDependency` naming every address on a cycle.
    pub fn check_acyclic(&self) -> Result<(), ConfigError> {
        let cycles = self.find_cycles();
        if cycles.is_empty() {
            return Ok(());
        }

        let addresses: BTreeSet<String> = cycles
            .iter()
            .flatten()
            .map(ToString::to_string)
            .collect();
        Err(ConfigError::CircularDependency {
            addresses: addresses.into_iter().collect(),
        })
    }

    /// Groups nodes into levels; every node's dependencies are in earlier
    /// levels. Nodes within one level are mutually unordered.
    ///
    /// # Errors
    ///
    /// Returns `CircularDependency` if the graph has a cycle.
    pub fn creation_levels(&self) -> Result<Vec<Vec<ResourceAddress>>, ConfigError> {
        self.check_acyclic()?;

        let reverse = self.reverse_edges();
        let mut remaining: BTreeMap<&ResourceAddress, usize> = self
            .nodes
            .iter()
            .map(|node| (node, self.edges.get(node).map_or(0, BTreeSet::len)))
            .collect();

        let mut levels = Vec::new();
        let mut ready: Vec<ResourceAddress> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| (*node).clone())
            .collect();

        while !ready.is_empty() {
            let mut next = BTreeSet::new();
            for node in &ready {
                for dependent in reverse.get(node).into_iter().flatten() {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.insert((*dependent).clone());
                        }
                    }
                }
            }
            levels.push(std::mem::take(&mut ready));
            ready = next.into_iter().collect();
        }

        Ok(levels)
    }

    /// Returns a creation order: dependencies before dependents.
    ///
    /// # Errors
    ///
    /// Returns `CircularDependency` if the graph has a cycle.
    pub fn creation_order(&self) -> Result<Vec<ResourceAddress>, ConfigError> {
        Ok(self.creation_levels()?.into_iter().flatten().collect())
    }

    /// Returns a destruction order: dependents before dependencies.
    ///
    /// # Errors
    ///
    /// Returns `CircularDependency` if the graph has a cycle.
    pub fn destruction_order(&self) -> Result<Vec<ResourceAddress>, ConfigError> {
        let mut order = self.creation_order()?;
        order.reverse();
        Ok(order)
    }

    fn reverse_edges(&self) -> BTreeMap<&ResourceAddress, BTreeSet<&ResourceAddress>> {
        let mut reverse: BTreeMap<&ResourceAddress, BTreeSet<&ResourceAddress>> = BTreeMap::new();
        for (from, deps) in &self.edges {
            for to in deps {
                reverse.entry(to).or_default().insert(from);
            }
        }
        reverse
    }
}

/// Tarjan's strongly connected components.
struct Tarjan<'g> {
    graph: &'g DependencyGraph,
    next_index: usize,
    index: BTreeMap<&'g ResourceAddress, usize>,
    lowlink: BTreeMap<&'g ResourceAddress, usize>,
    stack: Vec<&'g ResourceAddress>,
    on_stack: BTreeSet<&'g ResourceAddress>,
    components: Vec<Vec<ResourceAddress>>,
}

impl<'g> Tarjan<'g> {
    fn new(graph: &'g DependencyGraph) -> Self {
        Self {
            graph,
            next_index: 0,
            index: BTreeMap::new(),
            lowlink: BTreeMap::new(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, node: &'g ResourceAddress) {
        self.index.insert(node, self.next_index);
        self.lowlink.insert(node, self.next_index);
        self.next_index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);

        let graph = self.graph;
        for dep in graph.dependencies(node) {
            if !self.index.contains_key(dep) {
                self.visit(dep);
                let low = self.lowlink[dep].min(self.lowlink[node]);
                self.lowlink.insert(node, low);
            } else if self.on_stack.contains(dep) {
                let low = self.index[dep].min(self.lowlink[node]);
                self.lowlink.insert(node, low);
            }
        }

        if self.lowlink[node] == self.index[node] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack.remove(member);
                component.push(member.clone());
                if member == node {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str) -> ResourceAddress {
        ResourceAddress::new("t", name)
    }

    #[test]
    fn test_levels_respect_dependencies() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(addr("b"), addr("a"));
        graph.add_edge(addr("c"), addr("b"));
        graph.add_node(addr("free"));

        let levels = graph.creation_levels().unwrap();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec![addr("a"), addr("free")]);
        assert_eq!(levels[2], vec![addr("c")]);

        let destroy = graph.destruction_order().unwrap();
        let pos = |n: &str| destroy.iter().position(|a| a == &addr(n)).unwrap();
        assert!(pos("c") < pos("b"));
        assert!(pos("b") < pos("a"));
    }

    #[test]
    fn test_cycle_names_both_addresses() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(addr("x"), addr("y"));
        graph.add_edge(addr("y"), addr("x"));
        graph.add_edge(addr("z"), addr("x"));

        let err = graph.check_acyclic().unwrap_err();
        match err {
            ConfigError::CircularDependency { addresses } => {
                assert_eq!(addresses, vec![String::from("t.x"), String::from("t.y")]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(graph.creation_order().is_err());
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(addr("s"), addr("s"));
        assert_eq!(graph.find_cycles(), vec![vec![addr("s")]]);
    }

    #[test]
    fn test_transitive_queries() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(addr("b"), addr("a"));
        graph.add_edge(addr("c"), addr("b"));
        graph.add_node(addr("d"));

        let dependents = graph.transitive_dependents(&addr("a"));
        assert_eq!(dependents, [addr("b"), addr("c")].into_iter().collect());
        assert!(graph.has_path(&addr("c"), &addr("a")));
        assert!(!graph.has_path(&addr("a"), &addr("c")));
        assert_eq!(graph.dependents(&addr("b")).count(), 1);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(addr("b").with_index(0), addr("a"));
        let json = serde_json::to_string(&graph).unwrap();
        let back: DependencyGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, graph);
    }
}
