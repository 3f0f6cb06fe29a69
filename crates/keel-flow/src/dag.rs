//! Directed Acyclic Graph (DAG) for dependency management.
//!
//! This module provides a generic DAG used by the resource graph for:
//! - Cycle detection with a full cycle path
//! - Deterministic topological ordering (ties broken by node order)
//! - Upstream/downstream and transitive dependent queries
//!
//! Edges point from prerequisite to dependent.
//!
//! **Note:** This module is internal to `keel-flow` to preserve freedom to change internals.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::error::{Error, Result};

/// A directed acyclic graph for dependency management.
///
/// **API Note:** Methods accepting node references take `NodeIndex` for
/// type safety; use [`Dag::get_index`] to look one up by value.
#[derive(Debug, Clone)]
pub struct Dag<T>
where
    T: Clone + Ord + Hash + Display,
{
    graph: DiGraph<T, ()>,
    index_map: HashMap<T, NodeIndex>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl<T> Dag<T>
where
    T: Clone + Ord + Hash + Display,
{
    /// Creates a new empty DAG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_map: HashMap::new(),
        }
    }

    /// Returns the number of nodes in the DAG.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the DAG.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Adds a node to the DAG.
    ///
    /// If the node already exists, this is a no-op returning its index.
    pub fn add_node(&mut self, value: T) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&value) {
            return idx;
        }
        let idx = self.graph.add_node(value.clone());
        self.index_map.insert(value, idx);
        idx
    }

    /// Adds a directed edge from `from` (prerequisite) to `to` (dependent).
    ///
    /// Adding an edge that already exists is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if either node index is invalid.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) -> Result<()> {
        self.weight(from)?;
        self.weight(to)?;
        self.graph.update_edge(from, to, ());
        Ok(())
    }

    fn weight(&self, idx: NodeIndex) -> Result<&T> {
        self.graph
            .node_weight(idx)
            .ok_or_else(|| Error::DagNodeNotFound {
                node: format!("index {}", idx.index()),
            })
    }

    fn sorted_values(&self, indices: impl Iterator<Item = NodeIndex>) -> Vec<T> {
        let mut values: Vec<T> = indices
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect();
        values.sort();
        values.dedup();
        values
    }

    /// Returns a topologically sorted list of nodes.
    ///
    /// Uses Kahn's algorithm; among nodes that are ready at the same time the
    /// smallest value (by `Ord`) comes first, so the result depends only on
    /// the graph's contents and never on insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] with the full cycle path if the graph
    /// contains a cycle.
    pub fn toposort(&self) -> Result<Vec<T>> {
        let node_count = self.graph.node_count();
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| (idx, 0))
            .collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut ready: BTreeSet<(T, NodeIndex)> = BTreeSet::new();
        for (&idx, &deg) in &in_degree {
            if deg == 0 {
                ready.insert((self.weight(idx)?.clone(), idx));
            }
        }

        let mut result = Vec::with_capacity(node_count);
        while let Some((value, idx)) = ready.pop_first() {
            result.push(value);
            for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        ready.insert((self.weight(neighbor)?.clone(), neighbor));
                    }
                }
            }
        }

        if result.len() != node_count {
            let cycle = self.find_cycle().unwrap_or_default();
            return Err(Error::CycleDetected {
                cycle: cycle.iter().map(ToString::to_string).collect(),
            });
        }

        Ok(result)
    }

    /// Finds a cycle by depth-first traversal with recursion-stack marking.
    ///
    /// Returns the cycle path with its first node repeated at the end, or
    /// `None` if the graph is acyclic. Traversal visits nodes and neighbors
    /// in `Ord` order so the reported cycle is deterministic.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<T>> {
        let mut marks: HashMap<NodeIndex, Mark> = self
            .graph
            .node_indices()
            .map(|idx| (idx, Mark::Unvisited))
            .collect();
        let mut roots: Vec<NodeIndex> = self.graph.node_indices().collect();
        roots.sort_by(|a, b| self.graph.node_weight(*a).cmp(&self.graph.node_weight(*b)));

        let mut path = Vec::new();
        for root in roots {
            if marks.get(&root).copied() == Some(Mark::Unvisited) {
                if let Some(cycle) = self.visit(root, &mut marks, &mut path) {
                    return Some(
                        cycle
                            .into_iter()
                            .filter_map(|idx| self.graph.node_weight(idx).cloned())
                            .collect(),
                    );
                }
            }
        }
        None
    }

    fn visit(
        &self,
        idx: NodeIndex,
        marks: &mut HashMap<NodeIndex, Mark>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        marks.insert(idx, Mark::OnStack);
        path.push(idx);

        let mut neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        neighbors.sort_by(|a, b| self.graph.node_weight(*a).cmp(&self.graph.node_weight(*b)));
        neighbors.dedup();

        for next in neighbors {
            match marks.get(&next).copied().unwrap_or(Mark::Unvisited) {
                Mark::OnStack => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle: Vec<NodeIndex> = path.get(start..).unwrap_or_default().to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks.insert(idx, Mark::Done);
        None
    }

    /// Returns the direct prerequisites of a node, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the node index is invalid.
    pub fn upstream(&self, node: NodeIndex) -> Result<Vec<T>> {
        self.weight(node)?;
        Ok(self.sorted_values(self.graph.neighbors_directed(node, Direction::Incoming)))
    }

    /// Returns the direct dependents of a node, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the node index is invalid.
    pub fn downstream(&self, node: NodeIndex) -> Result<Vec<T>> {
        self.weight(node)?;
        Ok(self.sorted_values(self.graph.neighbors_directed(node, Direction::Outgoing)))
    }

    /// Returns every node reachable from `node` along dependent edges, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the node index is invalid.
    pub fn transitive_downstream(&self, node: NodeIndex) -> Result<Vec<T>> {
        self.weight(node)?;
        let mut seen: BTreeSet<NodeIndex> = BTreeSet::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::from([node]);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if next != node && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        Ok(self.sorted_values(seen.into_iter()))
    }

    /// Returns all nodes with no incoming edges, sorted.
    #[must_use]
    pub fn roots(&self) -> Vec<T> {
        self.sorted_values(self.graph.node_indices().filter(|&idx| {
            self.graph
                .neighbors_directed(idx, Direction::Incoming)
                .next()
                .is_none()
        }))
    }

    /// Returns true if the node exists in the DAG.
    #[must_use]
    pub fn contains(&self, node: &T) -> bool {
        self.index_map.contains_key(node)
    }

    /// Returns the node index for a value, if it exists.
    #[must_use]
    pub fn get_index(&self, value: &T) -> Option<NodeIndex> {
        self.index_map.get(value).copied()
    }
}

impl<T> Default for Dag<T>
where
    T: Clone + Ord + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag(nodes: &[&str], edges: &[(&str, &str)]) -> Dag<String> {
        let mut dag = Dag::new();
        for n in nodes {
            dag.add_node((*n).to_string());
        }
        for (from, to) in edges {
            let f = dag.add_node((*from).to_string());
            let t = dag.add_node((*to).to_string());
            dag.add_edge(f, t).unwrap();
        }
        dag
    }

    #[test]
    fn empty_dag_has_no_nodes() {
        let dag: Dag<String> = Dag::new();
        assert_eq!(dag.node_count(), 0);
        assert!(dag.toposort().unwrap().is_empty());
        assert!(dag.find_cycle().is_none());
    }

    #[test]
    fn linear_dag_sorts_correctly() {
        let dag = dag(&["c", "b", "a"], &[("a", "b"), ("b", "c")]);
        assert_eq!(dag.toposort().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn ties_are_broken_by_value_not_insertion_order() {
        let first = dag(&["d", "b", "a", "c"], &[("a", "c"), ("b", "d")]);
        let second = dag(&["a", "b", "c", "d"], &[("b", "d"), ("a", "c")]);
        assert_eq!(first.toposort().unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(first.toposort().unwrap(), second.toposort().unwrap());
    }

    #[test]
    fn duplicate_edges_are_ignored() {
        let mut d = dag(&["a", "b"], &[("a", "b")]);
        let a = d.get_index(&"a".to_string()).unwrap();
        let b = d.get_index(&"b".to_string()).unwrap();
        d.add_edge(a, b).unwrap();
        assert_eq!(d.edge_count(), 1);
    }

    #[test]
    fn dag_detects_cycle_with_full_path() {
        let dag = dag(&["a", "b", "c", "x"], &[("x", "a"), ("a", "b"), ("b", "c"), ("c", "a")]);
        let err = dag.toposort().unwrap_err();
        match err {
            Error::CycleDetected { cycle } => assert_eq!(cycle, vec!["a", "b", "c", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let dag = dag(&["a"], &[("a", "a")]);
        assert_eq!(dag.find_cycle().unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn upstream_and_downstream_are_sorted() {
        let dag = dag(&["c", "b", "a"], &[("b", "c"), ("a", "c"), ("a", "b")]);
        let c = dag.get_index(&"c".to_string()).unwrap();
        let a = dag.get_index(&"a".to_string()).unwrap();
        assert_eq!(dag.upstream(c).unwrap(), vec!["a", "b"]);
        assert_eq!(dag.downstream(a).unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn transitive_downstream_follows_chains() {
        let dag = dag(&["a", "b", "c", "d"], &[("a", "b"), ("b", "c"), ("x", "d")]);
        let a = dag.get_index(&"a".to_string()).unwrap();
        assert_eq!(dag.transitive_downstream(a).unwrap(), vec!["b", "c"]);
        assert_eq!(dag.roots(), vec!["a", "x"]);
    }
}
