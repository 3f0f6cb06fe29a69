//! The resource graph: nodes, dependency edges and per-node output slots.
//!
//! Edges come from two places. Explicit edges are declared ordering
//! (`ResourceNode::depends_on` or [`ResourceGraph::add_edge`]); implicit
//! edges are inferred from the outputs and secret references embedded in a
//! node's desired state. Both feed the same [`Dag`], so validation and
//! ordering never depend on how an edge was declared.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use keel_core::NodeId;

use crate::dag::Dag;
use crate::error::{Error, NodeFailure, Result};
use crate::node::{NodeStatus, Outputs, ResourceNode};
use crate::output::{Output, OutputError};
use crate::provider::Materialized;

/// How a dependency edge was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Declared ordering.
    Explicit,
    /// Inferred from a value reference.
    Implicit,
}

/// A dependency edge: `to` depends on `from`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The prerequisite.
    pub from: NodeId,
    /// The dependent.
    pub to: NodeId,
    /// How the edge was declared.
    pub kind: EdgeKind,
}

/// Nodes, edges and output slots of one stack.
#[derive(Debug, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<NodeId, ResourceNode>,
    explicit: BTreeSet<(NodeId, NodeId)>,
    outputs: BTreeMap<NodeId, Output<Outputs>>,
}

impl ResourceGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateNode`] if a node with the same ID exists.
    pub fn add_node(&mut self, node: ResourceNode) -> Result<()> {
        let id = node.id().clone();
        if self.nodes.contains_key(&id) {
            return Err(Error::DuplicateNode { node_id: id });
        }
        self.outputs
            .entry(id.clone())
            .or_insert_with(|| Output::produced_by(id.clone()));
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Declares that `dependent` must be applied after `dependency`.
    ///
    /// Adding an edge twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NodeNotFound`] if either node is unknown.
    pub fn add_edge(&mut self, dependency: &NodeId, dependent: &NodeId) -> Result<()> {
        for id in [dependency, dependent] {
            if !self.nodes.contains_key(id) {
                return Err(Error::NodeNotFound {
                    node_id: id.clone(),
                });
            }
        }
        self.explicit
            .insert((dependency.clone(), dependent.clone()));
        Ok(())
    }

    /// Returns the output slot of a node, creating it if the node has not
    /// been declared yet so forward references work.
    pub fn outputs_of(&mut self, id: &NodeId) -> Output<Outputs> {
        self.outputs
            .entry(id.clone())
            .or_insert_with(|| Output::produced_by(id.clone()))
            .clone()
    }

    /// Returns the output slot of a node, if any.
    #[must_use]
    pub fn output_slot(&self, id: &NodeId) -> Option<&Output<Outputs>> {
        self.outputs.get(id)
    }

    /// Returns a node.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Returns a mutable node.
    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut ResourceNode> {
        self.nodes.get_mut(id)
    }

    /// Iterates nodes in ID order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Node IDs in ID order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// Every dependency edge, explicit ones first when an edge is both
    /// declared and inferred.
    #[must_use]
    pub fn edges(&self) -> Vec<DependencyEdge> {
        let mut explicit: BTreeSet<(NodeId, NodeId)> = self.explicit.clone();
        for node in self.nodes.values() {
            for dep in &node.depends_on {
                explicit.insert((dep.clone(), node.id().clone()));
            }
        }

        let mut edges: Vec<DependencyEdge> = explicit
            .iter()
            .map(|(from, to)| DependencyEdge {
                from: from.clone(),
                to: to.clone(),
                kind: EdgeKind::Explicit,
            })
            .collect();
        for node in self.nodes.values() {
            for reference in node.references() {
                let pair = (reference, node.id().clone());
                if !explicit.contains(&pair) {
                    edges.push(DependencyEdge {
                        from: pair.0,
                        to: pair.1,
                        kind: EdgeKind::Implicit,
                    });
                }
            }
        }
        edges.sort();
        edges.dedup_by(|a, b| a.from == b.from && a.to == b.to);
        edges
    }

    fn dag(&self) -> Result<Dag<NodeId>> {
        let mut dag = Dag::new();
        for id in self.nodes.keys() {
            dag.add_node(id.clone());
        }
        for edge in self.edges() {
            let Some(from) = dag.get_index(&edge.from) else {
                return Err(Error::DependencyNotFound {
                    node_id: edge.to,
                    dependency: edge.from,
                });
            };
            let to = dag.get_index(&edge.to).ok_or_else(|| Error::NodeNotFound {
                node_id: edge.to.clone(),
            })?;
            dag.add_edge(from, to)?;
        }
        Ok(dag)
    }

    /// Validates the graph: every dependency exists and there are no cycles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DependencyNotFound`] or [`Error::CycleDetected`].
    pub fn validate(&self) -> Result<()> {
        let dag = self.dag()?;
        if let Some(cycle) = dag.find_cycle() {
            return Err(Error::CycleDetected {
                cycle: cycle.iter().map(ToString::to_string).collect(),
            });
        }
        Ok(())
    }

    /// Returns node IDs in dependency order, ties broken by node ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        self.dag()?.toposort()
    }

    fn lookup(dag: &Dag<NodeId>, id: &NodeId) -> Result<petgraph::graph::NodeIndex> {
        dag.get_index(id).ok_or_else(|| Error::NodeNotFound {
            node_id: id.clone(),
        })
    }

    /// Direct dependencies of a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or the graph is invalid.
    pub fn dependencies_of(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        let dag = self.dag()?;
        dag.upstream(Self::lookup(&dag, id)?)
    }

    /// Direct dependents of a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or the graph is invalid.
    pub fn dependents_of(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        let dag = self.dag()?;
        dag.downstream(Self::lookup(&dag, id)?)
    }

    /// Every node that depends on `id`, directly or transitively.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or the graph is invalid.
    pub fn transitive_dependents(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        let dag = self.dag()?;
        dag.transitive_downstream(Self::lookup(&dag, id)?)
    }

    /// Moves a node to `Applying` once every dependency is `Applied`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if a dependency is not
    /// applied or the node is not pending.
    pub fn begin_apply(&mut self, id: &NodeId) -> Result<()> {
        let dependencies = self.dependencies_of(id)?;
        if let Some(blocker) = dependencies.iter().find(|dep| {
            self.nodes
                .get(*dep)
                .is_none_or(|node| node.status() != NodeStatus::Applied)
        }) {
            return Err(Error::InvalidStateTransition {
                from: NodeStatus::Pending.to_string(),
                to: NodeStatus::Applying.to_string(),
                reason: format!("dependency {blocker} is not applied"),
            });
        }
        self.node_mut_or_err(id)?.transition_to(NodeStatus::Applying)
    }

    /// Marks a node applied and resolves its output slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or not applying.
    pub fn complete(&mut self, id: &NodeId, materialized: Materialized) -> Result<()> {
        let Materialized {
            physical_id,
            outputs,
        } = materialized.with_identity();
        let node = self.node_mut_or_err(id)?;
        node.set_physical_id(physical_id);
        node.transition_to(NodeStatus::Applied)?;
        self.outputs_of(id).resolve(outputs);
        Ok(())
    }

    /// Marks a node failed and fails its output slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or already terminal.
    pub fn fail(&mut self, id: &NodeId, failure: NodeFailure) -> Result<()> {
        let message = failure.to_string();
        self.node_mut_or_err(id)?.fail(failure)?;
        self.outputs_of(id)
            .fail(OutputError::from_node(id.clone(), message));
        Ok(())
    }

    /// Marks every pending transitive dependent of `id` failed by dependency.
    ///
    /// Returns the IDs that were marked.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid.
    pub fn fail_dependents(&mut self, id: &NodeId) -> Result<Vec<NodeId>> {
        let mut marked = Vec::new();
        for dependent in self.transitive_dependents(id)? {
            let pending = self
                .nodes
                .get(&dependent)
                .is_some_and(|node| node.status() == NodeStatus::Pending);
            if pending {
                self.fail(
                    &dependent,
                    NodeFailure::Dependency {
                        upstream: id.clone(),
                    },
                )?;
                marked.push(dependent);
            }
        }
        Ok(marked)
    }

    fn node_mut_or_err(&mut self, id: &NodeId) -> Result<&mut ResourceNode> {
        self.nodes.get_mut(id).ok_or_else(|| Error::NodeNotFound {
            node_id: id.clone(),
        })
    }
}
