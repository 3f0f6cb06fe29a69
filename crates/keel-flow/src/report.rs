//! Apply and destroy reports.
//!
//! Partial completion is a first-class outcome: a report lists every node
//! with its final status and failure, and maps the aggregate to a process
//! exit code.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use keel_core::{ApplyId, NodeId, PhysicalId};

use crate::error::NodeFailure;
use crate::gate::GateState;
use crate::node::{NodeAction, NodeStatus, ResourceKind, ResourceNode};

/// Exit code: every node applied.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code: a node failed (or the apply was cancelled before finishing).
pub const EXIT_FAILED: i32 = 1;
/// Exit code: a gate timed out awaiting external action.
pub const EXIT_GATE_TIMED_OUT: i32 = 2;

/// Final state of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    /// Node ID.
    pub node_id: NodeId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Final status.
    pub status: NodeStatus,
    /// What the apply did, if the node was attempted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<NodeAction>,
    /// Physical ID, if materialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<PhysicalId>,
    /// Provider attempts made.
    pub attempts: u32,
    /// Why the node failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<NodeFailure>,
    /// Gate progress, if a gate ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateState>,
    /// Gate the node is still waiting on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<NodeId>,
}

impl NodeReport {
    /// Captures the current state of `node`.
    #[must_use]
    pub fn from_node(node: &ResourceNode) -> Self {
        Self {
            node_id: node.id().clone(),
            kind: node.kind(),
            status: node.status(),
            action: node.action,
            physical_id: node.physical_id().cloned(),
            attempts: node.attempts,
            failure: node.failure.clone(),
            gate: node.gate_state.clone(),
            blocked_by: node.blocked_by.clone(),
        }
    }

    /// Returns true if the node failed on its own (not by dependency).
    #[must_use]
    pub fn is_root_failure(&self) -> bool {
        self.failure.as_ref().is_some_and(|f| !f.is_dependency())
    }

    /// Returns true if the node was never attempted and is not blocked.
    #[must_use]
    pub fn not_attempted(&self) -> bool {
        self.status == NodeStatus::Pending && self.blocked_by.is_none()
    }
}

/// Result of a teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyReport {
    /// Deleted nodes, in deletion order.
    pub deleted: Vec<NodeId>,
    /// Nodes whose deletion failed.
    pub failed: BTreeMap<NodeId, NodeFailure>,
    /// Nodes left in place because a dependent could not be deleted.
    pub blocked: Vec<NodeId>,
    /// Nodes not reached because the teardown was cancelled.
    pub skipped: Vec<NodeId>,
}

impl DestroyReport {
    /// Returns true if nothing failed, was blocked or skipped.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && self.skipped.is_empty()
    }

    /// 0 on full teardown, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILED
        }
    }
}

/// Result of an apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    /// Invocation ID.
    pub apply_id: ApplyId,
    /// Stack name.
    pub stack: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// True if the cancellation token fired.
    pub cancelled: bool,
    /// Every declared node, in apply order.
    pub nodes: Vec<NodeReport>,
    /// Teardown of nodes that are no longer declared.
    pub orphans: DestroyReport,
    /// Resolved exports.
    pub exports: BTreeMap<String, Value>,
}

impl ApplyReport {
    /// Returns the report of one node.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node_id.as_str() == id)
    }

    /// Number of nodes in each status.
    #[must_use]
    pub fn status_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for node in &self.nodes {
            *counts.entry(node.status.as_label()).or_insert(0) += 1;
        }
        counts
    }

    /// Returns true if some gate timed out awaiting external action.
    #[must_use]
    pub fn has_gate_timeout(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n.failure, Some(NodeFailure::GateTimedOut { .. })))
    }

    /// Maps the aggregate outcome to a process exit code.
    ///
    /// - `1` if any node failed on its own (other than a gate timeout), an
    ///   orphan could not be torn down, or cancellation left nodes unattempted
    /// - `2` if the only problem is a gate awaiting external confirmation
    /// - `0` if every node applied
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        let hard_failure = self.nodes.iter().any(|n| {
            n.is_root_failure() && !matches!(n.failure, Some(NodeFailure::GateTimedOut { .. }))
        });
        if hard_failure || !self.orphans.is_success() {
            return EXIT_FAILED;
        }
        if self.has_gate_timeout() {
            return EXIT_GATE_TIMED_OUT;
        }
        if self.cancelled && self.nodes.iter().any(NodeReport::not_attempted) {
            return EXIT_FAILED;
        }
        EXIT_SUCCESS
    }
}
