//! Custom assertion helpers for integration tests.

use keel_core::NodeId;
use keel_flow::error::NodeFailure;
use keel_flow::graph::DependencyEdge;
use keel_flow::node::NodeStatus;
use keel_flow::provider::InMemoryProvider;
use keel_flow::report::ApplyReport;

/// Asserts that every node of an apply ended `Applied`.
///
/// # Panics
///
/// Panics naming the first node that did not apply.
pub fn assert_all_applied(report: &ApplyReport) {
    for node in &report.nodes {
        assert_eq!(
            node.status,
            NodeStatus::Applied,
            "Expected {} to be applied, but it was {} ({:?})",
            node.node_id,
            node.status,
            node.failure
        );
    }
    assert_eq!(report.exit_code(), 0, "Expected exit code 0");
}

/// Asserts the final status of one node.
///
/// # Panics
///
/// Panics if the node is missing or has another status.
pub fn assert_node_status(report: &ApplyReport, id: &str, status: NodeStatus) {
    let node = report
        .node(id)
        .unwrap_or_else(|| panic!("node {id} missing from report"));
    assert_eq!(
        node.status, status,
        "Expected {id} to be {status}, but it was {} ({:?})",
        node.status, node.failure
    );
}

/// Asserts that a node failed because `upstream` failed.
///
/// # Panics
///
/// Panics if the node did not fail by dependency on `upstream`.
pub fn assert_dependency_failed(report: &ApplyReport, id: &str, upstream: &str) {
    assert_node_status(report, id, NodeStatus::Failed);
    let failure = report.node(id).and_then(|n| n.failure.clone());
    match failure {
        Some(NodeFailure::Dependency { upstream: actual }) => assert_eq!(
            actual.as_str(),
            upstream,
            "Expected {id} to be blocked by {upstream}, but it was blocked by {actual}"
        ),
        other => panic!("Expected {id} to fail by dependency on {upstream}, got {other:?}"),
    }
}

/// Asserts that the provider never created, updated or deleted `ids`.
///
/// # Panics
///
/// Panics naming the first node with a mutating call.
pub fn assert_no_mutations(provider: &InMemoryProvider, ids: &[&str]) {
    for id in ids {
        let node = NodeId::new(*id).expect("valid node id");
        let calls = provider.calls(&node);
        assert_eq!(
            calls.mutations(),
            0,
            "Expected no mutating calls for {id}, got {calls:?}"
        );
    }
}

/// Asserts that every dependency was created before its dependents.
///
/// # Panics
///
/// Panics on the first edge whose dependent was created first.
pub fn assert_created_in_dependency_order(created: &[NodeId], edges: &[DependencyEdge]) {
    let position = |id: &NodeId| created.iter().position(|c| c == id);
    for edge in edges {
        if let (Some(from), Some(to)) = (position(&edge.from), position(&edge.to)) {
            assert!(
                from < to,
                "{} was created before its dependency {}",
                edge.to,
                edge.from
            );
        }
    }
}
