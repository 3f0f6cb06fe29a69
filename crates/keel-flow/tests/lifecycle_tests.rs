//! Lifecycle tests: confirmation gates, secret rotation, orphan teardown
//! and destroy.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use tokio_util::sync::CancellationToken;

use keel_core::NodeId;
use keel_flow::error::NodeFailure;
use keel_flow::gate::GatePhase;
use keel_flow::desired::DesiredState;
use keel_flow::node::{NodeAction, NodeStatus, ResourceKind, ResourceNode};
use keel_flow::plan::{PlanAction, UpdateReason};
use keel_flow::provider::ProviderError;
use keel_flow::stack::{Stack, StackConfig};
use keel_test_utils::{
    StackFactory, TestHarness, assert_all_applied, assert_node_status, init_test_logging, node_id,
};

/// A gate that confirms after a few polls lets its dependents proceed.
#[tokio::test(start_paused = true)]
async fn gate_confirms_after_polling() {
    let harness = TestHarness::new();
    harness.provider.confirm_after(&node_id("cert-validation"), 3);

    let report = harness.apply(&mut StackFactory::web("hunter2")).await;

    assert_all_applied(&report);
    let gate = report.node("cert-validation").unwrap().gate.clone().unwrap();
    assert_eq!(gate.phase, GatePhase::Confirmed);
    assert_eq!(gate.polls, 4);
    assert!(report.node("app-lb").unwrap().gate.is_none());
}

/// A gate that never confirms times out, blocks its dependents without
/// failing them, and maps the apply to exit code 2.
#[tokio::test(start_paused = true)]
async fn gate_timeout_blocks_dependents_with_exit_code_two() {
    init_test_logging();
    let harness = TestHarness::new();
    harness.provider.never_confirm(&node_id("cert-validation"));

    let report = harness.apply(&mut StackFactory::web("hunter2")).await;

    assert_node_status(&report, "cert-validation", NodeStatus::Failed);
    let node = report.node("cert-validation").unwrap();
    assert!(matches!(
        node.failure,
        Some(NodeFailure::GateTimedOut { polls: 11, .. })
    ));
    assert_eq!(node.gate.as_ref().unwrap().phase, GatePhase::TimedOut);

    let listener = report.node("https-listener").unwrap();
    assert_eq!(listener.status, NodeStatus::Pending);
    assert_eq!(listener.blocked_by, Some(node_id("cert-validation")));
    assert_eq!(harness.provider.calls(&node_id("https-listener")).total(), 0);

    for unrelated in ["www", "app-service", "db-secret"] {
        assert_node_status(&report, unrelated, NodeStatus::Applied);
    }
    assert!(report.has_gate_timeout());
    assert_eq!(report.exit_code(), 2);
}

/// After a gate timeout the next apply resumes the gate without
/// recreating the resource.
#[tokio::test(start_paused = true)]
async fn timed_out_gate_resumes_on_next_apply() {
    let harness = TestHarness::new();
    let validation = node_id("cert-validation");
    harness.provider.never_confirm(&validation);
    let first = harness.apply(&mut StackFactory::web("hunter2")).await;
    assert_eq!(first.exit_code(), 2);

    let plan = harness.plan(&mut StackFactory::web("hunter2")).await;
    let change = plan.changes.iter().find(|c| c.node_id == validation).unwrap();
    assert_eq!(change.action, PlanAction::ResumeGate);

    harness.provider.confirm_after(&validation, 0);
    let second = harness.apply(&mut StackFactory::web("hunter2")).await;

    assert_all_applied(&second);
    assert_eq!(second.node("cert-validation").unwrap().action, Some(NodeAction::GateResumed));
    assert_eq!(second.node("https-listener").unwrap().action, Some(NodeAction::Created));
    assert_eq!(harness.provider.calls(&validation).create, 1);
}

/// An explicit rejection fails the gated node and its dependents.
#[tokio::test]
async fn rejected_gate_fails_dependents() {
    let harness = TestHarness::new();
    harness
        .provider
        .reject(&node_id("cert-validation"), "CAA record forbids issuance");

    let report = harness.apply(&mut StackFactory::web("hunter2")).await;

    match &report.node("cert-validation").unwrap().failure {
        Some(NodeFailure::GateRejected { reason }) => {
            assert_eq!(reason, "CAA record forbids issuance");
        }
        other => panic!("expected gate rejection, got {other:?}"),
    }
    assert_node_status(&report, "https-listener", NodeStatus::Failed);
    assert_eq!(report.exit_code(), 1);
}

/// Rotating secret material bumps the vault version and updates consumers
/// that bind the latest version.
#[tokio::test]
async fn secret_rotation_updates_consumers() {
    let harness = TestHarness::new();
    harness.apply(&mut StackFactory::web("hunter2")).await;

    let plan = harness.plan(&mut StackFactory::web("correct-horse")).await;
    let secret_change = plan
        .changes
        .iter()
        .find(|c| c.node_id.as_str() == "db-secret")
        .unwrap();
    assert_eq!(
        secret_change.action,
        PlanAction::Update {
            reason: UpdateReason::ConfigChanged
        }
    );

    let report = harness.apply(&mut StackFactory::web("correct-horse")).await;

    assert_all_applied(&report);
    assert_eq!(
        report.node("db-secret").unwrap().action,
        Some(NodeAction::Updated {
            reason: UpdateReason::ConfigChanged
        })
    );
    assert_eq!(
        report.node("app-service").unwrap().action,
        Some(NodeAction::Updated {
            reason: UpdateReason::SecretRotated
        })
    );
    assert_eq!(report.node("app-lb").unwrap().action, Some(NodeAction::Unchanged));

    let secret_id = report.node("db-secret").unwrap().physical_id.clone().unwrap();
    assert_eq!(harness.vault.current_version(&secret_id), Some(2));
    assert_eq!(harness.vault.calls().put_secret_value, 1);
    assert_eq!(harness.provider.calls(&node_id("app-service")).update, 1);
}

/// Secret plaintext never reaches the provider; consumers see a reference
/// with a concrete version.
#[tokio::test]
async fn provider_sees_secret_references_only() {
    let harness = TestHarness::new();
    let report = harness.apply(&mut StackFactory::web("hunter2")).await;

    let service_id = report.node("app-service").unwrap().physical_id.clone().unwrap();
    let service = harness.provider.resource(&service_id).unwrap();
    let rendered = service.desired.to_string();
    assert!(!rendered.contains("hunter2"));
    let reference = &service.desired["secrets"][0]["$secretRef"];
    assert_eq!(reference["version"], serde_json::json!(1));
    assert_eq!(reference["keyPath"], serde_json::json!("password"));
}

/// Nodes dropped from the declaration are deleted after a clean apply.
#[tokio::test]
async fn undeclared_nodes_are_torn_down() {
    let harness = TestHarness::new();
    harness.apply(&mut StackFactory::chain(&["a", "b", "c"])).await;

    let plan = harness.plan(&mut StackFactory::chain(&["a", "b"])).await;
    let orphan = plan.changes.iter().find(|c| c.node_id.as_str() == "c").unwrap();
    assert_eq!(orphan.action, PlanAction::Delete);

    let report = harness.apply(&mut StackFactory::chain(&["a", "b"])).await;

    assert_all_applied(&report);
    assert_eq!(report.orphans.deleted, vec![node_id("c")]);
    assert_eq!(harness.provider.calls(&node_id("c")).delete, 1);
    assert_eq!(harness.state.len().unwrap(), 2);
}

/// Orphans stay in place while the apply is incomplete.
#[tokio::test]
async fn orphans_survive_a_failed_apply() {
    let harness = TestHarness::new();
    harness.apply(&mut StackFactory::chain(&["a", "b", "c"])).await;
    harness
        .provider
        .fail_always(&node_id("d"), ProviderError::permanent("InvalidParameter"));

    let report = harness.apply(&mut StackFactory::chain(&["a", "d"])).await;

    assert_eq!(report.exit_code(), 1);
    assert!(report.orphans.deleted.is_empty());
    assert_eq!(harness.provider.calls(&node_id("c")).delete, 0);
    assert_eq!(harness.state.len().unwrap(), 3);
}

/// Destroy deletes dependents before their dependencies and clears state.
#[tokio::test]
async fn destroy_runs_in_reverse_dependency_order() {
    let harness = TestHarness::new();
    let mut stack = StackFactory::web("hunter2");
    let edges = stack.graph().edges();
    harness.apply(&mut stack).await;

    let report = harness.destroy().await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.deleted.len(), 10);
    let position = |id: &NodeId| report.deleted.iter().position(|d| d == id).unwrap();
    for edge in &edges {
        assert!(
            position(&edge.to) < position(&edge.from),
            "{} deleted before its dependent {}",
            edge.from,
            edge.to
        );
    }
    assert_eq!(harness.state.len().unwrap(), 0);
    assert_eq!(harness.provider.resource_count(), 0);
    assert_eq!(harness.vault.calls().delete_secret, 1);
}

fn pair(linked: bool) -> Stack {
    let mut stack = Stack::new(StackConfig::new("pair"));
    let mut user = ResourceNode::new(node_id("a-user"), ResourceKind::LogGroup)
        .with_desired(DesiredState::new().with("name", "a-user"));
    if linked {
        user = user.depends_on(node_id("z-base"));
    }
    stack.add_resource(user).unwrap();
    stack
        .add_resource(
            ResourceNode::new(node_id("z-base"), ResourceKind::LogGroup)
                .with_desired(DesiredState::new().with("name", "z-base")),
        )
        .unwrap();
    stack
}

/// An edge added without any desired-state change still orders teardown.
#[tokio::test]
async fn new_edge_on_unchanged_nodes_orders_destroy() {
    let harness = TestHarness::new();
    harness.apply(&mut pair(false)).await;

    let report = harness.apply(&mut pair(true)).await;
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.node("a-user").unwrap().action, Some(NodeAction::Unchanged));
    assert_eq!(harness.provider.calls(&node_id("a-user")).update, 0);

    let report = harness.destroy().await;

    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.deleted, vec![node_id("a-user"), node_id("z-base")]);
}

/// A failed delete leaves the node's dependencies in place.
#[tokio::test]
async fn failed_delete_blocks_dependencies() {
    let harness = TestHarness::new();
    harness.apply(&mut StackFactory::web("hunter2")).await;
    harness
        .provider
        .fail_always(&node_id("app-service"), ProviderError::permanent("ResourceInUse"));

    let report = harness.destroy().await;

    assert!(report.failed.contains_key(&node_id("app-service")));
    assert!(report.blocked.contains(&node_id("app-tg")));
    assert!(report.blocked.contains(&node_id("db-secret")));
    assert!(report.deleted.contains(&node_id("www")));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(harness.state.len().unwrap(), 3);
}

/// A cancelled destroy skips everything it has not reached.
#[tokio::test]
async fn cancelled_destroy_skips_remaining_nodes() {
    let harness = TestHarness::new();
    harness.apply(&mut StackFactory::chain(&["a", "b"])).await;
    let token = CancellationToken::new();
    token.cancel();

    let report = harness.scheduler().destroy(&token).await.unwrap();

    assert_eq!(report.skipped, vec![node_id("b"), node_id("a")]);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(harness.state.len().unwrap(), 2);
}
