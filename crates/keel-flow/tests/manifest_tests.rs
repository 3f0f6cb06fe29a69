//! Tests that drive the scheduler from the JSON manifest in `demos/`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use keel_flow::error::Error;
use keel_flow::manifest::Manifest;
use keel_test_utils::{TestHarness, assert_all_applied, node_id};

fn demo_manifest() -> Manifest {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/web.json");
    Manifest::load(path).unwrap()
}

fn password(var: &str) -> Option<String> {
    (var == "DB_PASSWORD").then(|| "s3cret".to_string())
}

/// The demo manifest applies end to end and resolves its exports.
#[tokio::test]
async fn demo_manifest_applies() {
    let harness = TestHarness::new();
    let mut stack = demo_manifest().build_with(password).unwrap();

    let report = harness.apply(&mut stack).await;

    assert_all_applied(&report);
    assert_eq!(report.stack, "web");
    assert_eq!(report.exports["url"], json!("https://www.example.com/"));
    assert_eq!(report.exports["loadBalancer"], json!("app-lb.elb.sim.internal"));
    assert_eq!(report.exports["owner"], json!("platform"));

    let lb_id = report.node("app-lb").unwrap().physical_id.clone().unwrap();
    let lb = harness.provider.resource(&lb_id).unwrap();
    assert_eq!(lb.desired["tags"]["team"], json!("platform"));
}

/// Listener rules in the manifest become an evaluable routing table.
#[test]
fn demo_manifest_routes_hosts() {
    let stack = demo_manifest().build_with(password).unwrap();
    let table = stack.routing_table().unwrap();

    assert_eq!(table.len(), 2);
    let admin = table.evaluate("admin.example.com").unwrap().unwrap();
    assert_eq!(admin.priority, 200);
    assert_eq!(admin.target, node_id("admin-tg"));
    let www = table.evaluate("WWW.Example.com.").unwrap().unwrap();
    assert_eq!(www.target, node_id("web-tg"));
    assert!(table.evaluate("other.example.com").unwrap().is_none());
}

/// A missing secret variable names the variable.
#[test]
fn missing_secret_variable_is_reported() {
    let err = demo_manifest().build_with(|_| None).unwrap_err();

    assert!(matches!(err, Error::Manifest { .. }));
    assert!(err.to_string().contains("DB_PASSWORD"));
}

/// Re-applying the manifest after applying it changes nothing.
#[tokio::test]
async fn demo_manifest_reapply_is_idempotent() {
    let harness = TestHarness::new();
    harness
        .apply(&mut demo_manifest().build_with(password).unwrap())
        .await;
    let calls = harness.provider.total_calls();

    let plan = harness
        .plan(&mut demo_manifest().build_with(password).unwrap())
        .await;
    assert!(plan.is_empty());
    let report = harness
        .apply(&mut demo_manifest().build_with(password).unwrap())
        .await;

    assert_all_applied(&report);
    assert_eq!(harness.provider.total_calls(), calls);
}

/// Gates that would poll without pause are rejected before any provider
/// call, whether declared on the node or as the stack default.
#[tokio::test]
async fn zero_poll_interval_fails_validation() {
    let per_node = json!({
        "name": "gated",
        "resources": [{
            "id": "cert-validation",
            "type": "certificate_validation",
            "gate": {"pollInterval": "0s", "deadline": "45m"}
        }]
    });
    let stack_default = json!({
        "name": "gated",
        "defaultGate": {"pollInterval": "1m", "deadline": "10s"},
        "resources": [{"id": "cert-validation", "type": "certificate_validation"}]
    });

    for manifest in [per_node, stack_default] {
        let harness = TestHarness::new();
        let mut stack = Manifest::from_json(&manifest.to_string())
            .unwrap()
            .build_with(|_| None)
            .unwrap();

        let err = harness
            .scheduler()
            .apply(&mut stack, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_validation(), "{err}");
        assert!(err.to_string().contains("cert-validation"), "{err}");
        assert_eq!(harness.provider.total_calls(), 0);
    }
}
