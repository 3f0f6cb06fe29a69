//! Command tests: plan, apply and destroy share a state file between runs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::{Path, PathBuf};

use keel_cli::commands::{apply, destroy, plan};
use keel_cli::workspace::StateFile;
use keel_cli::{Config, OutputFormat};

const MANIFEST: &str = r#"{
  "name": "logs",
  "resources": [
    { "id": "key", "type": "iam_policy", "properties": { "name": "logs-writer" } },
    { "id": "logs", "type": "log_group",
      "properties": { "name": "app", "policyArn": "${key.arn}" } }
  ],
  "exports": { "group": "${logs.name}" }
}"#;

fn setup(dir: &Path, manifest: &str) -> (PathBuf, Config) {
    let manifest_path = dir.join("stack.json");
    std::fs::write(&manifest_path, manifest).unwrap();
    let config = Config {
        state_path: dir.join("state/keel.json"),
        format: OutputFormat::Json,
    };
    (manifest_path, config)
}

/// Apply persists state, a second plan is empty and destroy clears it.
#[tokio::test]
async fn apply_then_destroy_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (manifest, config) = setup(dir.path(), MANIFEST);

    let code = apply::execute(
        apply::ApplyArgs {
            manifest: manifest.clone(),
            max_concurrency: None,
        },
        &config,
    )
    .await
    .unwrap();
    assert_eq!(code, 0);

    let state = StateFile::load(&config.state_path).unwrap();
    assert_eq!(state.records.len(), 2);
    assert_eq!(state.provider.resources.len(), 2);

    let code = plan::execute(
        plan::PlanArgs {
            manifest,
            all: false,
        },
        &config,
    )
    .await
    .unwrap();
    assert_eq!(code, 0);

    let code = destroy::execute(destroy::DestroyArgs { dry_run: false }, &config)
        .await
        .unwrap();
    assert_eq!(code, 0);
    let state = StateFile::load(&config.state_path).unwrap();
    assert!(state.records.is_empty());
    assert!(state.provider.resources.is_empty());
}

/// A cyclic manifest fails planning.
#[tokio::test]
async fn plan_rejects_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let (manifest, config) = setup(
        dir.path(),
        r#"{
          "name": "cyclic",
          "resources": [
            { "id": "a", "type": "log_group", "dependsOn": ["b"] },
            { "id": "b", "type": "log_group", "dependsOn": ["a"] }
          ]
        }"#,
    );

    let err = plan::execute(
        plan::PlanArgs {
            manifest,
            all: true,
        },
        &config,
    )
    .await
    .unwrap_err();

    let message = format!("{err:#}");
    assert!(message.contains("cycle detected"), "{message}");
    assert!(!config.state_path.exists());
}

/// A dry-run destroy deletes nothing.
#[tokio::test]
async fn destroy_dry_run_keeps_state() {
    let dir = tempfile::tempdir().unwrap();
    let (manifest, config) = setup(dir.path(), MANIFEST);
    apply::execute(
        apply::ApplyArgs {
            manifest,
            max_concurrency: Some(1),
        },
        &config,
    )
    .await
    .unwrap();

    let code = destroy::execute(destroy::DestroyArgs { dry_run: true }, &config)
        .await
        .unwrap();

    assert_eq!(code, 0);
    assert_eq!(StateFile::load(&config.state_path).unwrap().records.len(), 2);
}
