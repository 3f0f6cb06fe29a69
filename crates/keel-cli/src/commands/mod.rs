//! CLI command implementations.

pub mod apply;
pub mod destroy;
pub mod plan;

use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use keel_flow::config::EngineConfig;
use keel_flow::manifest::Manifest;
use keel_flow::node::NodeStatus;
use keel_flow::stack::Stack;

/// Loads a manifest and builds its stack, reading secret values from the
/// environment.
///
/// # Errors
///
/// Returns an error if the manifest cannot be read, parsed or built.
pub fn load_stack(path: &Path) -> Result<Stack> {
    let manifest = Manifest::load(path)
        .with_context(|| format!("Failed to load manifest: {}", path.display()))?;
    manifest
        .build()
        .with_context(|| format!("Failed to build stack from {}", path.display()))
}

/// Engine settings from `KEEL_*` variables, with an optional concurrency
/// override.
///
/// # Errors
///
/// Returns an error if a variable is malformed.
pub fn engine_config(max_concurrency: Option<usize>) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env().context("Invalid engine configuration")?;
    if let Some(n) = max_concurrency {
        config.max_concurrency = n;
        config.validate().context("Invalid --max-concurrency")?;
    }
    Ok(config)
}

/// Returns a token cancelled on the first Ctrl-C.
#[must_use]
pub fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted: finishing in-flight work, starting nothing new");
            trigger.cancel();
        }
    });
    token
}

fn status_colored(status: NodeStatus) -> String {
    let label = status.as_label();
    match status {
        NodeStatus::Applied => label.green().to_string(),
        NodeStatus::Failed => label.red().to_string(),
        NodeStatus::Applying => label.blue().to_string(),
        NodeStatus::Pending => label.yellow().to_string(),
    }
}
