//! Apply command - materialize a manifest.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::OwoColorize;

use keel_flow::report::{ApplyReport, NodeReport};

use super::{cancel_on_interrupt, engine_config, load_stack, status_colored};
use crate::workspace::Workspace;
use crate::{Config, OutputFormat};

/// Arguments for the apply command.
#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Path to manifest file (JSON).
    #[arg(long, short = 'f')]
    pub manifest: PathBuf,

    /// Maximum node operations in flight (overrides `KEEL_MAX_CONCURRENCY`).
    #[arg(long)]
    pub max_concurrency: Option<usize>,
}

/// Execute the apply command.
///
/// The state file is written even when the apply fails part way, so the
/// next run resumes from what was applied.
///
/// # Errors
///
/// Returns an error if the manifest or state cannot be loaded, the
/// declaration fails validation, or the state file cannot be written.
pub async fn execute(args: ApplyArgs, config: &Config) -> Result<i32> {
    let mut stack = load_stack(&args.manifest)?;
    let engine = engine_config(args.max_concurrency)?;
    let workspace = Workspace::open(&config.state_path)?;
    let cancel = cancel_on_interrupt();

    let outcome = workspace.scheduler(engine).apply(&mut stack, &cancel).await;
    workspace.persist()?;
    let report = outcome.context("Apply failed")?;

    match config.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialize report")?
            );
        }
        OutputFormat::Text => print_text(&report),
        OutputFormat::Table => print_table(&report),
    }

    Ok(report.exit_code())
}

fn describe(node: &NodeReport) -> String {
    if let Some(failure) = &node.failure {
        return failure.to_string();
    }
    if let Some(blocked_by) = &node.blocked_by {
        return format!("waiting on gate of {blocked_by}");
    }
    node.action.map(|a| a.to_string()).unwrap_or_default()
}

fn print_text(report: &ApplyReport) {
    println!("Apply {} of stack {}", report.apply_id, report.stack.bold());
    println!();
    for node in &report.nodes {
        println!(
            "  {} {} ({}) {}",
            status_colored(node.status),
            node.node_id,
            node.kind,
            describe(node)
        );
        if node.attempts > 1 {
            println!("      attempts: {}", node.attempts);
        }
    }

    let orphans = &report.orphans;
    if !orphans.deleted.is_empty() || !orphans.failed.is_empty() {
        println!();
        println!("Removed from declaration:");
        for id in &orphans.deleted {
            println!("  {} {id}", "deleted".green());
        }
        for (id, failure) in &orphans.failed {
            println!("  {} {id}: {failure}", "failed".red());
        }
    }

    if !report.exports.is_empty() {
        println!();
        println!("Exports:");
        for (name, value) in &report.exports {
            let rendered = value
                .as_str()
                .map_or_else(|| value.to_string(), ToString::to_string);
            println!("  {name} = {rendered}");
        }
    }

    println!();
    if report.cancelled {
        println!("{}", "Apply cancelled".yellow());
    }
    let counts: Vec<String> = report
        .status_counts()
        .iter()
        .map(|(status, count)| format!("{count} {status}"))
        .collect();
    let line = format!("Result: {}", counts.join(", "));
    match report.exit_code() {
        0 => println!("{}", line.green()),
        2 => println!("{} (awaiting external confirmation)", line.yellow()),
        _ => println!("{}", line.red()),
    }
}

fn print_table(report: &ApplyReport) {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct NodeRow {
        #[tabled(rename = "Node")]
        node: String,
        #[tabled(rename = "Kind")]
        kind: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Attempts")]
        attempts: u32,
        #[tabled(rename = "Detail")]
        detail: String,
    }

    let rows: Vec<_> = report
        .nodes
        .iter()
        .map(|n| NodeRow {
            node: n.node_id.to_string(),
            kind: n.kind.to_string(),
            status: n.status.to_string(),
            attempts: n.attempts,
            detail: describe(n),
        })
        .collect();
    println!("{}", Table::new(rows));
}
