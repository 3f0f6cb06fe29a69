//! Destroy command - tear down every recorded resource.

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::OwoColorize;

use keel_flow::report::DestroyReport;

use super::{cancel_on_interrupt, engine_config};
use crate::workspace::Workspace;
use crate::{Config, OutputFormat};

/// Arguments for the destroy command.
#[derive(Debug, Args)]
pub struct DestroyArgs {
    /// List what would be deleted without deleting anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Execute the destroy command.
///
/// # Errors
///
/// Returns an error if the state cannot be loaded or written.
pub async fn execute(args: DestroyArgs, config: &Config) -> Result<i32> {
    let workspace = Workspace::open(&config.state_path)?;

    if args.dry_run {
        let snapshot = workspace.state.snapshot().context("Failed to read state")?;
        if snapshot.is_empty() {
            println!("Nothing to destroy");
        } else {
            println!("Would delete {} resources:", snapshot.len());
            for record in &snapshot {
                println!("  {} {} ({})", "-".red(), record.node_id, record.kind);
            }
        }
        return Ok(0);
    }

    let cancel = cancel_on_interrupt();
    let outcome = workspace
        .scheduler(engine_config(None)?)
        .destroy(&cancel)
        .await;
    workspace.persist()?;
    let report = outcome.context("Destroy failed")?;

    match config.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialize report")?
            );
        }
        OutputFormat::Text | OutputFormat::Table => print_text(&report),
    }

    Ok(report.exit_code())
}

fn print_text(report: &DestroyReport) {
    for id in &report.deleted {
        println!("  {} {id}", "deleted".green());
    }
    for (id, failure) in &report.failed {
        println!("  {} {id}: {failure}", "failed".red());
    }
    for id in &report.blocked {
        println!("  {} {id} (a dependent was not deleted)", "kept".yellow());
    }
    for id in &report.skipped {
        println!("  {} {id}", "skipped".dimmed());
    }
    println!();
    let line = format!(
        "Destroy: {} deleted, {} failed, {} kept, {} skipped",
        report.deleted.len(),
        report.failed.len(),
        report.blocked.len(),
        report.skipped.len()
    );
    if report.is_success() {
        println!("{}", line.green());
    } else {
        println!("{}", line.red());
    }
}
