//! Plan command - show the graph and what an apply would change.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::OwoColorize;

use keel_flow::graph::EdgeKind;
use keel_flow::plan::{Plan, PlanAction};

use super::{engine_config, load_stack};
use crate::workspace::Workspace;
use crate::{Config, OutputFormat};

/// Arguments for the plan command.
#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Path to manifest file (JSON).
    #[arg(long, short = 'f')]
    pub manifest: PathBuf,

    /// Also list nodes without changes.
    #[arg(long, short = 'a')]
    pub all: bool,
}

/// Execute the plan command.
///
/// Returns the process exit code. Planning never writes the state file.
///
/// # Errors
///
/// Returns an error if the manifest or state cannot be loaded, or the
/// declaration fails validation.
pub async fn execute(args: PlanArgs, config: &Config) -> Result<i32> {
    let mut stack = load_stack(&args.manifest)?;
    let workspace = Workspace::open(&config.state_path)?;
    let plan = workspace
        .scheduler(engine_config(None)?)
        .plan(&mut stack)
        .await
        .context("Plan failed")?;
    let routing = stack.routing_table().context("Invalid routing rules")?;

    match config.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&plan).context("Failed to serialize plan")?
            );
        }
        OutputFormat::Text => {
            print_graph(&plan);
            println!();
            print_changes(&plan, args.all);
            if !routing.is_empty() {
                println!();
                println!("Routing rules:");
                for rule in routing.rules() {
                    println!(
                        "  {:>5}  {} -> {}",
                        rule.priority,
                        rule.host_patterns.join(", "),
                        rule.target
                    );
                }
            }
            println!();
            print_summary(&plan);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct ChangeRow {
                #[tabled(rename = "Node")]
                node: String,
                #[tabled(rename = "Kind")]
                kind: String,
                #[tabled(rename = "Action")]
                action: String,
                #[tabled(rename = "Depends On")]
                depends_on: String,
            }

            let rows: Vec<_> = plan
                .changes
                .iter()
                .filter(|c| args.all || c.action.is_change())
                .map(|c| ChangeRow {
                    node: c.node_id.to_string(),
                    kind: c.kind.to_string(),
                    action: c.action.to_string(),
                    depends_on: c
                        .dependencies
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                })
                .collect();

            if rows.is_empty() {
                println!("No changes");
            } else {
                println!("{}", Table::new(rows));
            }
        }
    }

    Ok(0)
}

fn print_graph(plan: &Plan) {
    println!("Stack: {}", plan.stack.bold());
    println!("Graph:");
    for change in plan.changes.iter().filter(|c| c.action != PlanAction::Delete) {
        let edges: Vec<String> = plan
            .edges
            .iter()
            .filter(|e| e.to == change.node_id)
            .map(|e| match e.kind {
                EdgeKind::Explicit => format!("{}*", e.from),
                EdgeKind::Implicit => e.from.to_string(),
            })
            .collect();
        if edges.is_empty() {
            println!("  {}", change.node_id);
        } else {
            println!("  {} <- {}", change.node_id, edges.join(", "));
        }
    }
}

fn print_changes(plan: &Plan, all: bool) {
    println!("Changes:");
    let mut shown = 0;
    for change in plan.changes.iter().filter(|c| all || c.action.is_change()) {
        shown += 1;
        let marker = action_marker(&change.action);
        println!("  {marker} {} ({}) {}", change.node_id, change.kind, change.action);
    }
    if shown == 0 {
        println!("  No changes");
    }
}

fn print_summary(plan: &Plan) {
    let summary = plan.summary();
    let parts: Vec<String> = summary
        .iter()
        .map(|(label, count)| format!("{count} {label}"))
        .collect();
    println!("Plan: {}", parts.join(", "));
}

fn action_marker(action: &PlanAction) -> String {
    match action {
        PlanAction::Create => "+".green().to_string(),
        PlanAction::Update { .. } | PlanAction::ResumeGate => "~".yellow().to_string(),
        PlanAction::Delete => "-".red().to_string(),
        PlanAction::Deferred { .. } => "?".dimmed().to_string(),
        PlanAction::NoChange => "=".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_plan_args_parsing() {
        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            args: PlanArgs,
        }

        let cli = TestCli::parse_from(["test", "-f", "stack.json", "--all"]);
        assert_eq!(cli.args.manifest, PathBuf::from("stack.json"));
        assert!(cli.args.all);
    }

    #[test]
    fn markers_distinguish_actions() {
        assert!(action_marker(&PlanAction::Create).contains('+'));
        assert!(action_marker(&PlanAction::Delete).contains('-'));
        assert_eq!(action_marker(&PlanAction::NoChange), "=");
    }
}
