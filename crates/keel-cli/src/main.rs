//! Keel CLI - plan, apply and destroy declared stacks.
//!
//! The main entry point for the `keel` CLI binary.

use anyhow::Result;
use clap::Parser;

use keel_cli::{Cli, Commands};
use keel_core::observability::init_logging;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format.into(), "warn");
    let config = cli.config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let exit_code = runtime.block_on(async {
        match cli.command {
            Commands::Plan(args) => keel_cli::commands::plan::execute(args, &config).await,
            Commands::Apply(args) => keel_cli::commands::apply::execute(args, &config).await,
            Commands::Destroy(args) => keel_cli::commands::destroy::execute(args, &config).await,
        }
    })?;

    std::process::exit(exit_code)
}
