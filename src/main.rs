use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

mod adapter;
mod archive;
mod cli;
mod config;
mod error;
mod manifest;
mod metrics;
mod output;
mod runner;
mod stats;
mod usage;
mod workspace;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise --verbose selects debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("sprintbench=debug")
        } else {
            EnvFilter::new("sprintbench=info")
        }
    });

    fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Run(args) => cli::run::execute(args).await,
        Commands::Bench(args) => cli::bench::execute(args).await,
        Commands::Reconcile(args) => cli::reconcile::execute(args).await,
        Commands::Verify(args) => cli::verify::execute(args),
        Commands::Converge(args) => cli::converge::execute(args),
        Commands::Compare(args) => cli::compare::execute(args),
        Commands::Manifest(command) => cli::manifest::execute(command),
        Commands::Schema(args) => cli::schema::execute(args),
    }
}
