pub mod bench;
pub mod compare;
pub mod converge;
pub mod manifest;
pub mod reconcile;
pub mod run;
pub mod schema;
pub mod verify;

use crate::config::Config;
use crate::manifest::load_framework_runs;
use crate::metrics::{RunMetrics, RunStatus};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "sprintbench")]
#[command(
    author,
    version,
    about = "Sprint-based benchmark harness for AI coding agents"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose/debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute one full run for a framework
    Run(RunArgs),

    /// Run frameworks until every stopping rule says stop
    Bench(BenchArgs),

    /// Backfill token usage from the provider's usage API
    Reconcile(ReconcileArgs),

    /// Check a run archive against its recorded hash
    Verify(VerifyArgs),

    /// Show the stopping-rule decision per framework
    Converge(ConvergeArgs),

    /// Write the statistical comparison report
    Compare(CompareArgs),

    /// Maintain the run manifest
    #[command(subcommand)]
    Manifest(ManifestCommand),

    /// Print JSON Schema for config validation
    Schema(SchemaArgs),
}

#[derive(Parser, Clone)]
pub struct ConfigArgs {
    /// Path to config file
    #[arg(short, long, default_value = "sprintbench.yaml", env = "SPRINTBENCH_CONFIG")]
    pub config: PathBuf,

    /// Override runs directory
    #[arg(long, env = "SPRINTBENCH_RUNS_DIR")]
    pub runs_dir: Option<PathBuf>,
}

#[derive(Parser, Clone)]
pub struct RunArgs {
    /// Framework to run (a key under `frameworks`)
    pub framework: String,

    #[command(flatten)]
    pub common: ConfigArgs,

    /// Override per-step timeout in seconds
    #[arg(long)]
    pub step_timeout: Option<u64>,
}

#[derive(Parser, Clone)]
pub struct BenchArgs {
    #[command(flatten)]
    pub common: ConfigArgs,

    /// Only schedule these frameworks (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub frameworks: Option<Vec<String>>,

    /// Override per-step timeout in seconds
    #[arg(long)]
    pub step_timeout: Option<u64>,

    /// Give up on a framework after this many failed runs in a row
    #[arg(long, default_value_t = 3)]
    pub max_consecutive_failures: u32,
}

#[derive(Parser, Clone)]
pub struct ReconcileArgs {
    #[command(flatten)]
    pub common: ConfigArgs,

    /// Reconcile a single run (requires --framework)
    #[arg(long, requires = "framework")]
    pub run_id: Option<String>,

    /// Restrict to one framework
    #[arg(long)]
    pub framework: Option<String>,

    /// Discard reconciliation history and query again
    #[arg(long)]
    pub force: bool,

    /// Override minimum run age in minutes
    #[arg(long)]
    pub min_age_minutes: Option<i64>,

    /// Override maximum run age in hours
    #[arg(long)]
    pub max_age_hours: Option<i64>,
}

#[derive(Parser, Clone)]
pub struct VerifyArgs {
    /// Run directory containing metadata.json and run.tar.gz
    pub run_dir: PathBuf,
}

#[derive(Parser, Clone)]
pub struct ConvergeArgs {
    #[command(flatten)]
    pub common: ConfigArgs,

    /// Restrict to one framework
    #[arg(long)]
    pub framework: Option<String>,

    /// Print the reports as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Clone)]
pub struct CompareArgs {
    #[command(flatten)]
    pub common: ConfigArgs,

    /// Directory for comparison.json and comparison.md
    #[arg(short, long, default_value = "reports")]
    pub output: PathBuf,

    /// Frameworks to compare (comma-separated, default all enabled)
    #[arg(long, value_delimiter = ',')]
    pub frameworks: Option<Vec<String>>,

    /// Metrics to compare (comma-separated, default the stopping-rule metrics)
    #[arg(long, value_delimiter = ',')]
    pub metrics: Option<Vec<String>>,

    /// Family-wise significance level
    #[arg(long, default_value_t = 0.05)]
    pub alpha: f64,
}

#[derive(Parser, Clone)]
pub struct SchemaArgs {
    /// Write the schema to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
pub enum ManifestCommand {
    /// Reconstruct manifest.json from the run directories
    Rebuild(ConfigArgs),
}

/// Load and validate the config, applying CLI overrides.
/// Returns the config and the directory its relative paths resolve against.
pub fn load_config(args: &ConfigArgs, step_timeout: Option<u64>) -> anyhow::Result<(Config, PathBuf)> {
    info!("Loading config from {:?}", args.config);
    let mut config = Config::load(&args.config)?;

    if let Some(runs_dir) = &args.runs_dir {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        config.runs_dir = cwd.join(runs_dir);
    }
    if let Some(secs) = step_timeout {
        config.timeouts.step_timeout_sec = secs;
    }

    config.validate()?;

    let base_dir = match args.config.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((config, base_dir))
}

/// Enabled frameworks, optionally narrowed to `only`
pub fn selected_frameworks(config: &Config, only: Option<&[String]>) -> anyhow::Result<Vec<String>> {
    if let Some(names) = only {
        for name in names {
            config.framework(name)?;
        }
    }
    Ok(config
        .frameworks
        .iter()
        .filter(|(name, fw)| fw.enabled && only.map_or(true, |o| o.contains(*name)))
        .map(|(name, _)| name.clone())
        .collect())
}

/// Completed runs for a framework; failed runs never enter the statistics
pub fn completed_runs(runs_dir: &Path, framework: &str) -> Vec<RunMetrics> {
    load_framework_runs(runs_dir, framework)
        .into_iter()
        .filter(|m| m.status == RunStatus::Completed)
        .collect()
}
