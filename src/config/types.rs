use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::defaults::*;

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Root directory holding `<framework>/<run_id>/` run directories
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,

    /// Shared per-framework checkouts and runtime environments
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// File whose contents answer every clarification request
    #[serde(default = "default_hitl_file")]
    pub hitl_file: PathBuf,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub health_probe: HealthProbeConfig,

    #[serde(default)]
    pub stopping_rule: StoppingRuleConfig,

    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    #[serde(default)]
    pub steps: Vec<StepConfig>,

    #[serde(default)]
    pub frameworks: BTreeMap<String, FrameworkConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct TimeoutConfig {
    #[serde(default = "default_step_timeout_sec")]
    pub step_timeout_sec: u64,

    /// Time between graceful and forced termination
    #[serde(default = "default_grace_period_sec")]
    pub grace_period_sec: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            step_timeout_sec: default_step_timeout_sec(),
            grace_period_sec: default_grace_period_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct HealthProbeConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,

    #[serde(default = "default_probe_interval_sec")]
    pub interval_sec: u64,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            interval_sec: default_probe_interval_sec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct StoppingRuleConfig {
    #[serde(default = "default_min_runs")]
    pub min_runs: usize,

    #[serde(default = "default_max_runs")]
    pub max_runs: usize,

    /// Maximum CI half-width as a fraction of the metric mean
    #[serde(default = "default_half_width_fraction")]
    pub half_width_fraction: f64,

    #[serde(default = "default_bootstrap_samples")]
    pub bootstrap_samples: usize,

    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,

    /// Aggregate metric names that must all converge
    #[serde(default = "default_tracked_metrics")]
    pub metrics: Vec<String>,
}

impl Default for StoppingRuleConfig {
    fn default() -> Self {
        Self {
            min_runs: default_min_runs(),
            max_runs: default_max_runs(),
            half_width_fraction: default_half_width_fraction(),
            bootstrap_samples: default_bootstrap_samples(),
            confidence_level: default_confidence_level(),
            metrics: default_tracked_metrics(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ReconciliationConfig {
    /// Minimum spacing between two attempts for the later one to count
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: i64,

    /// Stable attempts required before a run is verified
    #[serde(default = "default_stable_threshold")]
    pub stable_threshold: usize,

    #[serde(default = "default_data_unavailable_after_minutes")]
    pub data_unavailable_after_minutes: i64,

    #[serde(default = "default_min_age_minutes")]
    pub min_age_minutes: i64,

    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: i64,

    #[serde(default = "default_usage_api_url")]
    pub usage_api_url: String,

    /// Runs reconciled in parallel by `reconcile --all`
    #[serde(default = "default_reconcile_concurrency")]
    pub concurrency: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            stable_threshold: default_stable_threshold(),
            data_unavailable_after_minutes: default_data_unavailable_after_minutes(),
            min_age_minutes: default_min_age_minutes(),
            max_age_hours: default_max_age_hours(),
            usage_api_url: default_usage_api_url(),
            concurrency: default_reconcile_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct StepConfig {
    pub id: String,

    pub prompt_file: PathBuf,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct FrameworkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Clone source used when the checkout does not exist yet
    #[serde(default)]
    pub repo_url: Option<String>,

    /// Pinned commit; a prefix of the full hash is accepted
    #[serde(default)]
    pub commit: String,

    /// Defaults to `<runtime_dir>/<framework>`
    #[serde(default)]
    pub checkout: Option<PathBuf>,

    /// Shell commands run once inside the checkout after cloning
    #[serde(default)]
    pub setup_commands: Vec<String>,

    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_usage_api_key_env")]
    pub usage_api_key_env: String,

    #[serde(flatten)]
    pub adapter: AdapterSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSettings {
    Server(ServerSettings),
    Cli(CliSettings),
    Pipeline(PipelineSettings),
}

impl AdapterSettings {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AdapterSettings::Server(_) => "server",
            AdapterSettings::Cli(_) => "cli",
            AdapterSettings::Pipeline(_) => "pipeline",
        }
    }
}

/// Long-lived API + UI server pair driven over HTTP
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ServerSettings {
    /// Program and arguments launching the API server, run inside the checkout
    pub api_command: Vec<String>,

    #[serde(default)]
    pub ui_command: Option<Vec<String>>,

    pub api_url: String,

    #[serde(default)]
    pub ui_url: Option<String>,

    #[serde(default = "default_startup_timeout_sec")]
    pub startup_timeout_sec: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// CLI tool executed as a subprocess inside its runtime environment
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct CliSettings {
    /// Executable, resolved relative to the checkout when not absolute
    pub binary: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Directory (relative to the checkout) prepended to PATH, e.g. `.venv/bin`
    #[serde(default)]
    pub runtime_bin_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default = "default_clarification_pattern")]
    pub clarification_pattern: String,

    #[serde(default = "default_max_hitl_rounds")]
    pub max_hitl_rounds: u32,
}

/// Stateless specify/plan/tasks/implement pipeline against a chat-completions API
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct PipelineSettings {
    #[serde(default = "default_llm_api_url")]
    pub api_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Directory (relative to the checkout) holding `<phase>.md` phase templates
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub enable_bugfix: bool,

    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,

    #[serde(default = "default_clarification_pattern")]
    pub clarification_pattern: String,

    #[serde(default = "default_max_hitl_rounds")]
    pub max_hitl_rounds: u32,
}
