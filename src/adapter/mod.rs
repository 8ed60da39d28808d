//! Drivers for benchmarked tools
//!
//! Every tool is driven through the same five operations so the runner never
//! needs to know which tool it is talking to.

mod cli;
mod hitl;
mod pipeline;
mod process;
mod runtime;
mod server;

pub use cli::CliAdapter;
pub use hitl::{ClarificationDetector, HitlResponder};
pub use pipeline::PipelineAdapter;
pub use process::{run_supervised, ProcessOutput};
pub use runtime::{commits_match, prepare_runtime, verify_commit};
pub use server::ServerAdapter;

use crate::config::{AdapterSettings, FrameworkConfig};
use crate::error::AdapterError;
use crate::workspace::SprintPaths;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// What a step reports at the moment it finishes. Token usage is not known
/// yet; it arrives later as a `ReconciledUsage` for the same step.
#[derive(Debug, Clone, PartialEq)]
pub struct ImmediateStepResult {
    pub success: bool,
    pub duration_seconds: f64,
    pub hitl_count: u32,
    pub api_calls: u64,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
}

/// Per-call deadline handed down to whatever the adapter blocks on
#[derive(Debug, Clone, Copy)]
pub struct StepDeadline {
    timeout: Duration,
    grace: Duration,
    expires_at: Instant,
}

impl StepDeadline {
    pub fn new(timeout: Duration, grace: Duration) -> Self {
        Self {
            timeout,
            grace,
            expires_at: Instant::now() + timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait between graceful and forced termination
    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Everything an adapter instance is bound to for one sprint
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: String,
    pub framework: String,
    pub config: FrameworkConfig,
    pub checkout: PathBuf,
    pub hitl_file: PathBuf,
    pub sprint: SprintPaths,
    pub previous_artifacts: Option<PathBuf>,
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    /// Provision the pinned checkout and runtime; fails on commit mismatch
    async fn start(&self) -> Result<(), AdapterError>;

    async fn execute_step(
        &self,
        step_number: u32,
        instruction: &str,
        deadline: &StepDeadline,
    ) -> Result<ImmediateStepResult, AdapterError>;

    /// Liveness probe. Returns false instead of failing while the tool warms up.
    async fn health_check(&self) -> bool;

    fn handle_hitl(&self, query: &str) -> String;

    /// Release processes and connections. The workspace is left in place.
    async fn stop(&self) -> Result<(), AdapterError>;
}

pub type AdapterFactory =
    Arc<dyn Fn(AdapterContext) -> Result<Arc<dyn Adapter>, AdapterError> + Send + Sync>;

/// Create the adapter matching the framework's configured kind
pub fn create_adapter(ctx: AdapterContext) -> Result<Arc<dyn Adapter>, AdapterError> {
    match ctx.config.adapter.clone() {
        AdapterSettings::Server(settings) => Ok(Arc::new(ServerAdapter::new(ctx, settings)?)),
        AdapterSettings::Cli(settings) => Ok(Arc::new(CliAdapter::new(ctx, settings)?)),
        AdapterSettings::Pipeline(settings) => Ok(Arc::new(PipelineAdapter::new(ctx, settings)?)),
    }
}

pub fn default_factory() -> AdapterFactory {
    Arc::new(create_adapter)
}
