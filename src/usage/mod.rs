//! Token usage backfill
//!
//! Step execution never knows its token consumption. The provider's usage
//! API reports it 5 to 60 minutes late, so runs are reconciled out of band:
//! each step's `[start, end]` window is queried, the totals are recorded as
//! an attempt, and the run is marked verified once repeated attempts agree.

mod openai;
mod reconciler;

pub use openai::OpenAiUsageClient;
pub use reconciler::{count_stable_attempts, ReconcileOutcome, Reconciler};

use crate::config::Config;
use crate::error::UsageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Aggregate usage over one time window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageWindow {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cached_tokens: u64,
    pub requests: u64,
}

impl UsageWindow {
    pub fn add(&mut self, other: UsageWindow) {
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
        self.cached_tokens += other.cached_tokens;
        self.requests += other.requests;
    }
}

/// Usage for one executed step, joined to it by `(run_id, step_number)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledUsage {
    pub run_id: String,
    pub step_number: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cached_tokens: u64,
}

/// A metering source queried by time window
#[async_trait]
pub trait UsageSource: Send + Sync {
    async fn query(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageWindow, UsageError>;
}

/// Resolves the usage source for a framework name
pub type UsageSourceFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn UsageSource>, UsageError> + Send + Sync>;

/// Build an `OpenAiUsageClient` per framework from its `usage_api_key_env`
pub fn openai_source_factory(config: &Config) -> UsageSourceFactory {
    let config = config.clone();
    Arc::new(move |framework: &str| {
        let key_env = config
            .frameworks
            .get(framework)
            .map(|fw| fw.usage_api_key_env.clone())
            .unwrap_or_else(|| "OPENAI_API_KEY_USAGE_TRACKING".to_string());
        let client =
            OpenAiUsageClient::from_env(&config.reconciliation.usage_api_url, &key_env)?;
        Ok::<Arc<dyn UsageSource>, UsageError>(Arc::new(client))
    })
}
