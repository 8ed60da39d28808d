mod defaults;
mod types;

pub use types::*;

use crate::error::ConfigError;
use defaults::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            runs_dir: default_runs_dir(),
            runtime_dir: default_runtime_dir(),
            hitl_file: default_hitl_file(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            health_probe: HealthProbeConfig::default(),
            stopping_rule: StoppingRuleConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            steps: Vec::new(),
            frameworks: BTreeMap::new(),
        }
    }
}

/// A step resolved for execution: its sprint number and loaded instruction
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub sprint_number: u32,
    pub id: String,
    pub instruction: String,
}

impl Config {
    /// Load config from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Validate the config
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.steps.iter().any(|s| s.enabled) {
            return Err(ConfigError::NoStepsEnabled);
        }

        for (name, framework) in &self.frameworks {
            if framework.commit.trim().is_empty() {
                return Err(ConfigError::MissingCommit(name.clone()));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }

        let rule = &self.stopping_rule;
        if rule.min_runs > rule.max_runs {
            return Err(ConfigError::Invalid(format!(
                "stopping_rule.min_runs ({}) exceeds max_runs ({})",
                rule.min_runs, rule.max_runs
            )));
        }
        if !(rule.confidence_level > 0.0 && rule.confidence_level < 1.0) {
            return Err(ConfigError::Invalid(
                "stopping_rule.confidence_level must be in (0, 1)".to_string(),
            ));
        }

        Ok(())
    }

    pub fn framework(&self, name: &str) -> Result<&FrameworkConfig, ConfigError> {
        self.frameworks
            .get(name)
            .ok_or_else(|| ConfigError::UnknownFramework(name.to_string()))
    }

    /// Checkout directory for a framework, shared by all of its runs
    pub fn checkout_dir(&self, name: &str, framework: &FrameworkConfig) -> PathBuf {
        framework
            .checkout
            .clone()
            .unwrap_or_else(|| self.runtime_dir.join(name))
    }

    /// Enabled steps in configured order with their prompt text loaded
    pub fn resolve_steps(&self, base: &Path) -> Result<Vec<ResolvedStep>, ConfigError> {
        let mut resolved = Vec::new();
        for step in self.steps.iter().filter(|s| s.enabled) {
            let path = if step.prompt_file.is_absolute() {
                step.prompt_file.clone()
            } else {
                base.join(&step.prompt_file)
            };
            let instruction =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadPrompt {
                    step: step.id.clone(),
                    path: path.clone(),
                    source: e,
                })?;
            resolved.push(ResolvedStep {
                sprint_number: resolved.len() as u32 + 1,
                id: step.id.clone(),
                instruction,
            });
        }
        if resolved.is_empty() {
            return Err(ConfigError::NoStepsEnabled);
        }
        Ok(resolved)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.step_timeout_sec)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.timeouts.grace_period_sec)
    }
}
