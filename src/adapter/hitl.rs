use crate::error::{AdapterError, ConfigError};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Answers every clarification request with the same pre-loaded text
#[derive(Debug, Clone)]
pub struct HitlResponder {
    answer: String,
    source: PathBuf,
}

impl HitlResponder {
    /// A missing or empty file is a configuration error, never a silent default
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let answer = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::MissingHitlFile(path.to_path_buf()));
            }
            Err(e) => {
                return Err(ConfigError::ReadFile {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        if answer.trim().is_empty() {
            return Err(ConfigError::EmptyHitlFile(path.to_path_buf()));
        }
        Ok(Self {
            answer: answer.trim().to_string(),
            source: path.to_path_buf(),
        })
    }

    pub fn answer(&self, query: &str) -> String {
        debug!(
            "Answering clarification ({} chars) from {}",
            query.len(),
            self.source.display()
        );
        self.answer.clone()
    }
}

/// Finds clarification requests in tool or model output
#[derive(Debug, Clone)]
pub struct ClarificationDetector {
    pattern: Regex,
}

impl ClarificationDetector {
    pub fn new(pattern: &str) -> Result<Self, AdapterError> {
        let pattern = Regex::new(pattern).map_err(|e| {
            ConfigError::Invalid(format!("clarification pattern '{}': {}", pattern, e))
        })?;
        Ok(Self { pattern })
    }

    /// First clarification request in `output`, if any
    pub fn find<'a>(&self, output: &'a str) -> Option<&'a str> {
        self.pattern.find(output).map(|m| m.as_str())
    }
}
