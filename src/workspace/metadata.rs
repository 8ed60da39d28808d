use crate::error::{ErrorKind, WorkspaceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SprintStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for SprintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SprintStatus::Running => write!(f, "running"),
            SprintStatus::Completed => write!(f, "completed"),
            SprintStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprintError {
    /// `fatal`, `timeout`, `retryable` ...
    pub kind: String,
    pub message: String,
}

impl SprintError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// Contents of `sprint_NNN/metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SprintMetadata {
    pub run_id: String,
    pub framework: String,
    pub sprint_number: u32,
    pub step_id: String,
    pub status: SprintStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SprintError>,
}

impl SprintMetadata {
    pub fn running(run_id: &str, framework: &str, sprint_number: u32, step_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            framework: framework.to_string(),
            sprint_number,
            step_id: step_id.to_string(),
            status: SprintStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            attempts: 0,
            error: None,
        }
    }

    pub fn complete(&mut self, attempts: u32) {
        self.status = SprintStatus::Completed;
        self.ended_at = Some(Utc::now());
        self.attempts = attempts;
        self.error = None;
    }

    pub fn fail(&mut self, attempts: u32, error: SprintError) {
        self.status = SprintStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.attempts = attempts;
        self.error = Some(error);
    }

    pub fn load(path: &Path) -> Result<Self, WorkspaceError> {
        let content = std::fs::read_to_string(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Serialize to a sibling temp file, fsync, then rename over `path`
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), WorkspaceError> {
    let io = |source: std::io::Error| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(io)?;

    let json = serde_json::to_string_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(io)?;
    tmp.write_all(json.as_bytes()).map_err(io)?;
    tmp.write_all(b"\n").map_err(io)?;
    tmp.as_file().sync_all().map_err(io)?;
    tmp.persist(path).map_err(|e| io(e.error))?;
    Ok(())
}
