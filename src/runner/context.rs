use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::{info_span, Span};

/// Identifies where log output of the current call belongs.
///
/// Passed explicitly through the runner instead of living in global state.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub framework: String,
    pub sprint: Option<u32>,
}

impl RunContext {
    pub fn new(run_id: &str, framework: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            framework: framework.to_string(),
            sprint: None,
        }
    }

    pub fn for_sprint(&self, sprint: u32) -> Self {
        Self {
            sprint: Some(sprint),
            ..self.clone()
        }
    }

    pub fn span(&self) -> Span {
        match self.sprint {
            Some(sprint) => info_span!(
                "sprint",
                run_id = %self.run_id,
                framework = %self.framework,
                sprint
            ),
            None => info_span!("run", run_id = %self.run_id, framework = %self.framework),
        }
    }
}

/// Append-only `logs/orchestrator.log` for one sprint
pub struct SprintLog {
    ctx: RunContext,
    file: Option<Mutex<File>>,
}

impl SprintLog {
    pub const FILE_NAME: &'static str = "orchestrator.log";

    pub fn open(ctx: RunContext, logs_dir: &Path) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join(Self::FILE_NAME))
            .map_err(|e| tracing::warn!("Cannot open sprint log in {}: {}", logs_dir.display(), e))
            .ok()
            .map(Mutex::new);
        Self { ctx, file }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Write a line to the sprint log and mirror it to tracing
    pub fn event(&self, level: &str, message: &str) {
        match level {
            "ERROR" => tracing::error!("{}", message),
            "WARN" => tracing::warn!("{}", message),
            _ => tracing::info!("{}", message),
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(
                    file,
                    "{} {:5} [{} {} sprint={}] {}",
                    Utc::now().to_rfc3339(),
                    level,
                    self.ctx.framework,
                    self.ctx.run_id,
                    self.ctx.sprint.unwrap_or(0),
                    message
                );
            }
        }
    }

    pub fn info(&self, message: &str) {
        self.event("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.event("WARN", message);
    }

    pub fn error(&self, message: &str) {
        self.event("ERROR", message);
    }
}
