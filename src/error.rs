use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// How the runner must react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Abort before or during the run; never retried
    Fatal,
    /// Retried with bounded exponential backoff
    Retryable,
    /// Step exceeded its deadline; fails the sprint without retry
    Timeout,
    /// Archive hash mismatch
    Integrity,
    /// Recorded and retried on a later pass, never aborts anything
    Advisory,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Fatal => write!(f, "fatal"),
            ErrorKind::Retryable => write!(f, "retryable"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Integrity => write!(f, "integrity"),
            ErrorKind::Advisory => write!(f, "advisory"),
        }
    }
}

/// Errors that know how they should be handled
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Unknown framework '{0}'")]
    UnknownFramework(String),

    #[error("Framework '{0}' has no pinned commit")]
    MissingCommit(String),

    #[error("No steps enabled")]
    NoStepsEnabled,

    #[error("HITL specification file '{0}' not found")]
    MissingHitlFile(PathBuf),

    #[error("HITL specification file '{0}' is empty")]
    EmptyHitlFile(PathBuf),

    #[error("Failed to read prompt for step '{step}' ({path}): {source}")]
    ReadPrompt {
        step: String,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Environment variable '{0}' is not set")]
    MissingEnv(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checked-out commit '{actual}' does not match pinned commit '{expected}'")]
    CommitMismatch { expected: String, actual: String },

    #[error("Runtime setup failed: {0}")]
    Setup(String),

    #[error("Step timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Process failed with exit code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Adapter used before start()")]
    NotStarted,
}

impl Classify for AdapterError {
    fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Config(_)
            | AdapterError::CommitMismatch { .. }
            | AdapterError::Setup(_)
            | AdapterError::NotStarted => ErrorKind::Fatal,
            AdapterError::Timeout(_) => ErrorKind::Timeout,
            AdapterError::Transient(_)
            | AdapterError::NonZeroExit { .. }
            | AdapterError::Http(_)
            | AdapterError::Io(_) => ErrorKind::Retryable,
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Workspace IO error at '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Sprint directory '{0}' does not exist")]
    MissingSprint(PathBuf),
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Integrity failure for '{path}': expected sha256 {expected}, found {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl Classify for ArchiveError {
    fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::Integrity { .. } => ErrorKind::Integrity,
            _ => ErrorKind::Fatal,
        }
    }
}

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("Usage API key variable '{0}' is not set")]
    MissingKey(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Usage API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Run '{0}' not found")]
    RunNotFound(String),

    #[error("Step {0} has no recorded time window")]
    MissingWindow(u32),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Classify for UsageError {
    fn kind(&self) -> ErrorKind {
        match self {
            UsageError::MissingKey(_) => ErrorKind::Fatal,
            _ => ErrorKind::Advisory,
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum StatsError {
    #[error("Cannot compute statistics on an empty sample")]
    EmptySample,

    #[error("Confidence level must be in (0, 1), got {0}")]
    InvalidLevel(f64),
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),
}

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to create output directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Failed to write report: {0}")]
    WriteReport(std::io::Error),

    #[error("Failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
