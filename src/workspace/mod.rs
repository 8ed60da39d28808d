//! Sprint workspace layout and recovery pointers
//!
//! Every sprint of a run owns `sprint_NNN/` under the run root:
//! `generated_artifacts/`, `logs/`, `metadata.json` and `metrics.json`.
//! Code flows between sprints only by copying the previous sprint's
//! `generated_artifacts/` into the current one; a finished sprint is never
//! written again.

mod metadata;

pub use metadata::{write_json_atomic, SprintError, SprintMetadata, SprintStatus};

use crate::error::WorkspaceError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ARTIFACTS_DIR: &str = "generated_artifacts";
pub const LOGS_DIR: &str = "logs";
pub const METADATA_FILE: &str = "metadata.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const FINAL_LINK: &str = "final";

/// Paths of one sprint's workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SprintPaths {
    pub sprint_number: u32,
    pub root: PathBuf,
    pub artifacts: PathBuf,
    pub logs: PathBuf,
    pub metadata: PathBuf,
    pub metrics: PathBuf,
}

impl SprintPaths {
    pub fn new(run_dir: &Path, sprint_number: u32) -> Self {
        let root = sprint_dir(run_dir, sprint_number);
        Self {
            sprint_number,
            artifacts: root.join(ARTIFACTS_DIR),
            logs: root.join(LOGS_DIR),
            metadata: root.join(METADATA_FILE),
            metrics: root.join(METRICS_FILE),
            root,
        }
    }
}

pub fn sprint_dir_name(sprint_number: u32) -> String {
    format!("sprint_{:03}", sprint_number)
}

pub fn sprint_dir(run_dir: &Path, sprint_number: u32) -> PathBuf {
    run_dir.join(sprint_dir_name(sprint_number))
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Create the sprint directory tree. An existing sprint directory is left untouched.
pub fn create_sprint_workspace(
    run_dir: &Path,
    sprint_number: u32,
) -> Result<SprintPaths, WorkspaceError> {
    let paths = SprintPaths::new(run_dir, sprint_number);
    if paths.root.exists() {
        debug!("Sprint workspace {} already exists", paths.root.display());
        return Ok(paths);
    }

    fs::create_dir_all(&paths.artifacts).map_err(io_err(&paths.artifacts))?;
    fs::create_dir_all(&paths.logs).map_err(io_err(&paths.logs))?;
    fs::write(&paths.metadata, "{}\n").map_err(io_err(&paths.metadata))?;
    fs::write(&paths.metrics, "{}\n").map_err(io_err(&paths.metrics))?;

    debug!("Created sprint workspace {}", paths.root.display());
    Ok(paths)
}

/// The previous sprint's `generated_artifacts/`, or `None` for the first sprint
pub fn previous_sprint_artifacts(run_dir: &Path, sprint_number: u32) -> Option<PathBuf> {
    if sprint_number <= 1 {
        return None;
    }
    Some(sprint_dir(run_dir, sprint_number - 1).join(ARTIFACTS_DIR))
}

/// Point `<run_dir>/final` at the given sprint, replacing any previous link
pub fn create_final_symlink(
    run_dir: &Path,
    sprint_number: u32,
) -> Result<PathBuf, WorkspaceError> {
    let target = sprint_dir(run_dir, sprint_number);
    if !target.is_dir() {
        return Err(WorkspaceError::MissingSprint(target));
    }

    let link = run_dir.join(FINAL_LINK);
    if let Ok(meta) = fs::symlink_metadata(&link) {
        if meta.is_dir() && !meta.file_type().is_symlink() {
            fs::remove_dir_all(&link).map_err(io_err(&link))?;
        } else {
            fs::remove_file(&link).map_err(io_err(&link))?;
        }
    }

    // Relative target keeps the link valid when the run directory moves
    let relative = PathBuf::from(sprint_dir_name(sprint_number));
    make_dir_link(&relative, &link).map_err(io_err(&link))?;

    debug!("final -> {}", relative.display());
    Ok(link)
}

#[cfg(unix)]
fn make_dir_link(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_dir_link(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Copy the previous sprint's artifacts into the current sprint's artifact directory
pub fn seed_artifacts(from: &Path, to: &Path) -> Result<u64, WorkspaceError> {
    if !from.is_dir() {
        return Ok(0);
    }
    fs::create_dir_all(to).map_err(io_err(to))?;
    copy_tree(from, to)
}

fn copy_tree(from: &Path, to: &Path) -> Result<u64, WorkspaceError> {
    let mut copied = 0;
    for entry in fs::read_dir(from).map_err(io_err(from))? {
        let entry = entry.map_err(io_err(from))?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let file_type = entry.file_type().map_err(io_err(&src))?;

        if file_type.is_dir() {
            fs::create_dir_all(&dst).map_err(io_err(&dst))?;
            copied += copy_tree(&src, &dst)?;
        } else if file_type.is_file() {
            fs::copy(&src, &dst).map_err(io_err(&dst))?;
            copied += 1;
        }
        // symlinks produced by tools are not carried forward
    }
    Ok(copied)
}
