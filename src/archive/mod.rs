//! Run snapshots
//!
//! A finished run is packed into `run.tar.gz` with a fixed internal layout:
//!
//! - `workspace/...` the run directory (sprints, `final` link, `commit.txt`)
//! - `metrics.json` the run-level metrics
//! - `logs/...` every log file, keyed by its path under the run directory
//!
//! The SHA-256 of the archive goes into the run's `metadata.json`; a later
//! mismatch is an integrity failure.

use crate::error::ArchiveError;
use crate::metrics::RunStatus;
use crate::workspace::write_json_atomic;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, HeaderMode};
use tracing::{debug, error, info};

pub const ARCHIVE_FILE: &str = "run.tar.gz";
pub const RUN_METADATA_FILE: &str = "metadata.json";

const HASH_CHUNK: usize = 64 * 1024;
const WORKSPACE_PREFIX: &str = "workspace";
const LOGS_PREFIX: &str = "logs";

/// How a run ended, recorded next to the archive hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_sprint: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Contents of `<run_dir>/metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    pub run_id: String,
    pub framework: String,
    pub commit: String,
    pub archive_file: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

impl ArchiveMetadata {
    pub fn load(run_dir: &Path) -> Result<Self, ArchiveError> {
        let content = fs::read_to_string(run_dir.join(RUN_METADATA_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn archive_path(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(&self.archive_file)
    }
}

/// Build `output` from the workspace tree, the metrics file and the log files.
///
/// Entries are written in sorted order with deterministic headers, so the
/// same inputs always produce the same bytes. Symlinks are stored as links.
/// The output file, the run-level metadata and anything passed as metrics or
/// logs are excluded from the `workspace/` walk.
pub fn create_archive(
    output: &Path,
    workspace_dir: &Path,
    metrics_file: &Path,
    log_files: &[PathBuf],
) -> Result<PathBuf, ArchiveError> {
    let mut excluded: BTreeSet<PathBuf> = log_files.iter().cloned().collect();
    excluded.insert(output.to_path_buf());
    excluded.insert(metrics_file.to_path_buf());
    excluded.insert(workspace_dir.join(RUN_METADATA_FILE));

    let file = File::create(output)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut tar = Builder::new(encoder);
    tar.mode(HeaderMode::Deterministic);
    tar.follow_symlinks(false);

    tar.append_dir(WORKSPACE_PREFIX, workspace_dir)?;
    append_tree(
        &mut tar,
        workspace_dir,
        Path::new(WORKSPACE_PREFIX),
        &excluded,
    )?;

    if metrics_file.is_file() {
        tar.append_path_with_name(metrics_file, "metrics.json")?;
    }

    let mut logs: Vec<(PathBuf, &PathBuf)> = log_files
        .iter()
        .filter(|path| path.is_file())
        .map(|path| (log_entry_name(workspace_dir, path), path))
        .collect();
    logs.sort();
    for (name, path) in logs {
        tar.append_path_with_name(path, name)?;
    }

    let encoder = tar.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;

    info!("Created archive {}", output.display());
    Ok(output.to_path_buf())
}

fn log_entry_name(workspace_dir: &Path, path: &Path) -> PathBuf {
    let relative = path
        .strip_prefix(workspace_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| PathBuf::from(path.file_name().unwrap_or(path.as_os_str())));
    Path::new(LOGS_PREFIX).join(relative)
}

fn append_tree<W: Write>(
    tar: &mut Builder<W>,
    dir: &Path,
    prefix: &Path,
    excluded: &BTreeSet<PathBuf>,
) -> Result<(), ArchiveError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    entries.sort();

    for path in entries {
        if excluded.contains(&path) {
            debug!("Archive skips {}", path.display());
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        let entry_name = prefix.join(name);
        let meta = fs::symlink_metadata(&path)?;

        if meta.file_type().is_symlink() || meta.is_file() {
            tar.append_path_with_name(&path, &entry_name)?;
        } else if meta.is_dir() {
            tar.append_dir(&entry_name, &path)?;
            append_tree(tar, &path, &entry_name, excluded)?;
        }
    }
    Ok(())
}

/// SHA-256 of a file as lowercase hex, read in fixed-size chunks
pub fn compute_hash(path: &Path) -> Result<String, ArchiveError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash the archive and persist `metadata.json` beside it
pub fn create_metadata(
    run_dir: &Path,
    run_id: &str,
    framework: &str,
    commit: &str,
    archive: &Path,
    outcome: RunOutcome,
) -> Result<ArchiveMetadata, ArchiveError> {
    let sha256 = compute_hash(archive)?;
    let size_bytes = fs::metadata(archive)?.len();
    let archive_file = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ARCHIVE_FILE.to_string());

    let metadata = ArchiveMetadata {
        run_id: run_id.to_string(),
        framework: framework.to_string(),
        commit: commit.to_string(),
        archive_file,
        sha256,
        size_bytes,
        created_at: Utc::now(),
        outcome,
    };

    write_json_atomic(&run_dir.join(RUN_METADATA_FILE), &metadata)?;
    Ok(metadata)
}

/// Recompute and compare. A mismatch is logged as an integrity failure.
pub fn verify_archive(path: &Path, expected: &str) -> Result<bool, ArchiveError> {
    let actual = compute_hash(path)?;
    let ok = actual.eq_ignore_ascii_case(expected);
    if !ok {
        error!(
            "INTEGRITY FAILURE: {} expected sha256 {}, found {}",
            path.display(),
            expected,
            actual
        );
    }
    Ok(ok)
}

/// Like [`verify_archive`], but a mismatch becomes `ArchiveError::Integrity`
pub fn verify_or_fail(path: &Path, expected: &str) -> Result<(), ArchiveError> {
    let actual = compute_hash(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        error!("INTEGRITY FAILURE: {}", path.display());
        Err(ArchiveError::Integrity {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Classify, ErrorKind};
    use flate2::read::GzDecoder;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    fn sample_run(dir: &Path) -> (PathBuf, Vec<PathBuf>) {
        let sprint = dir.join("sprint_001");
        fs::create_dir_all(sprint.join("generated_artifacts/src")).unwrap();
        fs::create_dir_all(sprint.join("logs")).unwrap();
        fs::write(sprint.join("generated_artifacts/src/main.py"), "print('hi')\n").unwrap();
        fs::write(sprint.join("logs/orchestrator.log"), "started\n").unwrap();
        fs::write(dir.join("commit.txt"), "abc123\n").unwrap();
        fs::write(dir.join("metrics.json"), "{}\n").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("sprint_001", dir.join("final")).unwrap();
        (dir.join("metrics.json"), vec![sprint.join("logs/orchestrator.log")])
    }

    fn entry_names(archive: &Path) -> Vec<String> {
        let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
        tar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_verify_after_create() {
        let dir = TempDir::new().unwrap();
        let (metrics, logs) = sample_run(dir.path());
        let output = dir.path().join(ARCHIVE_FILE);

        create_archive(&output, dir.path(), &metrics, &logs).unwrap();
        let hash = compute_hash(&output).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(verify_archive(&output, &hash).unwrap());
        assert!(verify_or_fail(&output, &hash.to_uppercase()).is_ok());
    }

    #[test]
    fn test_flipped_byte_fails_verification() {
        let dir = TempDir::new().unwrap();
        let (metrics, logs) = sample_run(dir.path());
        let output = dir.path().join(ARCHIVE_FILE);
        create_archive(&output, dir.path(), &metrics, &logs).unwrap();
        let hash = compute_hash(&output).unwrap();

        let mut file = OpenOptions::new().read(true).write(true).open(&output).unwrap();
        file.seek(SeekFrom::Start(20)).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(20)).unwrap();
        file.write_all(&[byte[0] ^ 0xff]).unwrap();
        drop(file);

        assert!(!verify_archive(&output, &hash).unwrap());
        let err = verify_or_fail(&output, &hash).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_layout_and_exclusions() {
        let dir = TempDir::new().unwrap();
        let (metrics, logs) = sample_run(dir.path());
        fs::write(dir.path().join(RUN_METADATA_FILE), "{}").unwrap();
        let output = dir.path().join(ARCHIVE_FILE);
        create_archive(&output, dir.path(), &metrics, &logs).unwrap();

        let names = entry_names(&output);
        assert!(names.contains(&"workspace/sprint_001/generated_artifacts/src/main.py".to_string()));
        assert!(names.contains(&"workspace/commit.txt".to_string()));
        assert!(names.contains(&"metrics.json".to_string()));
        assert!(names.contains(&"logs/sprint_001/logs/orchestrator.log".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(ARCHIVE_FILE)));
        assert!(!names.contains(&"workspace/metadata.json".to_string()));
        assert!(!names.contains(&"workspace/metrics.json".to_string()));
        #[cfg(unix)]
        assert!(names.contains(&"workspace/final".to_string()));
    }

    #[test]
    fn test_archive_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let (metrics, logs) = sample_run(dir.path());
        let first = dir.path().join("first.tar.gz");
        let second = dir.path().join("second.tar.gz");

        create_archive(&first, dir.path(), &metrics, &logs).unwrap();
        // the first archive must not leak into the second
        let mut logs_and_first = logs.clone();
        logs_and_first.push(first.clone());
        create_archive(&second, dir.path(), &metrics, &logs_and_first).unwrap();

        assert_eq!(entry_names(&first), entry_names(&second));
        assert_eq!(compute_hash(&first).unwrap(), compute_hash(&second).unwrap());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (metrics, logs) = sample_run(dir.path());
        let output = dir.path().join(ARCHIVE_FILE);
        create_archive(&output, dir.path(), &metrics, &logs).unwrap();

        let now = Utc::now();
        let outcome = RunOutcome {
            status: RunStatus::Failed,
            failed_sprint: Some(2),
            error_kind: Some("timeout".into()),
            error_message: Some("Step timed out".into()),
            start_time: now,
            end_time: now,
        };
        let written =
            create_metadata(dir.path(), "run-1", "toolkit", "abc123", &output, outcome).unwrap();
        let loaded = ArchiveMetadata::load(dir.path()).unwrap();

        assert_eq!(written, loaded);
        assert_eq!(loaded.archive_file, ARCHIVE_FILE);
        assert_eq!(loaded.size_bytes, fs::metadata(&output).unwrap().len());
        assert!(verify_archive(&loaded.archive_path(dir.path()), &loaded.sha256).unwrap());
    }
}
