use crate::error::WorkspaceError;
use crate::metrics::{RunMetrics, RunStatus, VerificationStatus, RUN_METRICS_FILE};
use crate::workspace::write_json_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;

/// Derived index over every run under `runs_dir`. Never the source of truth:
/// `rebuild` regenerates it from the run directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    pub total_runs: usize,
    pub frameworks: BTreeMap<String, usize>,
    pub runs: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub run_id: String,
    pub framework: String,
    /// Run directory relative to `runs_dir`
    pub path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: RunStatus,
    pub verification_status: VerificationStatus,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
}

impl ManifestEntry {
    pub fn from_metrics(runs_dir: &Path, run_dir: &Path, metrics: &RunMetrics) -> Self {
        let path = run_dir
            .strip_prefix(runs_dir)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| run_dir.to_path_buf());
        Self {
            run_id: metrics.run_id.clone(),
            framework: metrics.framework.clone(),
            path,
            start_time: metrics.start_time,
            end_time: metrics.end_time,
            status: metrics.status,
            verification_status: metrics.usage_api_reconciliation.verification_status,
            total_tokens_in: metrics.aggregate_metrics.total_tokens_in,
            total_tokens_out: metrics.aggregate_metrics.total_tokens_out,
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            last_updated: Utc::now(),
            total_runs: 0,
            frameworks: BTreeMap::new(),
            runs: Vec::new(),
        }
    }
}

impl Manifest {
    pub fn path(runs_dir: &Path) -> PathBuf {
        runs_dir.join(MANIFEST_FILE)
    }

    /// Load the manifest, or an empty one if it is missing or unreadable
    pub fn load(runs_dir: &Path) -> Self {
        let path = Self::path(runs_dir);
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring corrupt manifest {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                warn!("Cannot read manifest {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&mut self, runs_dir: &Path) -> Result<(), WorkspaceError> {
        fs::create_dir_all(runs_dir).map_err(|source| WorkspaceError::Io {
            path: runs_dir.to_path_buf(),
            source,
        })?;
        self.last_updated = Utc::now();
        write_json_atomic(&Self::path(runs_dir), self)
    }

    /// Insert or replace the entry for `entry.run_id`
    pub fn upsert(&mut self, entry: ManifestEntry) {
        match self.runs.iter_mut().find(|r| r.run_id == entry.run_id) {
            Some(existing) => *existing = entry,
            None => self.runs.push(entry),
        }
        self.recount();
    }

    pub fn get(&self, run_id: &str) -> Option<&ManifestEntry> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }

    fn recount(&mut self) {
        self.runs
            .sort_by(|a, b| a.start_time.cmp(&b.start_time).then(a.run_id.cmp(&b.run_id)));
        self.total_runs = self.runs.len();
        self.frameworks.clear();
        for run in &self.runs {
            *self.frameworks.entry(run.framework.clone()).or_default() += 1;
        }
    }

    /// Reconstruct from every `<runs_dir>/<framework>/<run_id>/metrics.json`
    pub fn rebuild(runs_dir: &Path) -> Self {
        let mut manifest = Self::default();
        for run_dir in discover_runs(runs_dir, None) {
            match RunMetrics::load(&run_dir) {
                Ok(metrics) => {
                    manifest.upsert(ManifestEntry::from_metrics(runs_dir, &run_dir, &metrics))
                }
                Err(e) => warn!("Skipping {}: {}", run_dir.display(), e),
            }
        }
        manifest
    }
}

/// Run directories under `runs_dir` that carry a run-level `metrics.json`,
/// optionally restricted to one framework. Sorted by path.
pub fn discover_runs(runs_dir: &Path, framework: Option<&str>) -> Vec<PathBuf> {
    let mut runs = Vec::new();
    let Ok(frameworks) = fs::read_dir(runs_dir) else {
        debug!("No runs directory at {}", runs_dir.display());
        return runs;
    };

    for fw in frameworks.flatten() {
        let fw_path = fw.path();
        if !fw_path.is_dir() {
            continue;
        }
        if let Some(wanted) = framework {
            if fw.file_name().to_string_lossy() != wanted {
                continue;
            }
        }
        let Ok(entries) = fs::read_dir(&fw_path) else {
            continue;
        };
        for run in entries.flatten() {
            let run_path = run.path();
            if run_path.join(RUN_METRICS_FILE).is_file() {
                runs.push(run_path);
            }
        }
    }

    runs.sort();
    runs
}

/// Load every run's metrics for one framework, skipping unreadable runs
pub fn load_framework_runs(runs_dir: &Path, framework: &str) -> Vec<RunMetrics> {
    discover_runs(runs_dir, Some(framework))
        .into_iter()
        .filter_map(|dir| match RunMetrics::load(&dir) {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!("Skipping {}: {}", dir.display(), e);
                None
            }
        })
        .collect()
}
