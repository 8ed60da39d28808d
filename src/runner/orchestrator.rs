use crate::adapter::{default_factory, AdapterContext, AdapterFactory, HitlResponder};
use crate::archive::{
    create_archive, create_metadata, verify_or_fail, ArchiveMetadata, RunOutcome, ARCHIVE_FILE,
};
use crate::config::Config;
use crate::error::{ConfigError, ErrorKind, RunnerError, WorkspaceError};
use crate::manifest::{Manifest, ManifestEntry};
use crate::metrics::{RunMetrics, RunStatus, StepRecord, RUN_METRICS_FILE};
use crate::output::write_run_summary;
use crate::workspace::{
    create_final_symlink, create_sprint_workspace, previous_sprint_artifacts, SprintPaths,
};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use super::context::{RunContext, SprintLog};
use super::executor::{execute_sprint, ExecutionSettings};

pub const COMMIT_FILE: &str = "commit.txt";

/// Lifecycle of one run. `Failed` and `Completed` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Pending,
    Running {
        sprint: u32,
    },
    Failed {
        sprint: u32,
        kind: String,
        message: String,
    },
    Completed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running { sprint } => write!(f, "running sprint {}", sprint),
            RunState::Failed {
                sprint,
                kind,
                message,
            } => write!(f, "failed at sprint {} ({}): {}", sprint, kind, message),
            RunState::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub framework: String,
    pub run_dir: PathBuf,
    pub state: RunState,
    pub steps: Vec<StepRecord>,
    pub last_good_sprint: Option<u32>,
    pub archive: ArchiveMetadata,
    pub total_duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// Drives one framework through every enabled step, one sprint per step
pub struct RunOrchestrator {
    config: Config,
    framework: String,
    base_dir: PathBuf,
    factory: AdapterFactory,
    settings: ExecutionSettings,
}

impl RunOrchestrator {
    /// `base_dir` anchors relative paths in the config (usually the config file's directory)
    pub fn new(config: Config, framework: &str, base_dir: &Path) -> Self {
        let settings = ExecutionSettings::from_config(&config);
        Self {
            config,
            framework: framework.to_string(),
            base_dir: base_dir.to_path_buf(),
            factory: default_factory(),
            settings,
        }
    }

    pub fn with_factory(mut self, factory: AdapterFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join(&self.config.runs_dir)
    }

    pub async fn run(&self) -> Result<RunReport, RunnerError> {
        let clock = Instant::now();

        // Everything that can be checked before touching the filesystem
        let framework = self.config.framework(&self.framework)?.clone();
        if framework.commit.trim().is_empty() {
            return Err(ConfigError::MissingCommit(self.framework.clone()).into());
        }
        let steps = self.config.resolve_steps(&self.base_dir)?;
        let hitl_file = self.base_dir.join(&self.config.hitl_file);
        HitlResponder::load(&hitl_file)?;
        let checkout = self
            .base_dir
            .join(self.config.checkout_dir(&self.framework, &framework));

        let run_id = Uuid::new_v4().to_string();
        let runs_dir = self.runs_dir();
        let run_dir = runs_dir.join(&self.framework).join(&run_id);
        fs::create_dir_all(&run_dir).map_err(|source| WorkspaceError::Io {
            path: run_dir.clone(),
            source,
        })?;
        fs::write(run_dir.join(COMMIT_FILE), format!("{}\n", framework.commit)).map_err(
            |source| WorkspaceError::Io {
                path: run_dir.join(COMMIT_FILE),
                source,
            },
        )?;

        let ctx = RunContext::new(&run_id, &self.framework);
        let span = ctx.span();
        let started = Utc::now();

        let (state, records, last_good) = async {
            info!(
                "Run {} started: {} step(s) at commit {}",
                run_id,
                steps.len(),
                framework.commit
            );

            let mut state = RunState::Pending;
            let mut records = Vec::with_capacity(steps.len());
            let mut last_good = None;

            for step in &steps {
                state = RunState::Running {
                    sprint: step.sprint_number,
                };
                let paths = match create_sprint_workspace(&run_dir, step.sprint_number) {
                    Ok(paths) => paths,
                    Err(e) => {
                        state = aborted(step.sprint_number, &RunnerError::from(e));
                        break;
                    }
                };
                let log = SprintLog::open(ctx.for_sprint(step.sprint_number), &paths.logs);
                let adapter_ctx = AdapterContext {
                    run_id: run_id.clone(),
                    framework: self.framework.clone(),
                    config: framework.clone(),
                    checkout: checkout.clone(),
                    hitl_file: hitl_file.clone(),
                    sprint: paths,
                    previous_artifacts: previous_sprint_artifacts(&run_dir, step.sprint_number),
                };

                let outcome =
                    match execute_sprint(&self.settings, &self.factory, adapter_ctx, step, &log)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            log.error(&format!("Sprint {} aborted: {}", step.sprint_number, e));
                            state = aborted(step.sprint_number, &e);
                            break;
                        }
                    };
                records.push(outcome.record.clone());

                if let Some(error) = outcome.failure() {
                    state = RunState::Failed {
                        sprint: step.sprint_number,
                        kind: error.kind.clone(),
                        message: error.message.clone(),
                    };
                    break;
                }
                last_good = Some(step.sprint_number);
            }

            if matches!(state, RunState::Running { .. }) {
                state = RunState::Completed;
            }
            (state, records, last_good)
        }
        .instrument(span.clone())
        .await;

        let _entered = span.enter();
        self.finalize(FinalizeInput {
            run_id: &run_id,
            commit: &framework.commit,
            runs_dir: &runs_dir,
            run_dir: &run_dir,
            state,
            records,
            last_good,
            started,
            clock,
        })
        .map_err(|e| {
            error!("Run {} could not be finalized: {}", run_id, e);
            e
        })
    }

    /// Write run-level outputs: final link, metrics, summary, archive,
    /// metadata and the manifest entry
    fn finalize(&self, input: FinalizeInput<'_>) -> Result<RunReport, RunnerError> {
        let FinalizeInput {
            run_id,
            commit,
            runs_dir,
            run_dir,
            state,
            records,
            last_good,
            started,
            clock,
        } = input;
        let run_id = run_id.to_string();
        let run_dir = run_dir.to_path_buf();

        match last_good {
            Some(sprint) => {
                create_final_symlink(&run_dir, sprint)?;
            }
            None => warn!("No sprint completed; run {} has no final link", run_id),
        }

        let ended = Utc::now();
        let status = if state == RunState::Completed {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let metrics = RunMetrics::new(&run_id, &self.framework, status, started, ended, records);
        metrics.save(&run_dir)?;

        let outcome = match &state {
            RunState::Failed {
                sprint,
                kind,
                message,
            } => RunOutcome {
                status,
                failed_sprint: Some(*sprint),
                error_kind: Some(kind.clone()),
                error_message: Some(message.clone()),
                start_time: started,
                end_time: ended,
            },
            _ => RunOutcome {
                status,
                failed_sprint: None,
                error_kind: None,
                error_message: None,
                start_time: started,
                end_time: ended,
            },
        };
        write_run_summary(&run_dir, &metrics, &outcome)?;

        let archive_path = run_dir.join(ARCHIVE_FILE);
        let sprints = match &state {
            RunState::Failed { sprint, .. } => *sprint,
            _ => metrics.steps.len() as u32,
        };
        let logs = collect_log_files(&run_dir, sprints);
        create_archive(
            &archive_path,
            &run_dir,
            &run_dir.join(RUN_METRICS_FILE),
            &logs,
        )?;

        let archive = create_metadata(
            &run_dir,
            &run_id,
            &self.framework,
            commit,
            &archive_path,
            outcome,
        )?;
        verify_or_fail(&archive_path, &archive.sha256)?;

        let mut manifest = Manifest::load(runs_dir);
        manifest.upsert(ManifestEntry::from_metrics(runs_dir, &run_dir, &metrics));
        if let Err(e) = manifest.save(runs_dir) {
            warn!("Failed to update manifest: {}", e);
        }

        info!("Run {} {}", run_id, state);
        Ok(RunReport {
            run_id,
            framework: self.framework.clone(),
            run_dir,
            state,
            steps: metrics.steps,
            last_good_sprint: last_good,
            archive,
            total_duration: clock.elapsed(),
        })
    }
}

struct FinalizeInput<'a> {
    run_id: &'a str,
    commit: &'a str,
    runs_dir: &'a Path,
    run_dir: &'a Path,
    state: RunState,
    records: Vec<StepRecord>,
    last_good: Option<u32>,
    started: DateTime<Utc>,
    clock: Instant,
}

/// A sprint that could not be executed or persisted ends the run as fatal
fn aborted(sprint: u32, error: &RunnerError) -> RunState {
    RunState::Failed {
        sprint,
        kind: ErrorKind::Fatal.to_string(),
        message: error.to_string(),
    }
}

/// Every file under each sprint's `logs/`, in sprint order
fn collect_log_files(run_dir: &Path, sprints: u32) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for sprint in 1..=sprints {
        let logs = SprintPaths::new(run_dir, sprint).logs;
        let Ok(entries) = fs::read_dir(&logs) else {
            continue;
        };
        let mut sprint_files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        sprint_files.sort();
        files.extend(sprint_files);
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Adapter, ImmediateStepResult, StepDeadline};
    use crate::archive::verify_archive;
    use crate::config::RetryConfig;
    use crate::error::AdapterError;
    use crate::workspace::{SprintMetadata, SprintStatus, ARTIFACTS_DIR, FINAL_LINK};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Hang,
        RejectCommit,
        FlakyOnce,
        /// Leave a file where the next sprint must create a directory
        BlockNextSeed,
        /// Leave a directory where the next sprint writes its metrics
        BlockNextMetrics,
    }

    struct FakeAdapter {
        ctx: AdapterContext,
        behavior: Behavior,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Adapter for FakeAdapter {
        fn name(&self) -> &str {
            "fake"
        }

        async fn start(&self) -> Result<(), AdapterError> {
            match self.behavior {
                Behavior::RejectCommit => Err(AdapterError::CommitMismatch {
                    expected: "abc123".into(),
                    actual: "fff000".into(),
                }),
                _ => Ok(()),
            }
        }

        async fn execute_step(
            &self,
            step_number: u32,
            _instruction: &str,
            deadline: &StepDeadline,
        ) -> Result<ImmediateStepResult, AdapterError> {
            let start_timestamp = Utc::now();
            let artifacts = &self.ctx.sprint.artifacts;
            // overwrite the seeded copy of sprint 1's output
            fs::write(artifacts.join("app.py"), format!("step {}\n", step_number))?;

            let next = self
                .ctx
                .sprint
                .root
                .parent()
                .unwrap()
                .join(format!("sprint_{:03}", step_number + 1));
            match self.behavior {
                Behavior::BlockNextSeed => {
                    fs::create_dir_all(artifacts.join("data"))?;
                    fs::write(artifacts.join("data/notes.txt"), "seed me")?;
                    fs::create_dir_all(next.join(ARTIFACTS_DIR))?;
                    fs::write(next.join(ARTIFACTS_DIR).join("data"), "in the way")?;
                }
                Behavior::BlockNextMetrics => {
                    fs::create_dir_all(next.join(ARTIFACTS_DIR))?;
                    fs::create_dir_all(next.join("logs"))?;
                    fs::create_dir_all(next.join("metrics.json"))?;
                }
                Behavior::Hang => {
                    tokio::time::sleep_until(deadline.expires_at()).await;
                    return Err(AdapterError::Timeout(deadline.timeout()));
                }
                Behavior::FlakyOnce if self.calls.fetch_add(1, Ordering::SeqCst) == 0 => {
                    return Err(AdapterError::Transient("503".into()));
                }
                _ => {}
            }

            Ok(ImmediateStepResult {
                success: true,
                duration_seconds: 0.01,
                hitl_count: 0,
                api_calls: 1,
                start_timestamp,
                end_timestamp: Utc::now(),
            })
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn handle_hitl(&self, _query: &str) -> String {
            "use defaults".into()
        }

        async fn stop(&self) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    fn fake_factory(plan: HashMap<u32, Behavior>) -> AdapterFactory {
        let calls = Arc::new(AtomicU32::new(0));
        Arc::new(move |ctx: AdapterContext| {
            let behavior = plan
                .get(&ctx.sprint.sprint_number)
                .copied()
                .unwrap_or(Behavior::Succeed);
            let adapter: Arc<dyn Adapter> = Arc::new(FakeAdapter {
                ctx,
                behavior,
                calls: calls.clone(),
            });
            Ok::<_, AdapterError>(adapter)
        })
    }

    fn setup(dir: &Path) -> Config {
        fs::create_dir_all(dir.join("prompts")).unwrap();
        for n in 1..=3 {
            fs::write(dir.join(format!("prompts/{:02}.txt", n)), format!("step {}", n)).unwrap();
        }
        fs::write(dir.join("hitl.txt"), "Use SQLite and keep it simple.").unwrap();
        Config::from_yaml(
            r#"
runs_dir: runs
hitl_file: hitl.txt
steps:
  - id: crud
    prompt_file: prompts/01.txt
  - id: auth
    prompt_file: prompts/02.txt
  - id: ui
    prompt_file: prompts/03.txt
frameworks:
  toolkit:
    kind: cli
    commit: abc123
    binary: tool
"#,
        )
        .unwrap()
    }

    fn fast_settings() -> ExecutionSettings {
        ExecutionSettings {
            retry: RetryConfig {
                max_attempts: 2,
                backoff_base_ms: 1,
                backoff_multiplier: 2.0,
            },
            step_timeout: Duration::from_millis(200),
            grace_period: Duration::from_millis(20),
            probe_interval: None,
        }
    }

    fn orchestrator(dir: &Path, plan: HashMap<u32, Behavior>) -> RunOrchestrator {
        RunOrchestrator::new(setup(dir), "toolkit", dir)
            .with_factory(fake_factory(plan))
            .with_settings(fast_settings())
    }

    #[tokio::test]
    async fn test_timeout_in_sprint_two_stops_the_run() {
        let dir = TempDir::new().unwrap();
        let report = orchestrator(dir.path(), HashMap::from([(2, Behavior::Hang)]))
            .run()
            .await
            .unwrap();
        let run_dir = &report.run_dir;

        assert!(!report.succeeded());
        assert!(run_dir.join("sprint_001").is_dir());
        assert!(run_dir.join("sprint_002").is_dir());
        assert!(!run_dir.join("sprint_003").exists());

        let final_target = fs::read_link(run_dir.join(FINAL_LINK)).unwrap();
        assert_eq!(final_target, PathBuf::from("sprint_001"));
        assert_eq!(
            fs::canonicalize(run_dir.join(FINAL_LINK)).unwrap(),
            fs::canonicalize(run_dir.join("sprint_001")).unwrap()
        );

        let sprint2 = SprintMetadata::load(&run_dir.join("sprint_002/metadata.json")).unwrap();
        assert_eq!(sprint2.status, SprintStatus::Failed);
        assert_eq!(sprint2.attempts, 1);
        assert_eq!(sprint2.error.as_ref().unwrap().kind, "timeout");

        let run_meta = ArchiveMetadata::load(run_dir).unwrap();
        assert_eq!(run_meta.outcome.status, RunStatus::Failed);
        assert_eq!(run_meta.outcome.failed_sprint, Some(2));
        assert_eq!(run_meta.outcome.error_kind.as_deref(), Some("timeout"));
        assert_eq!(
            report.state,
            RunState::Failed {
                sprint: 2,
                kind: "timeout".into(),
                message: sprint2.error.unwrap().message,
            }
        );

        let metrics = RunMetrics::load(run_dir).unwrap();
        assert_eq!(metrics.status, RunStatus::Failed);
        assert_eq!(metrics.steps.len(), 2);
        assert_eq!(metrics.aggregate_metrics.steps_failed, 1);
    }

    #[tokio::test]
    async fn test_previous_sprint_artifacts_stay_unchanged() {
        let dir = TempDir::new().unwrap();
        let report = orchestrator(dir.path(), HashMap::new()).run().await.unwrap();
        let run_dir = &report.run_dir;

        assert!(report.succeeded());
        assert_eq!(report.last_good_sprint, Some(3));
        let first = run_dir.join("sprint_001").join(ARTIFACTS_DIR).join("app.py");
        let third = run_dir.join("sprint_003").join(ARTIFACTS_DIR).join("app.py");
        assert_eq!(fs::read_to_string(first).unwrap(), "step 1\n");
        assert_eq!(fs::read_to_string(third).unwrap(), "step 3\n");
        assert_eq!(
            fs::read_to_string(run_dir.join(COMMIT_FILE)).unwrap(),
            "abc123\n"
        );

        assert!(verify_archive(&run_dir.join(ARCHIVE_FILE), &report.archive.sha256).unwrap());
        let manifest = Manifest::load(&dir.path().join("runs"));
        assert!(manifest.get(&report.run_id).is_some());
    }

    #[tokio::test]
    async fn test_commit_mismatch_fails_first_sprint_without_final() {
        let dir = TempDir::new().unwrap();
        let report = orchestrator(dir.path(), HashMap::from([(1, Behavior::RejectCommit)]))
            .run()
            .await
            .unwrap();

        assert!(matches!(
            &report.state,
            RunState::Failed { sprint: 1, kind, .. } if kind == "fatal"
        ));
        assert!(report.last_good_sprint.is_none());
        assert!(fs::symlink_metadata(report.run_dir.join(FINAL_LINK)).is_err());
        assert!(!report.run_dir.join("sprint_002").exists());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let dir = TempDir::new().unwrap();
        let report = orchestrator(dir.path(), HashMap::from([(1, Behavior::FlakyOnce)]))
            .run()
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.steps[0].retries, 1);
        let sprint1 =
            SprintMetadata::load(&report.run_dir.join("sprint_001/metadata.json")).unwrap();
        assert_eq!(sprint1.attempts, 2);
    }

    #[tokio::test]
    async fn test_seeding_failure_fails_sprint_and_finishes_run() {
        let dir = TempDir::new().unwrap();
        let report = orchestrator(dir.path(), HashMap::from([(1, Behavior::BlockNextSeed)]))
            .run()
            .await
            .unwrap();
        let run_dir = &report.run_dir;

        assert!(matches!(
            &report.state,
            RunState::Failed { sprint: 2, kind, .. } if kind == "fatal"
        ));
        let sprint2 = SprintMetadata::load(&run_dir.join("sprint_002/metadata.json")).unwrap();
        assert_eq!(sprint2.status, SprintStatus::Failed);
        assert_eq!(sprint2.error.unwrap().kind, "fatal");
        assert!(!run_dir.join("sprint_003").exists());

        let metrics = RunMetrics::load(run_dir).unwrap();
        assert_eq!(metrics.status, RunStatus::Failed);
        assert_eq!(metrics.steps.len(), 2);
        assert!(run_dir.join("summary.md").is_file());
        assert!(verify_archive(&run_dir.join(ARCHIVE_FILE), &report.archive.sha256).unwrap());
        assert_eq!(report.last_good_sprint, Some(1));
    }

    #[tokio::test]
    async fn test_unwritable_sprint_metrics_still_finish_run() {
        let dir = TempDir::new().unwrap();
        let report = orchestrator(dir.path(), HashMap::from([(1, Behavior::BlockNextMetrics)]))
            .run()
            .await
            .unwrap();
        let run_dir = &report.run_dir;

        assert!(matches!(
            &report.state,
            RunState::Failed { sprint: 2, kind, message }
                if kind == "fatal" && message.contains("metrics.json")
        ));
        let sprint2 = SprintMetadata::load(&run_dir.join("sprint_002/metadata.json")).unwrap();
        assert_eq!(sprint2.status, SprintStatus::Failed);

        let metrics = RunMetrics::load(run_dir).unwrap();
        assert_eq!(metrics.status, RunStatus::Failed);
        assert_eq!(metrics.steps.len(), 1);
        assert!(run_dir.join("summary.md").is_file());
        let run_meta = ArchiveMetadata::load(run_dir).unwrap();
        assert_eq!(run_meta.outcome.failed_sprint, Some(2));
        assert!(Manifest::load(&dir.path().join("runs"))
            .get(&report.run_id)
            .is_some());
    }

    #[tokio::test]
    async fn test_missing_hitl_file_is_fatal_before_run() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator(dir.path(), HashMap::new());
        fs::remove_file(dir.path().join("hitl.txt")).unwrap();

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::Config(ConfigError::MissingHitlFile(_))
        ));
        assert!(!dir.path().join("runs").exists());
    }
}
