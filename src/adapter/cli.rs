use super::{
    prepare_runtime, run_supervised, verify_commit, Adapter, AdapterContext, ClarificationDetector,
    HitlResponder, ImmediateStepResult, StepDeadline,
};
use crate::config::CliSettings;
use crate::error::AdapterError;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info};

/// Drives a command-line tool inside its own runtime environment.
///
/// The instruction is written to the tool's stdin and the tool works in the
/// sprint's `generated_artifacts/` directory.
pub struct CliAdapter {
    ctx: AdapterContext,
    settings: CliSettings,
    hitl: HitlResponder,
    detector: ClarificationDetector,
}

impl CliAdapter {
    pub fn new(ctx: AdapterContext, settings: CliSettings) -> Result<Self, AdapterError> {
        let hitl = HitlResponder::load(&ctx.hitl_file)?;
        let detector = ClarificationDetector::new(&settings.clarification_pattern)?;
        Ok(Self {
            ctx,
            settings,
            hitl,
            detector,
        })
    }

    fn binary(&self) -> PathBuf {
        let binary = &self.settings.binary;
        let binary_str = binary.to_string_lossy();
        if binary.is_absolute() || !(binary_str.contains('/') || binary_str.contains('\\')) {
            // Absolute path or plain command name for PATH lookup
            binary.clone()
        } else {
            self.ctx.checkout.join(binary)
        }
    }

    fn command(&self, step_number: u32) -> Command {
        let mut cmd = Command::new(self.binary());
        cmd.args(&self.settings.args);
        cmd.current_dir(&self.ctx.sprint.artifacts);

        if let Some(bin_dir) = &self.settings.runtime_bin_dir {
            let bin_dir = self.ctx.checkout.join(bin_dir);
            let path = std::env::var_os("PATH").unwrap_or_default();
            let mut paths = vec![bin_dir];
            paths.extend(std::env::split_paths(&path));
            if let Ok(joined) = std::env::join_paths(paths) {
                cmd.env("PATH", joined);
            }
        }

        cmd.envs(&self.settings.env);
        cmd.env("SPRINTBENCH_RUN_ID", &self.ctx.run_id);
        cmd.env("SPRINTBENCH_STEP", step_number.to_string());
        cmd.env("SPRINTBENCH_WORKSPACE", &self.ctx.sprint.artifacts);
        cmd
    }
}

#[async_trait]
impl Adapter for CliAdapter {
    fn name(&self) -> &str {
        &self.ctx.framework
    }

    async fn start(&self) -> Result<(), AdapterError> {
        prepare_runtime(&self.ctx.checkout, &self.ctx.config).await?;
        verify_commit(&self.ctx.checkout, &self.ctx.config.commit).await?;
        Ok(())
    }

    async fn execute_step(
        &self,
        step_number: u32,
        instruction: &str,
        deadline: &StepDeadline,
    ) -> Result<ImmediateStepResult, AdapterError> {
        let start_timestamp = Utc::now();
        let clock = Instant::now();
        let mut prompt = instruction.to_string();
        let mut hitl_count = 0u32;
        let mut api_calls = 0u64;

        loop {
            let output = run_supervised(
                self.command(step_number),
                Some(&prompt),
                deadline,
                Some((self.ctx.sprint.logs.as_path(), "tool")),
            )
            .await?;
            api_calls += 1;

            if output.exit_code != 0 {
                return Err(AdapterError::NonZeroExit {
                    code: output.exit_code,
                    stderr: output.stderr,
                });
            }

            match self.detector.find(&output.stdout) {
                Some(question) if hitl_count < self.settings.max_hitl_rounds => {
                    hitl_count += 1;
                    info!(
                        "{} asked for clarification (round {})",
                        self.ctx.framework, hitl_count
                    );
                    let answer = self.handle_hitl(question);
                    prompt = format!("{}\n\n## Clarification\n\n{}", instruction, answer);
                }
                Some(_) => {
                    debug!("Clarification round limit reached, accepting output");
                    break;
                }
                None => break,
            }
        }

        Ok(ImmediateStepResult {
            success: true,
            duration_seconds: clock.elapsed().as_secs_f64(),
            hitl_count,
            api_calls,
            start_timestamp,
            end_timestamp: Utc::now(),
        })
    }

    async fn health_check(&self) -> bool {
        // A CLI tool is alive whenever its executable is reachable
        let binary = self.binary();
        if binary.components().count() > 1 {
            binary.is_file()
        } else {
            true
        }
    }

    fn handle_hitl(&self, query: &str) -> String {
        self.hitl.answer(query)
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        // Subprocesses are reaped per call; nothing is held between steps
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{AdapterSettings, FrameworkConfig};
    use crate::workspace::create_sprint_workspace;
    use std::time::Duration;
    use tempfile::TempDir;

    fn adapter(dir: &TempDir, script: &str) -> CliAdapter {
        let hitl = dir.path().join("hitl.txt");
        std::fs::write(&hitl, "Use SQLite.").unwrap();
        let sprint = create_sprint_workspace(&dir.path().join("run"), 1).unwrap();
        let settings = CliSettings {
            binary: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            runtime_bin_dir: None,
            env: Default::default(),
            clarification_pattern: r"\[NEEDS CLARIFICATION:?[^\]]*\]".to_string(),
            max_hitl_rounds: 2,
        };
        let config = FrameworkConfig {
            enabled: true,
            repo_url: None,
            commit: "abc".to_string(),
            checkout: None,
            setup_commands: vec![],
            api_key_env: "KEY".to_string(),
            usage_api_key_env: "USAGE".to_string(),
            adapter: AdapterSettings::Cli(settings.clone()),
        };
        let ctx = AdapterContext {
            run_id: "run-1".to_string(),
            framework: "toolkit".to_string(),
            config,
            checkout: dir.path().to_path_buf(),
            hitl_file: hitl,
            sprint,
            previous_artifacts: None,
        };
        CliAdapter::new(ctx, settings).unwrap()
    }

    #[tokio::test]
    async fn test_execute_writes_into_workspace() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter(&dir, "cat > instruction.txt; echo done");
        let deadline = StepDeadline::new(Duration::from_secs(10), Duration::from_secs(1));

        let result = adapter.execute_step(1, "build it", &deadline).await.unwrap();
        assert!(result.success);
        assert_eq!(result.hitl_count, 0);
        assert_eq!(result.api_calls, 1);
        let written = std::fs::read_to_string(
            dir.path().join("run/sprint_001/generated_artifacts/instruction.txt"),
        )
        .unwrap();
        assert_eq!(written, "build it");
        assert!(dir.path().join("run/sprint_001/logs/tool.stdout.log").is_file());
    }

    #[tokio::test]
    async fn test_clarification_is_answered() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter(
            &dir,
            "if grep -q 'Use SQLite' -; then echo ok; else echo '[NEEDS CLARIFICATION: db?]'; fi",
        );
        let deadline = StepDeadline::new(Duration::from_secs(10), Duration::from_secs(1));

        let result = adapter.execute_step(1, "build it", &deadline).await.unwrap();
        assert_eq!(result.hitl_count, 1);
        assert_eq!(result.api_calls, 2);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_retryable() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter(&dir, "echo boom >&2; exit 2");
        let deadline = StepDeadline::new(Duration::from_secs(10), Duration::from_secs(1));

        let err = adapter.execute_step(1, "x", &deadline).await.unwrap_err();
        assert!(matches!(err, AdapterError::NonZeroExit { code: 2, .. }));
        assert_eq!(
            crate::error::Classify::kind(&err),
            crate::error::ErrorKind::Retryable
        );
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_tool_logs() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter(&dir, "echo partial-progress; sleep 30");
        let deadline = StepDeadline::new(Duration::from_millis(300), Duration::from_millis(200));

        let err = adapter.execute_step(1, "build it", &deadline).await.unwrap_err();
        assert_eq!(
            crate::error::Classify::kind(&err),
            crate::error::ErrorKind::Timeout
        );
        let log =
            std::fs::read_to_string(dir.path().join("run/sprint_001/logs/tool.stdout.log")).unwrap();
        assert!(log.contains("partial-progress"));
    }
}
