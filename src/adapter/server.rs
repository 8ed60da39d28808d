use super::process::{own_process_group, terminate};
use super::{
    prepare_runtime, verify_commit, Adapter, AdapterContext, HitlResponder, ImmediateStepResult,
    StepDeadline,
};
use crate::config::ServerSettings;
use crate::error::AdapterError;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::File;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives a tool that runs as an API server plus an optional UI server.
///
/// Protocol: `POST /execute` returns a task id, `GET /status/{id}` is polled
/// until a terminal state, `POST /answer/{id}` replies to `needs_input`, and
/// `POST /cancel/{id}` asks the server to stop a task.
pub struct ServerAdapter {
    ctx: AdapterContext,
    settings: ServerSettings,
    hitl: HitlResponder,
    client: Client,
    processes: Mutex<Vec<Child>>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaskState {
    Pending,
    Running,
    NeedsInput,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    state: TaskState,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    api_calls: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    run_id: &'a str,
    step: u32,
    instruction: &'a str,
    workspace: &'a Path,
}

impl ServerAdapter {
    pub fn new(ctx: AdapterContext, settings: ServerSettings) -> Result<Self, AdapterError> {
        let hitl = HitlResponder::load(&ctx.hitl_file)?;
        let client = Client::builder()
            .user_agent(concat!("sprintbench/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            ctx,
            settings,
            hitl,
            client,
            processes: Mutex::new(Vec::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.api_url.trim_end_matches('/'), path)
    }

    fn spawn(&self, argv: &[String], log_name: &str) -> Result<Child, AdapterError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| AdapterError::Setup(format!("empty {} command", log_name)))?;

        std::fs::create_dir_all(&self.ctx.sprint.logs)?;
        let stdout = File::create(self.ctx.sprint.logs.join(format!("{}.stdout.log", log_name)))?;
        let stderr = File::create(self.ctx.sprint.logs.join(format!("{}.stderr.log", log_name)))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.ctx.checkout)
            .env("SPRINTBENCH_WORKSPACE", &self.ctx.sprint.artifacts)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        own_process_group(&mut cmd);
        Ok(cmd.spawn()?)
    }

    async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Probe {} failed: {}", url, e);
                false
            }
        }
    }

    async fn status(&self, task_id: &str) -> Result<StatusResponse, AdapterError> {
        let resp = self
            .client
            .get(self.url(&format!("/status/{}", task_id)))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Poll the task until a terminal state, answering clarification requests
    async fn drive(
        &self,
        task_id: &str,
        poll: Duration,
        deadline: &StepDeadline,
        hitl_count: &mut u32,
        api_calls: &mut u64,
    ) -> Result<(), AdapterError> {
        loop {
            if deadline.expired() {
                return Err(AdapterError::Timeout(deadline.timeout()));
            }

            let status = within(deadline, self.status(task_id)).await?;
            if let Some(calls) = status.api_calls {
                *api_calls = calls;
            }

            match status.state {
                TaskState::Pending | TaskState::Running => {}
                TaskState::NeedsInput => {
                    let question = status.question.unwrap_or_default();
                    let answer = self.handle_hitl(&question);
                    *hitl_count += 1;
                    let url = self.url(&format!("/answer/{}", task_id));
                    within(deadline, async {
                        self.client
                            .post(&url)
                            .json(&json!({ "answer": answer }))
                            .send()
                            .await?
                            .error_for_status()?;
                        Ok::<_, AdapterError>(())
                    })
                    .await?;
                }
                TaskState::Completed => return Ok(()),
                TaskState::Failed | TaskState::Cancelled => {
                    return Err(AdapterError::Transient(
                        status
                            .error
                            .unwrap_or_else(|| "task failed without error message".to_string()),
                    ));
                }
            }

            tokio::time::sleep(poll.min(deadline.remaining().max(Duration::from_millis(1)))).await;
        }
    }

    /// Ask the server to cancel, then wait up to the grace period for it to wind down
    async fn cancel(&self, task_id: &str, grace: Duration) {
        let url = self.url(&format!("/cancel/{}", task_id));
        let until = Instant::now() + grace;
        match self.client.post(&url).timeout(grace).send().await {
            Ok(_) => {}
            Err(e) => {
                warn!("Cancel request for task {} failed: {}", task_id, e);
                return;
            }
        }
        while Instant::now() < until {
            let left = until.saturating_duration_since(Instant::now());
            if let Ok(Ok(status)) = tokio::time::timeout(left, self.status(task_id)).await {
                if matches!(
                    status.state,
                    TaskState::Cancelled | TaskState::Failed | TaskState::Completed
                ) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(self.settings.poll_interval_ms)).await;
        }
    }
}

/// Bound a request by the step deadline; a stalled server surfaces as a timeout
async fn within<T, F>(deadline: &StepDeadline, fut: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    tokio::time::timeout(deadline.remaining(), fut)
        .await
        .map_err(|_| AdapterError::Timeout(deadline.timeout()))?
}

#[async_trait]
impl Adapter for ServerAdapter {
    fn name(&self) -> &str {
        &self.ctx.framework
    }

    async fn start(&self) -> Result<(), AdapterError> {
        prepare_runtime(&self.ctx.checkout, &self.ctx.config).await?;
        verify_commit(&self.ctx.checkout, &self.ctx.config.commit).await?;

        let mut processes = self.processes.lock().await;
        if processes.is_empty() {
            processes.push(self.spawn(&self.settings.api_command, "api_server")?);
            if let Some(ui) = &self.settings.ui_command {
                processes.push(self.spawn(ui, "ui_server")?);
            }
        }
        drop(processes);

        let until = Instant::now() + Duration::from_secs(self.settings.startup_timeout_sec);
        while Instant::now() < until {
            if self.health_check().await {
                info!("{} servers are up", self.ctx.framework);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(self.settings.poll_interval_ms)).await;
        }
        Err(AdapterError::Transient(format!(
            "{} servers not healthy after {}s",
            self.ctx.framework, self.settings.startup_timeout_sec
        )))
    }

    async fn execute_step(
        &self,
        step_number: u32,
        instruction: &str,
        deadline: &StepDeadline,
    ) -> Result<ImmediateStepResult, AdapterError> {
        let start_timestamp = Utc::now();
        let clock = Instant::now();
        let poll = Duration::from_millis(self.settings.poll_interval_ms);

        let request = ExecuteRequest {
            run_id: &self.ctx.run_id,
            step: step_number,
            instruction,
            workspace: &self.ctx.sprint.artifacts,
        };
        let submitted = within(deadline, async {
            Ok::<_, AdapterError>(
                self.client
                    .post(self.url("/execute"))
                    .json(&request)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<ExecuteResponse>()
                    .await?,
            )
        })
        .await?;
        debug!("Submitted step {} as task {}", step_number, submitted.task_id);

        let mut hitl_count = 0u32;
        let mut api_calls = 0u64;

        let outcome = self
            .drive(&submitted.task_id, poll, deadline, &mut hitl_count, &mut api_calls)
            .await;
        if let Err(e) = outcome {
            if matches!(e, AdapterError::Timeout(_)) {
                self.cancel(&submitted.task_id, deadline.grace()).await;
            }
            return Err(e);
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
        if !self.probe(&self.url("/health")).await {
            return false;
        }
        match &self.settings.ui_url {
            Some(ui) => self.probe(ui).await,
            None => true,
        }
    }

    fn handle_hitl(&self, query: &str) -> String {
        self.hitl.answer(query)
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        let mut processes = self.processes.lock().await;
        for mut child in processes.drain(..) {
            terminate(&mut child, Duration::from_secs(5)).await;
        }
        Ok(())
    }
}
