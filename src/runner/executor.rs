use crate::adapter::{Adapter, AdapterContext, AdapterFactory, ImmediateStepResult, StepDeadline};
use crate::config::{ResolvedStep, RetryConfig};
use crate::error::{AdapterError, Classify, ErrorKind, RunnerError};
use crate::metrics::StepRecord;
use crate::workspace::{
    seed_artifacts, write_json_atomic, SprintError, SprintMetadata, SprintPaths,
};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::context::SprintLog;
use super::retry::retry_with_backoff;

/// Timing and retry discipline applied to every sprint
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub retry: RetryConfig,
    pub step_timeout: Duration,
    pub grace_period: Duration,
    /// Background liveness probing interval, when enabled
    pub probe_interval: Option<Duration>,
}

impl ExecutionSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            retry: config.retry.clone(),
            step_timeout: config.step_timeout(),
            grace_period: config.grace_period(),
            probe_interval: config
                .health_probe
                .enabled
                .then(|| Duration::from_secs(config.health_probe.interval_sec.max(1))),
        }
    }
}

/// Terminal result of one sprint, already persisted to disk
#[derive(Debug)]
pub struct SprintOutcome {
    pub record: StepRecord,
    pub metadata: SprintMetadata,
}

impl SprintOutcome {
    pub fn failure(&self) -> Option<&SprintError> {
        self.metadata.error.as_ref()
    }
}

/// Invoke one step under a hard deadline.
///
/// The adapter receives the deadline and handles graceful-then-forced
/// termination itself. If it overruns deadline + grace anyway, the call is
/// abandoned and the adapter is stopped.
pub async fn execute_with_deadline(
    adapter: Arc<dyn Adapter>,
    step_number: u32,
    instruction: &str,
    timeout: Duration,
    grace: Duration,
) -> Result<ImmediateStepResult, AdapterError> {
    let deadline = StepDeadline::new(timeout, grace);
    let backstop = timeout + grace * 2 + Duration::from_secs(1);

    match tokio::time::timeout(backstop, adapter.execute_step(step_number, instruction, &deadline))
        .await
    {
        Ok(Ok(result)) if !result.success => Err(AdapterError::Transient(format!(
            "{} reported an unsuccessful step",
            adapter.name()
        ))),
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                "{} ignored its deadline, forcing stop",
                adapter.name()
            );
            if let Err(e) = adapter.stop().await {
                tracing::warn!("Forced stop failed: {}", e);
            }
            Err(AdapterError::Timeout(timeout))
        }
    }
}

fn spawn_probe(adapter: Arc<dyn Adapter>, interval: Duration, misses: Arc<AtomicU64>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !adapter.health_check().await {
                misses.fetch_add(1, Ordering::Relaxed);
            }
        }
    })
}

fn failed_record(
    step: &ResolvedStep,
    started: chrono::DateTime<Utc>,
    clock: Instant,
    attempts: u32,
    downtime_probes: u64,
) -> StepRecord {
    StepRecord {
        step_number: step.sprint_number,
        step_id: step.id.clone(),
        success: false,
        start_timestamp: started,
        end_timestamp: Utc::now(),
        duration_seconds: clock.elapsed().as_secs_f64(),
        hitl_count: 0,
        api_calls: 0,
        retries: attempts.saturating_sub(1),
        downtime_probes,
        tokens_in: 0,
        tokens_out: 0,
        cached_tokens: 0,
        reconciliation_error: None,
    }
}

/// Write the sprint's metrics then metadata. When the metrics cannot be
/// written the sprint is recorded as failed so it never stays `running`.
fn persist(
    paths: &SprintPaths,
    record: &StepRecord,
    metadata: &mut SprintMetadata,
) -> Result<(), RunnerError> {
    if let Err(e) = write_json_atomic(&paths.metrics, record) {
        let attempts = metadata.attempts;
        metadata.fail(
            attempts,
            SprintError::new(ErrorKind::Fatal, format!("failed to persist metrics: {}", e)),
        );
        if let Err(meta_err) = write_json_atomic(&paths.metadata, metadata) {
            tracing::error!("Sprint metadata is stale: {}", meta_err);
        }
        return Err(e.into());
    }
    write_json_atomic(&paths.metadata, metadata)?;
    Ok(())
}

/// Run one sprint: seed artifacts, start the adapter, execute with retry and
/// deadline, stop the adapter, and persist metadata and metrics.
///
/// Adapter and seeding failures never escape as errors; they are recorded in
/// the returned outcome. Only persistence failures return `Err`, and the
/// sprint's metadata is marked failed first whenever it can still be written.
pub async fn execute_sprint(
    settings: &ExecutionSettings,
    factory: &AdapterFactory,
    ctx: AdapterContext,
    step: &ResolvedStep,
    log: &SprintLog,
) -> Result<SprintOutcome, RunnerError> {
    let span = log.context().span();
    async move {
        let paths = ctx.sprint.clone();
        let mut metadata =
            SprintMetadata::running(&ctx.run_id, &ctx.framework, step.sprint_number, &step.id);
        write_json_atomic(&paths.metadata, &metadata)?;
        log.info(&format!("Sprint {} ({}) started", step.sprint_number, step.id));

        let clock = Instant::now();
        let started = Utc::now();

        if let Some(previous) = &ctx.previous_artifacts {
            match seed_artifacts(previous, &paths.artifacts) {
                Ok(copied) => log.info(&format!(
                    "Seeded {} files from {}",
                    copied,
                    previous.display()
                )),
                Err(e) => {
                    log.error(&format!(
                        "Sprint {} could not be seeded: {}",
                        step.sprint_number, e
                    ));
                    let record = failed_record(step, started, clock, 0, 0);
                    metadata.fail(0, SprintError::new(ErrorKind::Fatal, e.to_string()));
                    persist(&paths, &record, &mut metadata)?;
                    return Ok(SprintOutcome { record, metadata });
                }
            }
        }

        let misses = Arc::new(AtomicU64::new(0));
        let mut attempts = 0;

        let result = match (**factory)(ctx) {
            Err(e) => Err(e),
            Ok(adapter) => {
                let (started_ok, start_attempts) = retry_with_backoff(&settings.retry, || {
                    let adapter = adapter.clone();
                    async move { adapter.start().await }
                })
                .await;

                let result = match started_ok {
                    Err(e) => {
                        attempts = start_attempts;
                        Err(e)
                    }
                    Ok(()) => {
                        let probe = settings
                            .probe_interval
                            .map(|interval| spawn_probe(adapter.clone(), interval, misses.clone()));

                        let (result, step_attempts) = retry_with_backoff(&settings.retry, || {
                            let adapter = adapter.clone();
                            let instruction = step.instruction.clone();
                            async move {
                                execute_with_deadline(
                                    adapter,
                                    step.sprint_number,
                                    &instruction,
                                    settings.step_timeout,
                                    settings.grace_period,
                                )
                                .await
                            }
                        })
                        .await;
                        attempts = step_attempts;

                        if let Some(probe) = probe {
                            probe.abort();
                        }
                        result
                    }
                };

                if let Err(e) = adapter.stop().await {
                    log.warn(&format!("Adapter stop failed: {}", e));
                }
                result
            }
        };

        let record = match &result {
            Ok(step_result) => StepRecord {
                step_number: step.sprint_number,
                step_id: step.id.clone(),
                success: true,
                start_timestamp: step_result.start_timestamp,
                end_timestamp: step_result.end_timestamp,
                duration_seconds: step_result.duration_seconds,
                hitl_count: step_result.hitl_count,
                api_calls: step_result.api_calls,
                retries: attempts.saturating_sub(1),
                downtime_probes: misses.load(Ordering::Relaxed),
                tokens_in: 0,
                tokens_out: 0,
                cached_tokens: 0,
                reconciliation_error: None,
            },
            Err(_) => failed_record(
                step,
                started,
                clock,
                attempts,
                misses.load(Ordering::Relaxed),
            ),
        };

        match result {
            Ok(_) => {
                metadata.complete(attempts);
                log.info(&format!(
                    "Sprint {} completed in {:.1}s after {} attempt(s)",
                    step.sprint_number, record.duration_seconds, attempts
                ));
            }
            Err(e) => {
                let kind = e.kind();
                log.error(&format!(
                    "Sprint {} failed ({}) after {} attempt(s): {}",
                    step.sprint_number, kind, attempts, e
                ));
                metadata.fail(attempts, SprintError::new(kind, e.to_string()));
            }
        }

        // Durable before the next sprint may begin
        persist(&paths, &record, &mut metadata)?;

        Ok(SprintOutcome { record, metadata })
    }
    .instrument(span)
    .await
}
