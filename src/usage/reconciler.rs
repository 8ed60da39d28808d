use super::{ReconciledUsage, UsageSourceFactory};
use crate::config::ReconciliationConfig;
use crate::error::UsageError;
use crate::manifest::{discover_runs, Manifest, ManifestEntry};
use crate::metrics::{ReconciliationAttempt, RunMetrics, VerificationStatus};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Number of consecutive stable attempts at the end of the history.
///
/// An attempt is only compared when it comes at least `interval` after the
/// previous counted attempt; closer ones are ignored. A compared attempt
/// with equal totals extends the streak, any difference resets it.
pub fn count_stable_attempts(attempts: &[ReconciliationAttempt], interval: Duration) -> usize {
    let mut iter = attempts.iter();
    let Some(mut reference) = iter.next() else {
        return 0;
    };

    let mut stable = 0;
    for attempt in iter {
        if attempt.timestamp - reference.timestamp < interval {
            continue;
        }
        if attempt.total_tokens_in == reference.total_tokens_in
            && attempt.total_tokens_out == reference.total_tokens_out
        {
            stable += 1;
        } else {
            stable = 0;
        }
        reference = attempt;
    }
    stable
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub run_id: String,
    pub framework: String,
    pub previous_status: VerificationStatus,
    pub status: VerificationStatus,
    pub stable_attempts: usize,
    /// Usage filled in by this pass
    pub updated: Vec<ReconciledUsage>,
    pub step_errors: usize,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    /// Verified already and not forced; nothing was touched
    pub skipped: bool,
}

pub struct Reconciler {
    runs_dir: PathBuf,
    settings: ReconciliationConfig,
    sources: UsageSourceFactory,
}

impl Reconciler {
    pub fn new(runs_dir: &Path, settings: ReconciliationConfig, sources: UsageSourceFactory) -> Self {
        Self {
            runs_dir: runs_dir.to_path_buf(),
            settings,
            sources,
        }
    }

    /// Reconcile one run and update its manifest entry
    pub async fn reconcile_run(
        &self,
        run_id: &str,
        framework: &str,
        force: bool,
    ) -> Result<ReconcileOutcome, UsageError> {
        let run_dir = self.runs_dir.join(framework).join(run_id);
        if !run_dir.join(crate::metrics::RUN_METRICS_FILE).is_file() {
            return Err(UsageError::RunNotFound(run_id.to_string()));
        }

        let (outcome, metrics) = self.reconcile_dir(&run_dir, force, Utc::now()).await?;
        if !outcome.skipped {
            self.update_manifest(&[(run_dir, metrics)]);
        }
        Ok(outcome)
    }

    /// Reconcile every run old enough for the usage API to have caught up and
    /// young enough to still be worth asking about. Failures are per run.
    pub async fn reconcile_all_pending(
        &self,
        framework: Option<&str>,
        min_age_minutes: i64,
        max_age_hours: i64,
    ) -> Vec<(PathBuf, Result<ReconcileOutcome, UsageError>)> {
        let now = Utc::now();
        let min_age = Duration::minutes(min_age_minutes);
        let max_age = Duration::hours(max_age_hours);

        let candidates: Vec<PathBuf> = discover_runs(&self.runs_dir, framework)
            .into_iter()
            .filter(|dir| match RunMetrics::load(dir) {
                Ok(metrics) => {
                    let age = now - metrics.end_time;
                    let status = metrics.usage_api_reconciliation.verification_status;
                    if age < min_age {
                        debug!("{} too recent ({} min)", metrics.run_id, age.num_minutes());
                        false
                    } else if age > max_age {
                        debug!("{} past give-up horizon", metrics.run_id);
                        false
                    } else {
                        status != VerificationStatus::Verified
                    }
                }
                Err(e) => {
                    warn!("Skipping {}: {}", dir.display(), e);
                    false
                }
            })
            .collect();

        info!("Reconciling {} pending run(s)", candidates.len());

        let results: Vec<(PathBuf, Result<(ReconcileOutcome, RunMetrics), UsageError>)> =
            stream::iter(candidates)
                .map(|dir| async move {
                    let result = self.reconcile_dir(&dir, false, now).await;
                    (dir, result)
                })
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;

        let updated: Vec<(PathBuf, RunMetrics)> = results
            .iter()
            .filter_map(|(dir, r)| r.as_ref().ok().map(|(_, m)| (dir.clone(), m.clone())))
            .collect();
        self.update_manifest(&updated);

        results
            .into_iter()
            .map(|(dir, r)| (dir, r.map(|(outcome, _)| outcome)))
            .collect()
    }

    /// One reconciliation pass over a run directory, evaluated at `now`
    pub async fn reconcile_dir(
        &self,
        run_dir: &Path,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<(ReconcileOutcome, RunMetrics), UsageError> {
        let mut metrics = RunMetrics::load(run_dir)?;
        let previous_status = metrics.usage_api_reconciliation.verification_status;

        if previous_status == VerificationStatus::Verified && !force {
            debug!("{} already verified", metrics.run_id);
            let outcome = ReconcileOutcome {
                run_id: metrics.run_id.clone(),
                framework: metrics.framework.clone(),
                previous_status,
                status: previous_status,
                stable_attempts: metrics.usage_api_reconciliation.stable_attempts,
                updated: Vec::new(),
                step_errors: 0,
                total_tokens_in: metrics.aggregate_metrics.total_tokens_in,
                total_tokens_out: metrics.aggregate_metrics.total_tokens_out,
                skipped: true,
            };
            return Ok((outcome, metrics));
        }

        if force {
            let record = &mut metrics.usage_api_reconciliation;
            record.attempts.clear();
            record.stable_attempts = 0;
            record.reconciled_at = None;
            record.verification_status = VerificationStatus::None;
        }

        let source = (*self.sources)(&metrics.framework)?;
        let mut updated = Vec::new();
        let mut step_errors = 0;

        for step in metrics.steps.iter_mut() {
            if step.has_tokens() && !force {
                continue;
            }
            if step.end_timestamp <= step.start_timestamp {
                step.reconciliation_error =
                    Some(UsageError::MissingWindow(step.step_number).to_string());
                step_errors += 1;
                continue;
            }

            match source.query(step.start_timestamp, step.end_timestamp).await {
                Ok(window) => {
                    step.tokens_in = window.tokens_in;
                    step.tokens_out = window.tokens_out;
                    step.cached_tokens = window.cached_tokens;
                    step.reconciliation_error = None;
                    if window.tokens_in > 0 || window.tokens_out > 0 {
                        updated.push(ReconciledUsage {
                            run_id: metrics.run_id.clone(),
                            step_number: step.step_number,
                            tokens_in: window.tokens_in,
                            tokens_out: window.tokens_out,
                            cached_tokens: window.cached_tokens,
                        });
                    }
                }
                Err(e) => {
                    warn!(
                        "Usage query for {} step {} failed: {}",
                        metrics.run_id, step.step_number, e
                    );
                    step.reconciliation_error = Some(e.to_string());
                    step_errors += 1;
                }
            }
        }

        metrics.recompute();

        let interval = Duration::minutes(self.settings.interval_minutes);
        let unavailable_after = Duration::minutes(self.settings.data_unavailable_after_minutes);
        let total_tokens_in = metrics.aggregate_metrics.total_tokens_in;
        let total_tokens_out = metrics.aggregate_metrics.total_tokens_out;
        let end_time = metrics.end_time;

        let record = &mut metrics.usage_api_reconciliation;
        record.attempts.push(ReconciliationAttempt {
            timestamp: now,
            total_tokens_in,
            total_tokens_out,
        });
        record.stable_attempts = count_stable_attempts(&record.attempts, interval);

        let next = if record.stable_attempts >= self.settings.stable_threshold {
            VerificationStatus::Verified
        } else if total_tokens_in == 0 && total_tokens_out == 0 && now - end_time >= unavailable_after
        {
            VerificationStatus::DataNotAvailable
        } else {
            VerificationStatus::Pending
        };
        // forward only
        if next.rank() >= record.verification_status.rank() {
            record.verification_status = next;
        }
        if record.verification_status == VerificationStatus::Verified {
            record.reconciled_at.get_or_insert(now);
        }

        let outcome = ReconcileOutcome {
            run_id: metrics.run_id.clone(),
            framework: metrics.framework.clone(),
            previous_status,
            status: record.verification_status,
            stable_attempts: record.stable_attempts,
            updated,
            step_errors,
            total_tokens_in,
            total_tokens_out,
            skipped: false,
        };

        metrics.save(run_dir)?;
        info!(
            "{}: {} -> {} ({} stable, {} tokens in)",
            outcome.run_id, previous_status, outcome.status, outcome.stable_attempts, total_tokens_in
        );
        Ok((outcome, metrics))
    }

    fn update_manifest(&self, runs: &[(PathBuf, RunMetrics)]) {
        if runs.is_empty() {
            return;
        }
        let mut manifest = Manifest::load(&self.runs_dir);
        for (dir, metrics) in runs {
            manifest.upsert(ManifestEntry::from_metrics(&self.runs_dir, dir, metrics));
        }
        if let Err(e) = manifest.save(&self.runs_dir) {
            warn!("Failed to update manifest: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::tests::step;
    use crate::metrics::RunStatus;
    use crate::usage::{UsageSource, UsageWindow};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FakeSource {
        tokens_in: AtomicU64,
    }

    #[async_trait]
    impl UsageSource for FakeSource {
        async fn query(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<UsageWindow, UsageError> {
            Ok(UsageWindow {
                tokens_in: self.tokens_in.load(Ordering::SeqCst),
                tokens_out: 10,
                cached_tokens: 0,
                requests: 1,
            })
        }
    }

    struct EmptySource;

    #[async_trait]
    impl UsageSource for EmptySource {
        async fn query(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<UsageWindow, UsageError> {
            Ok(UsageWindow::default())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl UsageSource for FailingSource {
        async fn query(
            &self,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<UsageWindow, UsageError> {
            Err(UsageError::Api {
                status: 503,
                body: "unavailable".into(),
            })
        }
    }

    fn attempt(minutes: i64, tokens_in: u64) -> ReconciliationAttempt {
        let base = DateTime::parse_from_rfc3339("2025-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        ReconciliationAttempt {
            timestamp: base + Duration::minutes(minutes),
            total_tokens_in: tokens_in,
            total_tokens_out: 0,
        }
    }

    fn settings() -> ReconciliationConfig {
        ReconciliationConfig {
            interval_minutes: 10,
            stable_threshold: 2,
            data_unavailable_after_minutes: 60,
            ..ReconciliationConfig::default()
        }
    }

    fn write_run(runs_dir: &Path, run_id: &str) -> PathBuf {
        let run_dir = runs_dir.join("toolkit").join(run_id);
        std::fs::create_dir_all(&run_dir).unwrap();
        let end = Utc::now() - Duration::hours(2);
        let mut steps = vec![step(1, true, 0, 0), step(2, true, 1, 0)];
        for s in steps.iter_mut() {
            s.start_timestamp = end - Duration::minutes(5);
            s.end_timestamp = end;
        }
        RunMetrics::new(run_id, "toolkit", RunStatus::Completed, end, end, steps)
            .save(&run_dir)
            .unwrap();
        run_dir
    }

    fn reconciler(runs_dir: &Path, source: Arc<dyn UsageSource>) -> Reconciler {
        Reconciler::new(runs_dir, settings(), Arc::new(move |_: &str| Ok::<_, UsageError>(source.clone())))
    }

    #[test]
    fn test_stable_count_respects_interval() {
        let interval = Duration::minutes(10);
        assert_eq!(count_stable_attempts(&[], interval), 0);
        assert_eq!(
            count_stable_attempts(&[attempt(0, 500), attempt(5, 500)], interval),
            0
        );
        assert_eq!(
            count_stable_attempts(&[attempt(0, 500), attempt(10, 500)], interval),
            1
        );
    }

    #[test]
    fn test_stable_count_resets_on_change() {
        let interval = Duration::minutes(10);
        let attempts = [
            attempt(0, 100),
            attempt(10, 100),
            attempt(20, 150),
            attempt(25, 150),
            attempt(30, 150),
            attempt(40, 150),
        ];
        // 20 resets, 25 is too close, 30 and 40 extend
        assert_eq!(count_stable_attempts(&attempts, interval), 2);
    }

    #[tokio::test]
    async fn test_status_progresses_to_verified() {
        let dir = TempDir::new().unwrap();
        let run_dir = write_run(dir.path(), "r1");
        let source = Arc::new(FakeSource {
            tokens_in: AtomicU64::new(400),
        });
        let reconciler = reconciler(dir.path(), source);
        let t0 = Utc::now();

        let (first, _) = reconciler.reconcile_dir(&run_dir, false, t0).await.unwrap();
        assert_eq!(first.status, VerificationStatus::Pending);
        assert_eq!(first.total_tokens_in, 800);
        assert_eq!(first.updated.len(), 2);

        reconciler
            .reconcile_dir(&run_dir, false, t0 + Duration::minutes(10))
            .await
            .unwrap();
        let (third, metrics) = reconciler
            .reconcile_dir(&run_dir, false, t0 + Duration::minutes(20))
            .await
            .unwrap();
        assert_eq!(third.status, VerificationStatus::Verified);
        assert_eq!(third.stable_attempts, 2);
        assert_eq!(metrics.usage_api_reconciliation.attempts.len(), 3);
        assert!(metrics.aggregate_metrics.aei > 0.0);

        // verified without force is a no-op
        let (again, _) = reconciler
            .reconcile_dir(&run_dir, false, t0 + Duration::minutes(30))
            .await
            .unwrap();
        assert!(again.skipped);
        let saved = RunMetrics::load(&run_dir).unwrap();
        assert_eq!(saved.usage_api_reconciliation.attempts.len(), 3);
        assert_eq!(
            saved.usage_api_reconciliation.verification_status,
            VerificationStatus::Verified
        );
    }

    #[tokio::test]
    async fn test_force_restarts_history() {
        let dir = TempDir::new().unwrap();
        let run_dir = write_run(dir.path(), "r1");
        let source = Arc::new(FakeSource {
            tokens_in: AtomicU64::new(400),
        });
        let reconciler = reconciler(dir.path(), source.clone());
        let t0 = Utc::now();
        for minutes in [0, 10, 20] {
            reconciler
                .reconcile_dir(&run_dir, false, t0 + Duration::minutes(minutes))
                .await
                .unwrap();
        }

        source.tokens_in.store(450, Ordering::SeqCst);
        let (forced, metrics) = reconciler
            .reconcile_dir(&run_dir, true, t0 + Duration::minutes(30))
            .await
            .unwrap();
        assert!(!forced.skipped);
        assert_eq!(forced.status, VerificationStatus::Pending);
        assert_eq!(forced.total_tokens_in, 900);
        assert_eq!(metrics.usage_api_reconciliation.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_usage_becomes_data_not_available() {
        let dir = TempDir::new().unwrap();
        let run_dir = write_run(dir.path(), "r1");
        let reconciler = reconciler(dir.path(), Arc::new(EmptySource));

        let (outcome, _) = reconciler
            .reconcile_dir(&run_dir, false, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.status, VerificationStatus::DataNotAvailable);
        assert_eq!(outcome.step_errors, 0);
    }

    #[tokio::test]
    async fn test_step_errors_are_recorded_not_fatal() {
        let dir = TempDir::new().unwrap();
        let run_dir = write_run(dir.path(), "r1");
        let reconciler = reconciler(dir.path(), Arc::new(FailingSource));

        let (outcome, metrics) = reconciler
            .reconcile_dir(&run_dir, false, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.step_errors, 2);
        assert!(metrics
            .steps
            .iter()
            .all(|s| s.reconciliation_error.as_deref().unwrap().contains("503")));
    }

    #[tokio::test]
    async fn test_reconcile_all_pending_filters_by_age() {
        let dir = TempDir::new().unwrap();
        write_run(dir.path(), "old-enough");
        let source = Arc::new(FakeSource {
            tokens_in: AtomicU64::new(10),
        });
        let reconciler = reconciler(dir.path(), source);

        // run ended two hours ago: too recent for a 3h minimum age
        let none = reconciler.reconcile_all_pending(None, 180, 168).await;
        assert!(none.is_empty());

        let results = reconciler.reconcile_all_pending(Some("toolkit"), 30, 168).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());

        let manifest = Manifest::load(dir.path());
        assert_eq!(
            manifest.get("old-enough").unwrap().verification_status,
            VerificationStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_reconcile_all_pending_skips_expired_and_verified() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(FakeSource {
            tokens_in: AtomicU64::new(10),
        });
        let reconciler = reconciler(dir.path(), source);

        // ended ten days ago, beyond a one-week horizon
        let expired = write_run(dir.path(), "expired");
        let mut metrics = RunMetrics::load(&expired).unwrap();
        metrics.end_time = Utc::now() - Duration::days(10);
        metrics.save(&expired).unwrap();

        let verified = write_run(dir.path(), "verified");
        let mut metrics = RunMetrics::load(&verified).unwrap();
        metrics.usage_api_reconciliation.verification_status = VerificationStatus::Verified;
        metrics.save(&verified).unwrap();

        let pending = write_run(dir.path(), "pending");

        let results = reconciler.reconcile_all_pending(None, 30, 168).await;
        let touched: Vec<&PathBuf> = results.iter().map(|(dir, _)| dir).collect();
        assert_eq!(touched, vec![&pending]);

        for run_dir in [&expired, &verified] {
            let saved = RunMetrics::load(run_dir).unwrap();
            assert!(saved.usage_api_reconciliation.attempts.is_empty());
            assert_eq!(saved.aggregate_metrics.total_tokens_in, 0);
        }
        assert_eq!(
            RunMetrics::load(&verified)
                .unwrap()
                .usage_api_reconciliation
                .verification_status,
            VerificationStatus::Verified
        );
        assert_eq!(
            RunMetrics::load(&pending)
                .unwrap()
                .usage_api_reconciliation
                .attempts
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_run_is_reported() {
        let dir = TempDir::new().unwrap();
        let reconciler = reconciler(dir.path(), Arc::new(FailingSource));
        let err = reconciler
            .reconcile_run("missing", "toolkit", false)
            .await
            .unwrap_err();
        assert!(matches!(err, UsageError::RunNotFound(_)));
    }
}
