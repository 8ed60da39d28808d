use crate::cli::{load_config, ReconcileArgs};
use crate::usage::{openai_source_factory, ReconcileOutcome, Reconciler};
use tracing::{info, warn};

pub async fn execute(args: ReconcileArgs) -> anyhow::Result<()> {
    let (config, base_dir) = load_config(&args.common, None)?;
    let runs_dir = base_dir.join(&config.runs_dir);
    let settings = config.reconciliation.clone();
    let reconciler = Reconciler::new(&runs_dir, settings.clone(), openai_source_factory(&config));

    if let (Some(run_id), Some(framework)) = (&args.run_id, &args.framework) {
        let outcome = reconciler.reconcile_run(run_id, framework, args.force).await?;
        print_outcome(&outcome);
        return Ok(());
    }

    let min_age = args.min_age_minutes.unwrap_or(settings.min_age_minutes);
    let max_age = args.max_age_hours.unwrap_or(settings.max_age_hours);
    let results = reconciler
        .reconcile_all_pending(args.framework.as_deref(), min_age, max_age)
        .await;

    let mut failed = 0;
    for (dir, result) in &results {
        match result {
            Ok(outcome) => print_outcome(outcome),
            Err(e) => {
                failed += 1;
                warn!("{}: {}", dir.display(), e);
            }
        }
    }
    info!(
        "Reconciled {} run(s), {} failed",
        results.len() - failed,
        failed
    );
    Ok(())
}

fn print_outcome(outcome: &ReconcileOutcome) {
    if outcome.skipped {
        println!("{} {}: already verified", outcome.framework, outcome.run_id);
        return;
    }
    println!(
        "{} {}: {} -> {} (stable {}, {} step(s) updated, {} error(s), tokens in/out {}/{})",
        outcome.framework,
        outcome.run_id,
        outcome.previous_status,
        outcome.status,
        outcome.stable_attempts,
        outcome.updated.len(),
        outcome.step_errors,
        outcome.total_tokens_in,
        outcome.total_tokens_out
    );
}
