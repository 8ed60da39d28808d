use crate::cli::run::print_report;
use crate::cli::{completed_runs, load_config, selected_frameworks, BenchArgs};
use crate::metrics::AggregateMetrics;
use crate::runner::RunOrchestrator;
use crate::stats::{check_convergence, Decision};
use std::collections::HashMap;
use tracing::{info, warn};

pub async fn execute(args: BenchArgs) -> anyhow::Result<()> {
    let (config, base_dir) = load_config(&args.common, args.step_timeout)?;
    let runs_dir = base_dir.join(&config.runs_dir);
    let mut frameworks = selected_frameworks(&config, args.frameworks.as_deref())?;

    let mut failures: HashMap<String, u32> = HashMap::new();
    let mut dropped: Vec<String> = Vec::new();
    let mut executed = 0usize;

    loop {
        // Fewest completed runs first; ties broken by name
        let mut next: Option<(usize, String)> = None;
        for framework in &frameworks {
            let history: Vec<AggregateMetrics> = completed_runs(&runs_dir, framework)
                .into_iter()
                .map(|m| m.aggregate_metrics)
                .collect();
            let report = check_convergence(&history, &config.stopping_rule);
            info!(
                "{}: {} after {} run(s) ({})",
                framework, report.decision, report.runs_completed, report.reason
            );
            if report.decision == Decision::Continue
                && next.as_ref().map_or(true, |(n, _)| history.len() < *n)
            {
                next = Some((history.len(), framework.clone()));
            }
        }

        let Some((_, framework)) = next else {
            break;
        };

        let report = RunOrchestrator::new(config.clone(), &framework, &base_dir)
            .run()
            .await?;
        executed += 1;
        print_report(&report);

        if report.succeeded() {
            failures.remove(&framework);
            continue;
        }

        let count = failures.entry(framework.clone()).or_default();
        *count += 1;
        warn!(
            "Run {} for {} failed ({} in a row): {}",
            report.run_id, framework, count, report.state
        );
        if *count >= args.max_consecutive_failures {
            warn!("Dropping {} after {} consecutive failures", framework, count);
            frameworks.retain(|f| f != &framework);
            dropped.push(framework);
        }
    }

    println!("Benchmark finished after {} run(s)", executed);
    if !dropped.is_empty() {
        anyhow::bail!("Gave up on: {}", dropped.join(", "));
    }
    Ok(())
}
