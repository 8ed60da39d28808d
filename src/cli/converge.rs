use crate::cli::{completed_runs, load_config, selected_frameworks, ConvergeArgs};
use crate::metrics::AggregateMetrics;
use crate::stats::{check_convergence, ConvergenceReport};
use std::collections::BTreeMap;

pub fn execute(args: ConvergeArgs) -> anyhow::Result<()> {
    let (config, base_dir) = load_config(&args.common, None)?;
    let runs_dir = base_dir.join(&config.runs_dir);
    let only = args.framework.map(|f| vec![f]);
    let frameworks = selected_frameworks(&config, only.as_deref())?;

    let mut reports: BTreeMap<String, ConvergenceReport> = BTreeMap::new();
    for framework in frameworks {
        let history: Vec<AggregateMetrics> = completed_runs(&runs_dir, &framework)
            .into_iter()
            .map(|m| m.aggregate_metrics)
            .collect();
        reports.insert(framework, check_convergence(&history, &config.stopping_rule));
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    for (framework, report) in &reports {
        println!(
            "{}: {} ({} run(s)) - {}",
            framework, report.decision, report.runs_completed, report.reason
        );
        for metric in &report.metrics {
            match metric.ci {
                Some(ci) => println!(
                    "    {} mean {:.3} ±{:.3} (limit {:.3}){}",
                    metric.metric,
                    ci.mean,
                    ci.half_width(),
                    metric.threshold,
                    if metric.converged { " ✓" } else { "" }
                ),
                None if metric.awaiting_tokens => println!(
                    "    {} awaiting token reconciliation ({} reconciled run(s))",
                    metric.metric, metric.samples
                ),
                None => println!("    {} unavailable", metric.metric),
            }
        }
    }
    Ok(())
}
