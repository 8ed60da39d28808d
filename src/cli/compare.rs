use crate::cli::{completed_runs, load_config, selected_frameworks, CompareArgs};
use crate::output::{write_comparison, ComparisonReport};
use crate::stats::compare_metric;
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub fn execute(args: CompareArgs) -> anyhow::Result<()> {
    let (config, base_dir) = load_config(&args.common, None)?;
    let runs_dir = base_dir.join(&config.runs_dir);
    let frameworks = selected_frameworks(&config, args.frameworks.as_deref())?;
    let rule = &config.stopping_rule;
    let metrics = args.metrics.clone().unwrap_or_else(|| rule.metrics.clone());

    let runs: BTreeMap<String, _> = frameworks
        .into_iter()
        .map(|fw| {
            let runs = completed_runs(&runs_dir, &fw);
            (fw, runs)
        })
        .collect();

    let mut comparisons = Vec::with_capacity(metrics.len());
    for metric in &metrics {
        let groups: BTreeMap<String, Vec<f64>> = runs
            .iter()
            .map(|(fw, runs)| {
                let values = runs
                    .iter()
                    .filter_map(|m| m.aggregate_metrics.value(metric))
                    .collect();
                (fw.clone(), values)
            })
            .collect();

        if groups.values().all(|v: &Vec<f64>| v.is_empty()) {
            warn!("No values for metric '{}'", metric);
            continue;
        }
        comparisons.push(compare_metric(
            metric,
            &groups,
            args.alpha,
            rule.bootstrap_samples,
            rule.confidence_level,
        )?);
    }

    let report = ComparisonReport {
        generated_at: Utc::now(),
        alpha: args.alpha,
        confidence_level: rule.confidence_level,
        frameworks: runs.iter().map(|(fw, r)| (fw.clone(), r.len())).collect(),
        metrics: comparisons,
    };
    write_comparison(&args.output, &report)?;

    info!("Comparison written to {:?}", args.output);
    println!(
        "Compared {} framework(s) over {} metric(s): {}",
        report.frameworks.len(),
        report.metrics.len(),
        args.output.join("comparison.md").display()
    );
    Ok(())
}
