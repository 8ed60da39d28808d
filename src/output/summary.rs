use crate::archive::RunOutcome;
use crate::error::OutputError;
use crate::metrics::RunMetrics;
use std::fs;
use std::path::Path;

pub const SUMMARY_FILE: &str = "summary.md";

/// Write the human-readable run summary next to `metrics.json`
pub fn write_run_summary(
    run_dir: &Path,
    metrics: &RunMetrics,
    outcome: &RunOutcome,
) -> Result<(), OutputError> {
    fs::create_dir_all(run_dir).map_err(OutputError::CreateDir)?;
    let md = build_run_summary(metrics, outcome);
    fs::write(run_dir.join(SUMMARY_FILE), md).map_err(OutputError::WriteReport)?;
    Ok(())
}

pub fn build_run_summary(metrics: &RunMetrics, outcome: &RunOutcome) -> String {
    let agg = &metrics.aggregate_metrics;
    let mut md = String::new();

    md.push_str(&format!("# {} run {}\n\n", metrics.framework, metrics.run_id));
    md.push_str(&format!("**Status:** {}\n", outcome.status));
    if let (Some(sprint), Some(kind)) = (outcome.failed_sprint, &outcome.error_kind) {
        md.push_str(&format!(
            "**Failed at:** sprint {} ({}): {}\n",
            sprint,
            kind,
            outcome.error_message.as_deref().unwrap_or("")
        ));
    }
    md.push_str(&format!("**Started:** {}\n", outcome.start_time.to_rfc3339()));
    md.push_str(&format!("**Ended:** {}\n\n", outcome.end_time.to_rfc3339()));

    md.push_str("## Totals\n\n");
    md.push_str("| Metric | Value |\n");
    md.push_str("|--------|-------|\n");
    md.push_str(&format!(
        "| Steps | {} completed / {} failed / {} total |\n",
        agg.steps_completed, agg.steps_failed, agg.steps_total
    ));
    md.push_str(&format!(
        "| Duration | {:.1}s (avg {:.1}s per step) |\n",
        agg.total_duration_seconds, agg.avg_step_duration_seconds
    ));
    md.push_str(&format!("| HITL rounds | {} |\n", agg.total_hitl));
    md.push_str(&format!("| API calls | {} |\n", agg.total_api_calls));
    md.push_str(&format!("| AUTR | {:.3} |\n", agg.autr));
    md.push_str(&format!(
        "| Tokens | pending reconciliation ({}) |\n\n",
        metrics.usage_api_reconciliation.verification_status
    ));

    md.push_str("## Sprints\n\n");
    md.push_str("| Sprint | Step | Status | Duration | HITL | Retries |\n");
    md.push_str("|--------|------|--------|----------|------|---------|\n");
    for step in &metrics.steps {
        let status = if step.success { "✅ completed" } else { "❌ failed" };
        md.push_str(&format!(
            "| {:03} | {} | {} | {:.1}s | {} | {} |\n",
            step.step_number,
            step.step_id,
            status,
            step.duration_seconds,
            step.hitl_count,
            step.retries
        ));
    }

    md
}
