use crate::cli::{load_config, RunArgs};
use crate::runner::{RunOrchestrator, RunReport};
use tracing::error;

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let (config, base_dir) = load_config(&args.common, args.step_timeout)?;

    let orchestrator = RunOrchestrator::new(config, &args.framework, &base_dir);
    let report = orchestrator.run().await?;
    print_report(&report);

    if !report.succeeded() {
        error!("Run {} did not complete: {}", report.run_id, report.state);
        std::process::exit(1);
    }

    Ok(())
}

pub fn print_report(report: &RunReport) {
    println!("\n=== Run {} ===\n", report.run_id);
    println!("Framework: {}", report.framework);
    println!("Status:    {}", report.state);
    println!("Run dir:   {}", report.run_dir.display());
    match report.last_good_sprint {
        Some(sprint) => println!("Final:     sprint_{:03}", sprint),
        None => println!("Final:     none"),
    }
    println!(
        "Archive:   {} (sha256 {})",
        report.archive.archive_file, report.archive.sha256
    );
    println!("Duration:  {:.1}s", report.total_duration.as_secs_f64());

    println!("\nSprints:");
    for step in &report.steps {
        let icon = if step.success { "✅" } else { "❌" };
        println!(
            "  {} {:03} {} ({:.1}s, {} HITL, {} retries)",
            icon,
            step.step_number,
            step.step_id,
            step.duration_seconds,
            step.hitl_count,
            step.retries
        );
    }
    println!();
}
