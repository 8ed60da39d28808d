use crate::error::OutputError;
use crate::stats::compare::KruskalWallis;
use crate::stats::MetricComparison;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct ComparisonReport {
    pub generated_at: DateTime<Utc>,
    pub alpha: f64,
    pub confidence_level: f64,
    /// Runs contributing per framework
    pub frameworks: BTreeMap<String, usize>,
    pub metrics: Vec<MetricComparison>,
}

/// Write comparison.json and comparison.md into `output_dir`
pub fn write_comparison(output_dir: &Path, report: &ComparisonReport) -> Result<(), OutputError> {
    fs::create_dir_all(output_dir).map_err(OutputError::CreateDir)?;

    let json = serde_json::to_string_pretty(report)?;
    fs::write(output_dir.join("comparison.json"), json).map_err(OutputError::WriteReport)?;

    let md = build_comparison_markdown(report);
    fs::write(output_dir.join("comparison.md"), md).map_err(OutputError::WriteReport)?;

    Ok(())
}

pub fn build_comparison_markdown(report: &ComparisonReport) -> String {
    let mut md = String::new();

    md.push_str("# Framework Comparison\n\n");
    md.push_str(&format!(
        "**Generated:** {}\n",
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    md.push_str(&format!(
        "**Family-wise alpha:** {} | **CI level:** {:.0}%\n\n",
        report.alpha,
        report.confidence_level * 100.0
    ));

    md.push_str("| Framework | Runs |\n");
    md.push_str("|-----------|------|\n");
    for (framework, runs) in &report.frameworks {
        md.push_str(&format!("| {} | {} |\n", framework, runs));
    }
    md.push('\n');

    for metric in &report.metrics {
        md.push_str(&format!("## {}\n\n", metric.metric));

        md.push_str("| Framework | Mean | CI |\n");
        md.push_str("|-----------|------|----|\n");
        for (framework, ci) in &metric.intervals {
            md.push_str(&format!(
                "| {} | {:.3} | [{:.3}, {:.3}] |\n",
                framework, ci.mean, ci.lower, ci.upper
            ));
        }
        md.push('\n');

        match &metric.kruskal_wallis {
            KruskalWallis::Test { h, df, p_value } => {
                md.push_str(&format!(
                    "Kruskal-Wallis: H = {:.3}, df = {}, p = {:.4}\n\n",
                    h, df, p_value
                ));
            }
            KruskalWallis::InsufficientGroups { groups } => {
                md.push_str(&format!(
                    "Kruskal-Wallis: skipped ({} group(s), need 3)\n\n",
                    groups
                ));
            }
        }

        if metric.pairwise.is_empty() {
            continue;
        }
        md.push_str(&format!(
            "Pairwise Mann-Whitney U (Dunn-Šidák alpha = {:.4})\n\n",
            metric.corrected_alpha
        ));
        md.push_str("| A | B | U | p | Significant | Cliff's δ | Effect |\n");
        md.push_str("|---|---|---|---|-------------|-----------|--------|\n");
        for pair in &metric.pairwise {
            md.push_str(&format!(
                "| {} | {} | {:.1} | {:.4} | {} | {:.3} | {} |\n",
                pair.a,
                pair.b,
                pair.mann_whitney.u,
                pair.mann_whitney.p_value,
                if pair.significant { "yes" } else { "no" },
                pair.cliffs_delta,
                pair.effect_size
            ));
        }
        md.push('\n');
    }

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::compare_metric;
    use tempfile::TempDir;

    fn report() -> ComparisonReport {
        let groups = BTreeMap::from([
            ("alpha".to_string(), vec![1.0, 2.0, 3.0]),
            ("beta".to_string(), vec![7.0, 8.0, 9.0]),
        ]);
        ComparisonReport {
            generated_at: Utc::now(),
            alpha: 0.05,
            confidence_level: 0.95,
            frameworks: BTreeMap::from([("alpha".to_string(), 3), ("beta".to_string(), 3)]),
            metrics: vec![compare_metric("autr", &groups, 0.05, 200, 0.95).unwrap()],
        }
    }

    #[test]
    fn test_markdown_sections() {
        let md = build_comparison_markdown(&report());
        assert!(md.contains("## autr"));
        assert!(md.contains("skipped (2 group(s), need 3)"));
        assert!(md.contains("| alpha | beta |"));
        assert!(md.contains("large"));
    }

    #[test]
    fn test_writes_both_files() {
        let dir = TempDir::new().unwrap();
        write_comparison(dir.path(), &report()).unwrap();

        let json: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("comparison.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(json["metrics"][0]["metric"], "autr");
        assert_eq!(
            json["metrics"][0]["kruskal_wallis"]["result"],
            "insufficient_groups"
        );
        assert!(dir.path().join("comparison.md").exists());
    }
}
