use crate::config::StoppingRuleConfig;
use crate::error::StatsError;
use crate::metrics::AggregateMetrics;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Seed for the online decision so the same history always decides the same way
pub const BOOTSTRAP_SEED: u64 = 42;

/// Metrics that stay zero until the usage reconciler backfills tokens
pub const TOKEN_METRICS: &[&str] = &[
    "total_tokens_in",
    "total_tokens_out",
    "total_cached_tokens",
    "aei",
];

fn has_tokens(m: &AggregateMetrics) -> bool {
    m.total_tokens_in > 0 || m.total_tokens_out > 0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConfidenceInterval {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn half_width(&self) -> f64 {
        (self.upper - self.lower) / 2.0
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Percentile of sorted data with linear interpolation between ranks
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Percentile bootstrap CI of the mean with a fixed seed
pub fn bootstrap_ci(
    values: &[f64],
    samples: usize,
    level: f64,
) -> Result<ConfidenceInterval, StatsError> {
    let mut rng = StdRng::seed_from_u64(BOOTSTRAP_SEED);
    bootstrap_ci_with_rng(values, samples, level, &mut rng)
}

pub fn bootstrap_ci_with_rng<R: Rng>(
    values: &[f64],
    samples: usize,
    level: f64,
    rng: &mut R,
) -> Result<ConfidenceInterval, StatsError> {
    if values.is_empty() {
        return Err(StatsError::EmptySample);
    }
    if !(level > 0.0 && level < 1.0) {
        return Err(StatsError::InvalidLevel(level));
    }

    let n = values.len();
    let mut means: Vec<f64> = (0..samples.max(1))
        .map(|_| (0..n).map(|_| values[rng.gen_range(0..n)]).sum::<f64>() / n as f64)
        .collect();
    means.sort_by(|a, b| a.total_cmp(b));

    let alpha = 1.0 - level;
    Ok(ConfidenceInterval {
        mean: mean(values),
        lower: percentile(&means, alpha / 2.0),
        upper: percentile(&means, 1.0 - alpha / 2.0),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Continue,
    Stop,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Continue => write!(f, "continue"),
            Decision::Stop => write!(f, "stop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricConvergence {
    pub metric: String,
    pub ci: Option<ConfidenceInterval>,
    pub threshold: f64,
    pub converged: bool,
    /// Runs that contributed a value
    pub samples: usize,
    /// Set when zero placeholders were left out pending token reconciliation
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub awaiting_tokens: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub decision: Decision,
    pub runs_completed: usize,
    pub reason: String,
    pub metrics: Vec<MetricConvergence>,
}

/// Decide whether a framework needs more runs.
///
/// Below `min_runs` the answer is always continue and at `max_runs` always
/// stop. In between, every tracked metric's CI half-width must be within
/// `half_width_fraction * |mean|`.
///
/// Token metrics only count runs whose usage has been reconciled. Until
/// `min_runs` of those exist the metric is not converged.
pub fn check_convergence(history: &[AggregateMetrics], rule: &StoppingRuleConfig) -> ConvergenceReport {
    let runs_completed = history.len();

    if runs_completed < rule.min_runs {
        return ConvergenceReport {
            decision: Decision::Continue,
            runs_completed,
            reason: format!("{} of at least {} runs", runs_completed, rule.min_runs),
            metrics: Vec::new(),
        };
    }
    if runs_completed >= rule.max_runs {
        return ConvergenceReport {
            decision: Decision::Stop,
            runs_completed,
            reason: format!("reached max_runs ({})", rule.max_runs),
            metrics: Vec::new(),
        };
    }

    let metrics: Vec<MetricConvergence> = rule
        .metrics
        .iter()
        .map(|name| {
            let token_metric = TOKEN_METRICS.contains(&name.as_str());
            let sample: Vec<&AggregateMetrics> = history
                .iter()
                .filter(|m| !token_metric || has_tokens(m))
                .collect();
            let awaiting_tokens = sample.len() < runs_completed;

            let values: Option<Vec<f64>> = sample.iter().map(|m| m.value(name)).collect();
            let ci = values
                .filter(|values| values.len() >= rule.min_runs)
                .and_then(|values| {
                    bootstrap_ci(&values, rule.bootstrap_samples, rule.confidence_level).ok()
                });
            let threshold = ci
                .map(|ci| rule.half_width_fraction * ci.mean.abs())
                .unwrap_or(0.0);
            MetricConvergence {
                metric: name.clone(),
                converged: ci.map(|ci| ci.half_width() <= threshold).unwrap_or(false),
                ci,
                threshold,
                samples: sample.len(),
                awaiting_tokens,
            }
        })
        .collect();

    let pending: Vec<String> = metrics
        .iter()
        .filter(|m| !m.converged)
        .map(|m| {
            if m.awaiting_tokens && m.ci.is_none() {
                format!("{} (awaiting token reconciliation)", m.metric)
            } else {
                m.metric.clone()
            }
        })
        .collect();

    let (decision, reason) = if pending.is_empty() {
        (Decision::Stop, "all tracked metrics converged".to_string())
    } else {
        (Decision::Continue, format!("not converged: {}", pending.join(", ")))
    };

    ConvergenceReport {
        decision,
        runs_completed,
        reason,
        metrics,
    }
}
