//! Offline comparison of frameworks once collection has stopped

use super::special::{chi_square_sf, normal_two_sided_p};
use super::stopping::mean;
use crate::error::StatsError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;

/// Seed for report bootstraps, distinct from the online decision
pub const REPORT_SEED: u64 = 1729;

/// Ranks (1-based, ties averaged) and the tie term Σ(t³ - t)
fn rank_with_ties(values: &[f64]) -> (Vec<f64>, f64) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut ties = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let avg = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = avg;
        }
        let t = (j - i + 1) as f64;
        ties += t * t * t - t;
        i = j + 1;
    }
    (ranks, ties)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum KruskalWallis {
    Test { h: f64, df: usize, p_value: f64 },
    /// Fewer than three groups; the omnibus test is not meaningful
    InsufficientGroups { groups: usize },
}

/// Kruskal-Wallis H test with tie correction and chi-square p-value
pub fn kruskal_wallis(groups: &[&[f64]]) -> Result<KruskalWallis, StatsError> {
    if groups.len() < 3 {
        return Ok(KruskalWallis::InsufficientGroups {
            groups: groups.len(),
        });
    }
    if groups.iter().any(|g| g.is_empty()) {
        return Err(StatsError::EmptySample);
    }

    let pooled: Vec<f64> = groups.iter().flat_map(|g| g.iter().copied()).collect();
    let n = pooled.len() as f64;
    let (ranks, ties) = rank_with_ties(&pooled);

    let mut offset = 0;
    let mut sum = 0.0;
    for group in groups {
        let rank_sum: f64 = ranks[offset..offset + group.len()].iter().sum();
        sum += rank_sum * rank_sum / group.len() as f64;
        offset += group.len();
    }

    let mut h = 12.0 / (n * (n + 1.0)) * sum - 3.0 * (n + 1.0);
    let correction = 1.0 - ties / (n * n * n - n);
    if correction > 0.0 {
        h /= correction;
    }
    let df = groups.len() - 1;

    Ok(KruskalWallis::Test {
        h,
        df,
        p_value: chi_square_sf(h, df as f64),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MannWhitney {
    pub u: f64,
    pub z: f64,
    pub p_value: f64,
}

/// Two-sided Mann-Whitney U, normal approximation with tie and continuity correction
pub fn mann_whitney_u(a: &[f64], b: &[f64]) -> Result<MannWhitney, StatsError> {
    if a.is_empty() || b.is_empty() {
        return Err(StatsError::EmptySample);
    }
    let n1 = a.len() as f64;
    let n2 = b.len() as f64;
    let pooled: Vec<f64> = a.iter().chain(b).copied().collect();
    let n = n1 + n2;
    let (ranks, ties) = rank_with_ties(&pooled);

    let r1: f64 = ranks[..a.len()].iter().sum();
    let u = r1 - n1 * (n1 + 1.0) / 2.0;
    let mu = n1 * n2 / 2.0;
    let sigma = (n1 * n2 / 12.0 * ((n + 1.0) - ties / (n * (n - 1.0)))).sqrt();

    if sigma == 0.0 || !sigma.is_finite() {
        return Ok(MannWhitney {
            u,
            z: 0.0,
            p_value: 1.0,
        });
    }

    let z = ((u - mu).abs() - 0.5).max(0.0) / sigma;
    Ok(MannWhitney {
        u,
        z,
        p_value: normal_two_sided_p(z),
    })
}

/// Per-comparison alpha that keeps the family-wise rate at `alpha` over `m` tests
pub fn dunn_sidak_alpha(alpha: f64, m: usize) -> f64 {
    if m == 0 {
        return alpha;
    }
    1.0 - (1.0 - alpha).powf(1.0 / m as f64)
}

/// (#(a > b) - #(a < b)) / (|a| * |b|)
pub fn cliffs_delta(a: &[f64], b: &[f64]) -> Result<f64, StatsError> {
    if a.is_empty() || b.is_empty() {
        return Err(StatsError::EmptySample);
    }
    let mut dominance: i64 = 0;
    for x in a {
        for y in b {
            if x > y {
                dominance += 1;
            } else if x < y {
                dominance -= 1;
            }
        }
    }
    Ok(dominance as f64 / (a.len() * b.len()) as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectSize {
    Negligible,
    Small,
    Medium,
    Large,
}

impl EffectSize {
    pub fn from_delta(delta: f64) -> Self {
        let d = delta.abs();
        if d < 0.147 {
            EffectSize::Negligible
        } else if d < 0.33 {
            EffectSize::Small
        } else if d < 0.474 {
            EffectSize::Medium
        } else {
            EffectSize::Large
        }
    }
}

impl std::fmt::Display for EffectSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffectSize::Negligible => write!(f, "negligible"),
            EffectSize::Small => write!(f, "small"),
            EffectSize::Medium => write!(f, "medium"),
            EffectSize::Large => write!(f, "large"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeanInterval {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Report bootstrap of the mean: nearest-rank percentiles over `samples`
/// resamples drawn from the caller's generator.
pub fn bootstrap_mean_ci<R: Rng>(
    values: &[f64],
    samples: usize,
    level: f64,
    rng: &mut R,
) -> Result<MeanInterval, StatsError> {
    if values.is_empty() {
        return Err(StatsError::EmptySample);
    }
    if !(level > 0.0 && level < 1.0) {
        return Err(StatsError::InvalidLevel(level));
    }

    let n = values.len();
    let samples = samples.max(1);
    let mut means = Vec::with_capacity(samples);
    for _ in 0..samples {
        let mut total = 0.0;
        for _ in 0..n {
            total += values[rng.gen_range(0..n)];
        }
        means.push(total / n as f64);
    }
    means.sort_by(|a, b| a.total_cmp(b));

    let tail = (1.0 - level) / 2.0;
    let lower_idx = ((tail * samples as f64).floor() as usize).min(samples - 1);
    let upper_idx = (((1.0 - tail) * samples as f64).ceil() as usize)
        .saturating_sub(1)
        .min(samples - 1);

    Ok(MeanInterval {
        mean: mean(values),
        lower: means[lower_idx],
        upper: means[upper_idx],
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairwiseComparison {
    pub a: String,
    pub b: String,
    pub mann_whitney: MannWhitney,
    pub significant: bool,
    pub cliffs_delta: f64,
    pub effect_size: EffectSize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricComparison {
    pub metric: String,
    pub intervals: BTreeMap<String, MeanInterval>,
    pub kruskal_wallis: KruskalWallis,
    pub corrected_alpha: f64,
    pub pairwise: Vec<PairwiseComparison>,
}

/// Omnibus test, corrected pairwise tests, effect sizes and per-group CIs
/// for one metric. Groups with no values are left out.
pub fn compare_metric(
    metric: &str,
    groups: &BTreeMap<String, Vec<f64>>,
    alpha: f64,
    bootstrap_samples: usize,
    level: f64,
) -> Result<MetricComparison, StatsError> {
    let groups: Vec<(&String, &Vec<f64>)> = groups.iter().filter(|(_, v)| !v.is_empty()).collect();
    let mut rng = StdRng::seed_from_u64(REPORT_SEED);

    let mut intervals = BTreeMap::new();
    for (name, values) in &groups {
        intervals.insert(
            (*name).clone(),
            bootstrap_mean_ci(values, bootstrap_samples, level, &mut rng)?,
        );
    }

    let slices: Vec<&[f64]> = groups.iter().map(|(_, v)| v.as_slice()).collect();
    let kruskal_wallis = kruskal_wallis(&slices)?;

    let pairs = groups.len() * groups.len().saturating_sub(1) / 2;
    let corrected_alpha = dunn_sidak_alpha(alpha, pairs);

    let mut pairwise = Vec::with_capacity(pairs);
    for (i, (name_a, a)) in groups.iter().enumerate() {
        for (name_b, b) in groups.iter().skip(i + 1) {
            let mann_whitney = mann_whitney_u(a, b)?;
            let delta = cliffs_delta(a, b)?;
            pairwise.push(PairwiseComparison {
                a: (*name_a).clone(),
                b: (*name_b).clone(),
                significant: mann_whitney.p_value < corrected_alpha,
                mann_whitney,
                cliffs_delta: delta,
                effect_size: EffectSize::from_delta(delta),
            });
        }
    }

    Ok(MetricComparison {
        metric: metric.to_string(),
        intervals,
        kruskal_wallis,
        corrected_alpha,
        pairwise,
    })
}
