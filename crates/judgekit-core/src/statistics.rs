//! Statistical kernels shared by the aggregator, the paired comparator and
//! the reliability engine.
//!
//! Confidence intervals for means use the normal approximation
//! (mean ± 1.96·SE, SE = sample std / √n). Proportions use the Wilson score
//! interval, and win/loss significance uses the exact two-sided binomial
//! test at p = 0.5.

use serde::{Deserialize, Serialize};

/// z-value for a two-sided 95% interval.
pub const Z_95: f64 = 1.96;

/// Mean, spread and 95% confidence interval of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanInterval {
    pub n: usize,
    pub mean: f64,
    /// Sample standard deviation (n − 1 denominator).
    pub std: f64,
    pub se: f64,
    pub ci95_low: f64,
    pub ci95_high: f64,
}

impl MeanInterval {
    /// Half the width of the confidence interval.
    pub fn half_width(&self) -> f64 {
        ((self.ci95_high - self.ci95_low) / 2.0).max(0.0)
    }

    /// Whether the interval lies entirely on one side of zero.
    pub fn excludes_zero(&self) -> bool {
        self.ci95_low > 0.0 || self.ci95_high < 0.0
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; 0 when fewer than two values.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (ss / (values.len() - 1) as f64).sqrt()
}

/// Standard error from a standard deviation; 0 when n ≤ 1.
pub fn standard_error(std: f64, n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    std / (n as f64).sqrt()
}

/// Summarize `values` with a 95% CI clamped to `[lo, hi]`.
pub fn mean_interval(values: &[f64], lo: f64, hi: f64) -> MeanInterval {
    let n = values.len();
    let m = mean(values);
    let std = sample_std(values);
    let se = standard_error(std, n);
    MeanInterval {
        n,
        mean: m,
        std,
        se,
        ci95_low: (m - Z_95 * se).clamp(lo, hi),
        ci95_high: (m + Z_95 * se).clamp(lo, hi),
    }
}

/// Exact two-sided binomial test of `wins` against `losses` under p = 0.5.
///
/// The smaller tail P(X ≤ min(k, n − k)) is summed from the PMF in log space
/// and doubled. Because the tail is taken on the smaller side, the result is
/// identical for (k, n − k) and (n − k, k). Returns 1.0 when n = 0.
pub fn binomial_two_sided_p(wins: u64, losses: u64) -> f64 {
    let n = wins + losses;
    if n == 0 {
        return 1.0;
    }
    let m = wins.min(losses);
    let ln_half_n = n as f64 * std::f64::consts::LN_2;

    let mut ln_comb = 0.0f64; // ln C(n, 0)
    let mut tail = 0.0f64;
    for i in 0..=m {
        if i > 0 {
            ln_comb += ((n - i + 1) as f64).ln() - (i as f64).ln();
        }
        tail += (ln_comb - ln_half_n).exp();
    }
    (2.0 * tail).clamp(0.0, 1.0)
}

/// Wilson score interval for `successes` out of `n` at the given z.
/// Returns (0, 0) when n = 0.
pub fn wilson_interval(successes: u64, n: u64, z: f64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 0.0);
    }
    let n_f = n as f64;
    let p_hat = successes as f64 / n_f;
    let z2 = z * z;
    let denom = 1.0 + z2 / n_f;
    let center = (p_hat + z2 / (2.0 * n_f)) / denom;
    let half = z * (p_hat * (1.0 - p_hat) / n_f + z2 / (4.0 * n_f * n_f)).max(0.0).sqrt() / denom;
    ((center - half).max(0.0), (center + half).min(1.0))
}

/// Outcome of one paired comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Loss,
    Tie,
}

/// Classify a delta, treating |delta| ≤ `epsilon` as a tie.
pub fn classify_delta(delta: f64, epsilon: f64) -> Outcome {
    if delta > epsilon {
        Outcome::Win
    } else if delta < -epsilon {
        Outcome::Loss
    } else {
        Outcome::Tie
    }
}
