//! Quantification error metrics and statistical comparison.
//!
//! Every metric pairs true and estimated prevalences sample by sample and
//! averages over all samples:
//! - MAE, MSE
//! - MKLD: smoothed binary Kullback-Leibler divergence
//! - MNKLD: KLD squashed into [0, 1] via `2 * sigmoid(kld) - 1`
//! - MRAE: smoothed relative absolute error
//!
//! Smoothing follows `smooth(p) = (p + eps) / (1 + 2 * eps)` with
//! `eps = 1 / (2 * sample_size)` unless configured otherwise.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::fmt;
use thiserror::Error;

/// Errors raised while aggregating a metric
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    #[error("Prevalence vectors differ in length: {expected} true vs {actual} estimated")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Cannot aggregate a metric over zero samples")]
    Empty,

    #[error("Invalid metric type: {0}")]
    InvalidMetric(String),
}

/// Supported quantification metrics
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Mean absolute error
    Mae,
    /// Mean squared error
    Mse,
    /// Mean normalized KLD
    Mnkld,
    /// Mean smoothed KLD
    Mkld,
    /// Mean smoothed relative absolute error
    Mrae,
}

impl Metric {
    /// All metrics in reporting order
    pub const ALL: [Self; 5] = [Self::Mae, Self::Mse, Self::Mnkld, Self::Mkld, Self::Mrae];

    /// Name used in result tables
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Mae => "mae",
            Self::Mse => "mse",
            Self::Mnkld => "mnkld",
            Self::Mkld => "mkld",
            Self::Mrae => "mrae",
        }
    }

    /// Aggregate this metric over paired prevalence vectors.
    ///
    /// # Errors
    ///
    /// Returns `LengthMismatch` or `Empty` for unusable inputs.
    pub fn evaluate(self, true_prevs: &[f64], estimated: &[f64], eps: f64) -> Result<f64, MetricError> {
        match self {
            Self::Mae => mae(true_prevs, estimated),
            Self::Mse => mse(true_prevs, estimated),
            Self::Mnkld => mnkld(true_prevs, estimated, eps),
            Self::Mkld => mkld(true_prevs, estimated, eps),
            Self::Mrae => mrae(true_prevs, estimated, eps),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Metric {
    type Err = MetricError;

    /// Parse metric type from string
    ///
    /// # Errors
    ///
    /// Returns `MetricError::InvalidMetric` if the string doesn't match a known metric.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mae" | "ae" => Ok(Self::Mae),
            "mse" | "se" => Ok(Self::Mse),
            "mnkld" | "nkld" => Ok(Self::Mnkld),
            "mkld" | "kld" => Ok(Self::Mkld),
            "mrae" | "rae" => Ok(Self::Mrae),
            _ => Err(MetricError::InvalidMetric(s.to_string())),
        }
    }
}

/// Smoothing constant for samples of the given size
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn smoothing_eps(sample_size: usize) -> f64 {
    1.0 / (2.0 * sample_size.max(1) as f64)
}

/// Move a binary prevalence away from 0 and 1
#[must_use]
pub fn smooth(p: f64, eps: f64) -> f64 {
    (p + eps) / 2.0f64.mul_add(eps, 1.0)
}

/// Smoothed KLD between `{p, 1-p}` and `{p_hat, 1-p_hat}`
#[must_use]
pub fn kld(p: f64, p_hat: f64, eps: f64) -> f64 {
    let sp = smooth(p, eps);
    let sq = smooth(p_hat, eps);
    sp * (sp / sq).ln() + (1.0 - sp) * ((1.0 - sp) / (1.0 - sq)).ln()
}

/// KLD squashed into [0, 1)
#[must_use]
pub fn nkld(p: f64, p_hat: f64, eps: f64) -> f64 {
    let ekld = kld(p, p_hat, eps).exp();
    2.0 * ekld / (1.0 + ekld) - 1.0
}

/// Smoothed relative absolute error `|p_hat - p| / p`
#[must_use]
pub fn rae(p: f64, p_hat: f64, eps: f64) -> f64 {
    let sp = smooth(p, eps);
    (smooth(p_hat, eps) - sp).abs() / sp
}

/// Mean absolute error.
///
/// # Errors
///
/// Returns `LengthMismatch` or `Empty`.
pub fn mae(true_prevs: &[f64], estimated: &[f64]) -> Result<f64, MetricError> {
    mean_of(true_prevs, estimated, |p, q| (q - p).abs())
}

/// Mean squared error.
///
/// # Errors
///
/// Returns `LengthMismatch` or `Empty`.
pub fn mse(true_prevs: &[f64], estimated: &[f64]) -> Result<f64, MetricError> {
    mean_of(true_prevs, estimated, |p, q| (q - p).powi(2))
}

/// Mean smoothed KLD.
///
/// # Errors
///
/// Returns `LengthMismatch` or `Empty`.
pub fn mkld(true_prevs: &[f64], estimated: &[f64], eps: f64) -> Result<f64, MetricError> {
    mean_of(true_prevs, estimated, |p, q| kld(p, q, eps))
}

/// Mean normalized KLD.
///
/// # Errors
///
/// Returns `LengthMismatch` or `Empty`.
pub fn mnkld(true_prevs: &[f64], estimated: &[f64], eps: f64) -> Result<f64, MetricError> {
    mean_of(true_prevs, estimated, |p, q| nkld(p, q, eps))
}

/// Mean smoothed relative absolute error.
///
/// # Errors
///
/// Returns `LengthMismatch` or `Empty`.
pub fn mrae(true_prevs: &[f64], estimated: &[f64], eps: f64) -> Result<f64, MetricError> {
    mean_of(true_prevs, estimated, |p, q| rae(p, q, eps))
}

fn mean_of<F>(true_prevs: &[f64], estimated: &[f64], f: F) -> Result<f64, MetricError>
where
    F: Fn(f64, f64) -> f64,
{
    if true_prevs.len() != estimated.len() {
        return Err(MetricError::LengthMismatch {
            expected: true_prevs.len(),
            actual: estimated.len(),
        });
    }
    if true_prevs.is_empty() {
        return Err(MetricError::Empty);
    }
    let values: Vec<f64> = true_prevs.iter().zip(estimated).map(|(&p, &q)| f(p, q)).collect();
    Ok(compute_mean(&values))
}

/// Per-sample absolute errors (input to the statistical comparisons)
#[must_use]
pub fn absolute_errors(true_prevs: &[f64], estimated: &[f64]) -> Vec<f64> {
    true_prevs
        .iter()
        .zip(estimated)
        .map(|(p, q)| (q - p).abs())
        .collect()
}

/// Compute mean of samples
#[allow(clippy::cast_precision_loss)]
pub(crate) fn compute_mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Compute standard deviation of samples
#[allow(clippy::cast_precision_loss)]
fn compute_std(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let mean = compute_mean(samples);
    let variance =
        samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (samples.len() - 1) as f64;
    variance.sqrt()
}

/// Statistical configuration for comparisons
#[derive(Debug, Clone)]
pub struct StatConfig {
    /// Number of bootstrap resamples
    pub bootstrap_n: usize,
    /// Confidence level (e.g., 0.95)
    pub confidence: f64,
    /// Significance threshold
    pub alpha: f64,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            bootstrap_n: 10_000,
            confidence: 0.95,
            alpha: 0.05,
            seed: 42,
        }
    }
}

/// Bootstrap confidence interval of the mean (percentile method)
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]
pub fn bootstrap_ci(samples: &[f64], config: &StatConfig) -> (f64, f64) {
    if samples.len() < 2 || config.bootstrap_n == 0 {
        let mean = compute_mean(samples);
        return (mean, mean);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut bootstrap_means = Vec::with_capacity(config.bootstrap_n);

    for _ in 0..config.bootstrap_n {
        let resample_sum: f64 = (0..samples.len())
            .map(|_| {
                let idx = rng.next_u64() as usize % samples.len();
                samples[idx]
            })
            .sum();
        bootstrap_means.push(resample_sum / samples.len() as f64);
    }

    bootstrap_means.sort_by(|a: &f64, b: &f64| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let alpha = 1.0 - config.confidence;
    let lower_idx = (config.bootstrap_n as f64 * (alpha / 2.0)).floor() as usize;
    let upper_idx = (config.bootstrap_n as f64 * (1.0 - alpha / 2.0)).ceil() as usize;

    let lower = bootstrap_means.get(lower_idx).copied().unwrap_or(0.0);
    let upper = bootstrap_means
        .get(upper_idx.min(bootstrap_means.len() - 1))
        .copied()
        .unwrap_or(0.0);

    (lower, upper)
}

/// Result of a significance test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceResult {
    /// t-statistic
    pub t_statistic: f64,
    /// p-value
    pub p_value: f64,
    /// Degrees of freedom
    pub degrees_of_freedom: f64,
    /// Is result significant at the given alpha?
    pub is_significant: bool,
    /// Cohen's d effect size
    pub cohens_d: f64,
    /// Effect size interpretation
    pub effect_interpretation: String,
}

/// Paired t-test over per-sample errors of two estimators
///
/// Returns `None` if samples are too small, unequal, or the differences
/// have no variance.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn paired_t_test(samples_a: &[f64], samples_b: &[f64], alpha: f64) -> Option<SignificanceResult> {
    if samples_a.len() != samples_b.len() || samples_a.len() < 2 {
        return None;
    }

    let n = samples_a.len();
    let differences: Vec<f64> = samples_a
        .iter()
        .zip(samples_b.iter())
        .map(|(a, b)| a - b)
        .collect();

    let mean_diff = compute_mean(&differences);
    let std_diff = compute_std(&differences);

    if std_diff < f64::EPSILON {
        return None;
    }

    let t_statistic = mean_diff / (std_diff / (n as f64).sqrt());
    let df = (n - 1) as f64;

    let t_dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p_value = 2.0 * (1.0 - t_dist.cdf(t_statistic.abs()));

    let cohens_d = mean_diff / std_diff;
    let effect_interpretation = interpret_cohens_d(cohens_d);

    Some(SignificanceResult {
        t_statistic,
        p_value,
        degrees_of_freedom: df,
        is_significant: p_value < alpha,
        cohens_d,
        effect_interpretation,
    })
}

/// Apply Bonferroni correction for multiple comparisons
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bonferroni_correction(alpha: f64, num_comparisons: usize) -> f64 {
    if num_comparisons == 0 {
        return alpha;
    }
    alpha / num_comparisons as f64
}

/// Interpret Cohen's d effect size
fn interpret_cohens_d(d: f64) -> String {
    let abs_d = d.abs();
    if abs_d < 0.2 {
        "negligible".to_string()
    } else if abs_d < 0.5 {
        "small".to_string()
    } else if abs_d < 0.8 {
        "medium".to_string()
    } else {
        "large".to_string()
    }
}

#[cfg(test)]
#[allow(
    clippy::float_cmp,
    clippy::suboptimal_flops,
    clippy::cast_precision_loss,
    clippy::unwrap_used
)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const EPS: f64 = 0.001;

    #[test]
    fn test_constant_estimator_mae() {
        let truth = [0.0, 0.25, 0.5, 0.75, 1.0];
        let constant = [0.5; 5];
        // (0.5 + 0.25 + 0 + 0.25 + 0.5) / 5
        assert!((mae(&truth, &constant).unwrap() - 0.3).abs() < 1e-12);
        // (0.25 + 0.0625 + 0 + 0.0625 + 0.25) / 5
        assert!((mse(&truth, &constant).unwrap() - 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_self_comparison_is_zero() {
        let prevs: Vec<f64> = (0..=20).map(|k| f64::from(k) / 20.0).collect();
        assert!(mae(&prevs, &prevs).unwrap().abs() < f64::EPSILON);
        assert!(mse(&prevs, &prevs).unwrap().abs() < f64::EPSILON);
        assert!(mkld(&prevs, &prevs, EPS).unwrap().abs() < 1e-15);
        assert!(mnkld(&prevs, &prevs, EPS).unwrap().abs() < 1e-15);
        assert!(mrae(&prevs, &prevs, EPS).unwrap().abs() < 1e-15);
    }

    #[test]
    fn test_kld_finite_at_boundaries() {
        for (p, q) in [(0.0, 1.0), (1.0, 0.0), (0.0, 0.0), (1.0, 1.0)] {
            let value = kld(p, q, EPS);
            assert!(value.is_finite(), "kld({p}, {q}) = {value}");
            assert!(value >= 0.0);
        }
    }

    #[test]
    fn test_nkld_bounded() {
        for (p, q) in [(0.0, 1.0), (0.3, 0.31), (0.9, 0.1)] {
            let value = nkld(p, q, EPS);
            assert!((0.0..=1.0).contains(&value));
        }
        assert!(nkld(0.0, 1.0, EPS) > nkld(0.3, 0.31, EPS));
    }

    #[test]
    fn test_rae_defined_at_zero_prevalence() {
        let value = rae(0.0, 0.1, EPS);
        assert!(value.is_finite());
        assert!(value > 0.0);
    }

    #[test]
    fn test_rae_monotone_in_error() {
        for p in [0.0, 0.05, 0.5, 0.9] {
            let mut previous = -1.0;
            for k in 0..=10 {
                let p_hat = (p + f64::from(k) * 0.01).min(1.0);
                let value = rae(p, p_hat, EPS);
                assert!(value >= previous, "rae not monotone at p={p}");
                previous = value;
            }
        }
        assert!(rae(0.2, 0.4, EPS) > rae(0.2, 0.3, EPS));
        assert!(rae(0.2, 0.0, EPS) > rae(0.2, 0.1, EPS));
    }

    #[test]
    fn test_metric_length_mismatch() {
        assert_eq!(
            mae(&[0.1, 0.2], &[0.1]),
            Err(MetricError::LengthMismatch {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(mkld(&[], &[], EPS), Err(MetricError::Empty));
    }

    #[test]
    fn test_metric_evaluate_dispatch() {
        let truth = [0.2, 0.4];
        let est = [0.3, 0.1];
        assert_eq!(
            Metric::Mae.evaluate(&truth, &est, EPS).unwrap(),
            mae(&truth, &est).unwrap()
        );
        assert_eq!(
            Metric::Mrae.evaluate(&truth, &est, EPS).unwrap(),
            mrae(&truth, &est, EPS).unwrap()
        );
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!(Metric::from_str("MAE").unwrap(), Metric::Mae);
        assert_eq!(Metric::from_str("nkld").unwrap(), Metric::Mnkld);
        assert_eq!(Metric::from_str("mrae").unwrap(), Metric::Mrae);
        assert!(matches!(
            Metric::from_str("f1"),
            Err(MetricError::InvalidMetric(_))
        ));
        assert_eq!(Metric::Mkld.to_string(), "mkld");
    }

    #[test]
    fn test_smoothing_eps() {
        assert!((smoothing_eps(500) - 0.001).abs() < f64::EPSILON);
        assert!((smooth(0.0, 0.001) - 0.001 / 1.002).abs() < 1e-15);
    }

    #[test]
    fn test_bootstrap_ci_reproducible() {
        let samples: Vec<f64> = (0..100).map(|i| 0.1 + (i as f64 * 0.001)).collect();
        let config = StatConfig::default();
        assert_eq!(bootstrap_ci(&samples, &config), bootstrap_ci(&samples, &config));
    }

    #[test]
    fn test_bootstrap_ci_contains_mean() {
        let samples: Vec<f64> = (0..1000).map(|i| (i % 17) as f64 * 0.01).collect();
        let (lower, upper) = bootstrap_ci(&samples, &StatConfig::default());
        let mean = compute_mean(&samples);
        assert!(lower <= mean && mean <= upper);
    }

    #[test]
    fn test_bootstrap_ci_single_sample() {
        let (lower, upper) = bootstrap_ci(&[0.05], &StatConfig::default());
        assert!((lower - 0.05).abs() < f64::EPSILON);
        assert!((upper - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_paired_t_test_detects_worse_estimator() {
        let errors_a: Vec<f64> = (0..100).map(|i| 0.10 + ((i % 7) as f64 * 0.01)).collect();
        let errors_b: Vec<f64> = (0..100).map(|i| 0.02 + ((i % 5) as f64 * 0.005)).collect();
        let result = paired_t_test(&errors_a, &errors_b, 0.05).unwrap();
        assert!(result.is_significant);
        assert!(result.t_statistic > 0.0);
    }

    #[test]
    fn test_paired_t_test_degenerate() {
        assert!(paired_t_test(&[0.1, 0.2], &[0.1], 0.05).is_none());
        assert!(paired_t_test(&[0.1; 10], &[0.05; 10], 0.05).is_none());
    }

    #[test]
    fn test_bonferroni_correction() {
        assert!((bonferroni_correction(0.05, 5) - 0.01).abs() < f64::EPSILON);
        assert!((bonferroni_correction(0.05, 0) - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cohens_d_interpretation() {
        assert_eq!(interpret_cohens_d(0.1), "negligible");
        assert_eq!(interpret_cohens_d(0.3), "small");
        assert_eq!(interpret_cohens_d(0.6), "medium");
        assert_eq!(interpret_cohens_d(-0.9), "large");
    }
}
