//! Expectation-maximization prevalence re-estimation.
//!
//! Starting from the training prior, every pass re-weights the learner's
//! posteriors by the ratio between the current and the training prior and
//! takes their mean as the next prior. The loop stops once the prior moves by
//! less than `epsilon`; hitting `max_iterations` first yields a stalled
//! estimate rather than an error.

use crate::data::FeatureMatrix;
use crate::naive_bayes::{MultinomialNb, ProbabilisticLearner};
use crate::quantifier::{FeatureQuantifier, PrevalenceEstimate, QuantifierError};
use serde::{Deserialize, Serialize};

/// Stopping criteria
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmConfig {
    /// Convergence threshold on the prior update
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Iteration cap
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

const fn default_epsilon() -> f64 {
    1e-6
}

const fn default_max_iterations() -> usize {
    100
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            max_iterations: default_max_iterations(),
        }
    }
}

/// Result of one EM run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmOutcome {
    /// Final prior
    pub prevalence: f64,
    /// Passes that moved the prior by at least `epsilon`
    pub iterations: usize,
    /// False when the cap was reached first
    pub converged: bool,
}

impl EmOutcome {
    /// As a prevalence estimate carrying the stall flag
    #[must_use]
    pub fn estimate(&self) -> PrevalenceEstimate {
        if self.converged {
            PrevalenceEstimate::new(self.prevalence)
        } else {
            PrevalenceEstimate::stalled(self.prevalence)
        }
    }
}

/// Re-estimate the prevalence of a sample from posteriors computed under
/// `train_prior`.
///
/// # Errors
///
/// Returns `EmptySample` for no posteriors and `InvalidTrainingData` if the
/// training prior is not strictly inside (0, 1).
#[allow(clippy::cast_precision_loss)]
pub fn expectation_maximization(
    posteriors: &[f64],
    train_prior: f64,
    config: &EmConfig,
) -> Result<EmOutcome, QuantifierError> {
    if posteriors.is_empty() {
        return Err(QuantifierError::EmptySample);
    }
    if train_prior.is_nan() || train_prior <= 0.0 || train_prior >= 1.0 {
        return Err(QuantifierError::InvalidTrainingData(format!(
            "training prevalence must lie in (0, 1), got {train_prior}"
        )));
    }

    let n = posteriors.len() as f64;
    let mut prior = train_prior;
    let mut iterations = 0;
    for _ in 0..config.max_iterations {
        let pos_ratio = prior / train_prior;
        let neg_ratio = (1.0 - prior) / (1.0 - train_prior);
        let next = posteriors
            .iter()
            .map(|&p| {
                let pos = pos_ratio * p;
                let neg = neg_ratio * (1.0 - p);
                let total = pos + neg;
                // both weights vanish only at a degenerate prior
                if total > 0.0 {
                    pos / total
                } else {
                    p
                }
            })
            .sum::<f64>()
            / n;

        let delta = (next - prior).abs();
        prior = next;
        if delta < config.epsilon {
            return Ok(EmOutcome {
                prevalence: prior,
                iterations,
                converged: true,
            });
        }
        iterations += 1;
    }

    Ok(EmOutcome {
        prevalence: prior,
        iterations,
        converged: false,
    })
}

/// EM on top of a probabilistic learner (Multinomial NB by default)
#[derive(Debug, Clone)]
pub struct EmQuantifier<L = MultinomialNb> {
    learner: L,
    config: EmConfig,
    train_prior: Option<f64>,
}

impl<L: ProbabilisticLearner> EmQuantifier<L> {
    /// Wrap an unfitted learner
    pub const fn new(learner: L, config: EmConfig) -> Self {
        Self {
            learner,
            config,
            train_prior: None,
        }
    }

    /// Prevalence of the training labels, once fitted
    pub const fn train_prior(&self) -> Option<f64> {
        self.train_prior
    }

    /// Run EM and keep the iteration details.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before training, or any learner error.
    pub fn run(&self, features: &FeatureMatrix) -> Result<EmOutcome, QuantifierError> {
        let train_prior = self
            .train_prior
            .ok_or_else(|| QuantifierError::NotFitted("em".to_string()))?;
        let posteriors = self.learner.predict_positive(features)?;
        expectation_maximization(&posteriors, train_prior, &self.config)
    }
}

impl<L: ProbabilisticLearner> FeatureQuantifier for EmQuantifier<L> {
    #[allow(clippy::cast_precision_loss)]
    fn fit(&mut self, features: &FeatureMatrix, labels: &[u8]) -> Result<(), QuantifierError> {
        if labels.is_empty() {
            return Err(QuantifierError::InvalidTrainingData("no training rows".to_string()));
        }
        let prior = labels.iter().filter(|&&y| y == 1).count() as f64 / labels.len() as f64;
        if prior <= 0.0 || prior >= 1.0 {
            return Err(QuantifierError::InvalidTrainingData(
                "training labels must contain both classes".to_string(),
            ));
        }
        self.learner.fit(features, labels)?;
        self.train_prior = Some(prior);
        Ok(())
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<PrevalenceEstimate, QuantifierError> {
        Ok(self.run(features)?.estimate())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Learner that returns a fixed posterior per row from its first feature
    struct Oracle;

    impl ProbabilisticLearner for Oracle {
        fn fit(&mut self, _: &FeatureMatrix, _: &[u8]) -> Result<(), QuantifierError> {
            Ok(())
        }

        fn predict_positive(&self, features: &FeatureMatrix) -> Result<Vec<f64>, QuantifierError> {
            Ok(features
                .rows()
                .map(|row| row.iter().find(|&&(f, _)| f == 0).map_or(0.0, |&(_, v)| v))
                .collect())
        }
    }

    #[test]
    fn test_perfect_classifier_converges_in_one_iteration() {
        // 30 positives in a sample of 100, training prior 0.5
        let posteriors: Vec<f64> = (0..100).map(|i| if i < 30 { 1.0 } else { 0.0 }).collect();
        let out = expectation_maximization(&posteriors, 0.5, &EmConfig::default()).unwrap();
        assert!(out.converged);
        assert_eq!(out.iterations, 1);
        assert!((out.prevalence - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_em_moves_toward_sample_composition() {
        // calibrated but uncertain posteriors, shifted test prevalence
        let mut posteriors = vec![0.8; 30];
        posteriors.extend(vec![0.2; 70]);
        let config = EmConfig {
            epsilon: 1e-6,
            max_iterations: 1000,
        };
        let out = expectation_maximization(&posteriors, 0.5, &config).unwrap();
        assert!(out.converged);
        let mean = posteriors.iter().sum::<f64>() / 100.0;
        assert!(out.prevalence < mean);
        assert!((0.0..=1.0).contains(&out.prevalence));
    }

    #[test]
    fn test_em_stall_is_flagged() {
        let mut posteriors = vec![0.8; 20];
        posteriors.extend(vec![0.2; 80]);
        let config = EmConfig {
            epsilon: 1e-12,
            max_iterations: 2,
        };
        let out = expectation_maximization(&posteriors, 0.5, &config).unwrap();
        assert!(!out.converged);
        assert_eq!(out.iterations, 2);
        let estimate = out.estimate();
        assert!(!estimate.converged());
        assert!((0.0..=1.0).contains(&estimate.prevalence()));
    }

    #[test]
    fn test_em_rejects_degenerate_inputs() {
        let config = EmConfig::default();
        assert!(matches!(
            expectation_maximization(&[], 0.5, &config),
            Err(QuantifierError::EmptySample)
        ));
        assert!(matches!(
            expectation_maximization(&[0.4], 0.0, &config),
            Err(QuantifierError::InvalidTrainingData(_))
        ));
        assert!(matches!(
            expectation_maximization(&[0.4], 1.0, &config),
            Err(QuantifierError::InvalidTrainingData(_))
        ));
    }

    #[test]
    fn test_em_all_negative_sample() {
        let out = expectation_maximization(&[0.0; 50], 0.4, &EmConfig::default()).unwrap();
        assert!(out.converged);
        assert!(out.prevalence.abs() < 1e-12);
    }

    #[test]
    fn test_em_quantifier_fit_predict() {
        let train = FeatureMatrix::from_dense(&[vec![1.0], vec![0.0], vec![1.0], vec![0.0]]);
        let mut em = EmQuantifier::new(Oracle, EmConfig::default());
        assert!(matches!(em.predict(&train), Err(QuantifierError::NotFitted(_))));
        em.fit(&train, &[1, 0, 1, 0]).unwrap();
        assert_eq!(em.train_prior(), Some(0.5));

        let test = FeatureMatrix::from_dense(&[vec![1.0], vec![0.0], vec![0.0], vec![0.0]]);
        let estimate = em.predict(&test).unwrap();
        assert!(estimate.converged());
        assert!((estimate.prevalence() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_em_quantifier_requires_both_classes() {
        let train = FeatureMatrix::from_dense(&[vec![1.0], vec![1.0]]);
        let mut em = EmQuantifier::new(Oracle, EmConfig::default());
        assert!(matches!(
            em.fit(&train, &[1, 1]),
            Err(QuantifierError::InvalidTrainingData(_))
        ));
    }

    #[test]
    fn test_em_with_naive_bayes() {
        let dense: Vec<Vec<f64>> = (0..40)
            .map(|i| if i % 2 == 0 { vec![3.0, 0.0, 1.0] } else { vec![0.0, 3.0, 1.0] })
            .collect();
        let labels: Vec<u8> = (0..40).map(|i| u8::from(i % 2 == 0)).collect();
        let train = FeatureMatrix::from_dense(&dense);
        let mut em = EmQuantifier::new(MultinomialNb::default(), EmConfig::default());
        em.fit(&train, &labels).unwrap();

        let mut test_rows = vec![vec![3.0, 0.0, 1.0]; 8];
        test_rows.extend(vec![vec![0.0, 3.0, 1.0]; 32]);
        let estimate = em.predict(&FeatureMatrix::from_dense(&test_rows)).unwrap();
        assert!((estimate.prevalence() - 0.2).abs() < 0.05);
    }
}
