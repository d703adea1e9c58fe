//! Multinomial Naive Bayes, the probabilistic learner behind the EM quantifier.

use crate::data::{ColumnMap, FeatureMatrix};
use crate::quantifier::QuantifierError;

/// Class ordering of every posterior this crate returns: negative, positive
pub const BINARY_CLASSES: [u8; 2] = [0, 1];

/// A learner that outputs positive-class posteriors
pub trait ProbabilisticLearner: Send + Sync {
    /// Train on labeled rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the training data is unusable.
    fn fit(&mut self, features: &FeatureMatrix, labels: &[u8]) -> Result<(), QuantifierError>;

    /// Posterior `P(y=1|x)` for every row.
    ///
    /// # Errors
    ///
    /// Returns `NotFitted` before training.
    fn predict_positive(&self, features: &FeatureMatrix) -> Result<Vec<f64>, QuantifierError>;
}

/// Fitted model parameters
#[derive(Debug, Clone)]
struct NbModel {
    /// Classes seen in training, ascending
    classes: Vec<u8>,
    class_log_prior: Vec<f64>,
    /// `feature_log_prob[c][f]`
    feature_log_prob: Vec<Vec<f64>>,
    columns: ColumnMap,
}

/// Multinomial Naive Bayes with Lidstone smoothing
#[derive(Debug, Clone)]
pub struct MultinomialNb {
    alpha: f64,
    fit_prior: bool,
    model: Option<NbModel>,
}

impl MultinomialNb {
    /// Create an unfitted learner
    #[must_use]
    pub const fn new(alpha: f64, fit_prior: bool) -> Self {
        Self {
            alpha,
            fit_prior,
            model: None,
        }
    }

    /// Smoothing parameter
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Whether class priors are learned (uniform otherwise)
    #[must_use]
    pub const fn fit_prior(&self) -> bool {
        self.fit_prior
    }

    /// Posteriors for every fitted class, in fitted order
    fn joint_posteriors(model: &NbModel, features: &FeatureMatrix) -> Vec<Vec<f64>> {
        features
            .rows()
            .map(|row| {
                let log_joint: Vec<f64> = model
                    .feature_log_prob
                    .iter()
                    .zip(&model.class_log_prior)
                    .map(|(log_prob, &prior)| {
                        prior
                            + row
                                .iter()
                                .filter_map(|&(f, x)| log_prob.get(f).map(|lp| x * lp))
                                .sum::<f64>()
                    })
                    .collect();
                softmax(&log_joint)
            })
            .collect()
    }
}

impl Default for MultinomialNb {
    fn default() -> Self {
        Self::new(1.0, true)
    }
}

fn softmax(log_values: &[f64]) -> Vec<f64> {
    let max = log_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = log_values.iter().map(|v| (v - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.iter().map(|e| e / total).collect()
}

impl ProbabilisticLearner for MultinomialNb {
    #[allow(clippy::cast_precision_loss)]
    fn fit(&mut self, features: &FeatureMatrix, labels: &[u8]) -> Result<(), QuantifierError> {
        if features.n_rows() != labels.len() {
            return Err(QuantifierError::InvalidTrainingData(format!(
                "{} rows but {} labels",
                features.n_rows(),
                labels.len()
            )));
        }
        if labels.is_empty() {
            return Err(QuantifierError::InvalidTrainingData("no training rows".to_string()));
        }
        if self.alpha.is_nan() || self.alpha < 0.0 {
            return Err(QuantifierError::InvalidTrainingData(format!(
                "alpha must be non-negative, got {}",
                self.alpha
            )));
        }

        let mut classes: Vec<u8> = labels.to_vec();
        classes.sort_unstable();
        classes.dedup();
        let columns = ColumnMap::new(&classes, &BINARY_CLASSES)?;

        let n_features = features.n_features();
        let mut counts = vec![vec![0.0; n_features]; classes.len()];
        let mut docs = vec![0usize; classes.len()];
        for (row, &label) in features.rows().zip(labels) {
            let c = classes.binary_search(&label).unwrap_or_default();
            docs[c] += 1;
            for &(f, x) in row {
                if x < 0.0 {
                    return Err(QuantifierError::InvalidTrainingData(format!(
                        "negative feature value {x} at column {f}"
                    )));
                }
                counts[c][f] += x;
            }
        }

        let feature_log_prob = counts
            .iter()
            .map(|class_counts| {
                let total: f64 = class_counts.iter().sum::<f64>() + self.alpha * n_features as f64;
                class_counts
                    .iter()
                    .map(|&count| ((count + self.alpha) / total).ln())
                    .collect()
            })
            .collect();

        let n = labels.len() as f64;
        let class_log_prior = if self.fit_prior {
            docs.iter().map(|&d| (d as f64 / n).ln()).collect()
        } else {
            vec![-(classes.len() as f64).ln(); classes.len()]
        };

        self.model = Some(NbModel {
            classes,
            class_log_prior,
            feature_log_prob,
            columns,
        });
        Ok(())
    }

    fn predict_positive(&self, features: &FeatureMatrix) -> Result<Vec<f64>, QuantifierError> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| QuantifierError::NotFitted("multinomial naive bayes".to_string()))?;
        let posteriors = Self::joint_posteriors(model, features);
        let ordered = model.columns.reorder(&posteriors)?;
        debug_assert!(model.classes.len() <= BINARY_CLASSES.len());
        Ok(ordered.into_iter().map(|row| row[1]).collect())
    }
}
