//! Estimator interfaces shared by every quantification method.
//!
//! A [`Quantifier`] maps a [`Sample`] to a prevalence estimate. Methods that
//! need raw features instead of classifier outputs implement
//! [`FeatureQuantifier`] and are bridged to samples by [`SampledQuantifier`].

use crate::data::{DataError, FeatureMatrix};
use crate::sampling::Sample;
use crate::subprocess::ExternalError;
use thiserror::Error;

/// Errors raised by estimators
#[derive(Error, Debug)]
pub enum QuantifierError {
    #[error("Cannot estimate prevalence of an empty sample")]
    EmptySample,

    #[error("Item id {id} outside the source set of {len} items")]
    IdOutOfRange { id: usize, len: usize },

    #[error("Model used before fit: {0}")]
    NotFitted(String),

    #[error("Training data unusable: {0}")]
    InvalidTrainingData(String),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    External(#[from] ExternalError),
}

/// A prevalence estimate, always inside [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrevalenceEstimate {
    prevalence: f64,
    converged: bool,
}

impl PrevalenceEstimate {
    /// Estimate from a raw value, clamped into [0, 1]; NaN maps to 0.
    #[must_use]
    pub fn new(raw: f64) -> Self {
        Self {
            prevalence: clamp_unit(raw),
            converged: true,
        }
    }

    /// Estimate produced by an iterative method that hit its iteration cap
    #[must_use]
    pub fn stalled(raw: f64) -> Self {
        Self {
            prevalence: clamp_unit(raw),
            converged: false,
        }
    }

    /// The estimated prevalence
    #[must_use]
    pub const fn prevalence(&self) -> f64 {
        self.prevalence
    }

    /// False when an iterative estimator stopped without converging
    #[must_use]
    pub const fn converged(&self) -> bool {
        self.converged
    }
}

fn clamp_unit(raw: f64) -> f64 {
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 1.0)
    }
}

/// Prevalence estimator over samples
pub trait Quantifier: Send + Sync {
    /// Method name used in result tables
    fn name(&self) -> &str;

    /// Estimate the prevalence of one sample.
    ///
    /// # Errors
    ///
    /// Returns an error if the sample cannot be estimated.
    fn quantify(&self, sample: &Sample) -> Result<PrevalenceEstimate, QuantifierError>;
}

/// Estimator trained on and applied to raw feature rows
pub trait FeatureQuantifier: Send + Sync {
    /// Train on labeled rows.
    ///
    /// # Errors
    ///
    /// Returns an error if training fails.
    fn fit(&mut self, features: &FeatureMatrix, labels: &[u8]) -> Result<(), QuantifierError>;

    /// Estimate the prevalence of a set of rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the model is not fitted or prediction fails.
    fn predict(&self, features: &FeatureMatrix) -> Result<PrevalenceEstimate, QuantifierError>;
}

/// Applies a fitted [`FeatureQuantifier`] to the rows a sample selects
pub struct SampledQuantifier<'a, Q> {
    name: String,
    model: Q,
    features: &'a FeatureMatrix,
}

impl<'a, Q: FeatureQuantifier> SampledQuantifier<'a, Q> {
    /// Wrap a fitted model; `features` holds the rows sample ids refer to
    pub fn new(name: impl Into<String>, model: Q, features: &'a FeatureMatrix) -> Self {
        Self {
            name: name.into(),
            model,
            features,
        }
    }

    /// The wrapped model
    pub const fn model(&self) -> &Q {
        &self.model
    }
}

impl<Q: FeatureQuantifier> Quantifier for SampledQuantifier<'_, Q> {
    fn name(&self) -> &str {
        &self.name
    }

    fn quantify(&self, sample: &Sample) -> Result<PrevalenceEstimate, QuantifierError> {
        if sample.is_empty() {
            return Err(QuantifierError::EmptySample);
        }
        let rows = self.features.select(sample.ids())?;
        self.model.predict(&rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sampling::{ItemPools, SamplingConfig, SamplingEngine};

    /// Counts rows whose first feature is set
    struct FirstFeature;

    impl FeatureQuantifier for FirstFeature {
        fn fit(&mut self, _: &FeatureMatrix, _: &[u8]) -> Result<(), QuantifierError> {
            Ok(())
        }

        #[allow(clippy::cast_precision_loss)]
        fn predict(&self, features: &FeatureMatrix) -> Result<PrevalenceEstimate, QuantifierError> {
            let hits = features
                .rows()
                .filter(|r| r.first().is_some_and(|&(i, _)| i == 0))
                .count();
            Ok(PrevalenceEstimate::new(hits as f64 / features.n_rows() as f64))
        }
    }

    #[test]
    fn test_estimate_clamps() {
        assert!((PrevalenceEstimate::new(1.7).prevalence() - 1.0).abs() < f64::EPSILON);
        assert!(PrevalenceEstimate::new(-0.2).prevalence().abs() < f64::EPSILON);
        assert!(PrevalenceEstimate::new(f64::NAN).prevalence().abs() < f64::EPSILON);
        assert!((PrevalenceEstimate::new(f64::INFINITY).prevalence() - 1.0).abs() < f64::EPSILON);
        assert!(PrevalenceEstimate::new(0.4).converged());
        assert!(!PrevalenceEstimate::stalled(0.4).converged());
    }

    #[test]
    fn test_sampled_quantifier_selects_rows() {
        // positives carry feature 0, negatives feature 1
        let dense: Vec<Vec<f64>> = (0..40)
            .map(|i| if i < 20 { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
            .collect();
        let features = FeatureMatrix::from_dense(&dense);
        let pools = ItemPools::new((0..20).collect(), (20..40).collect()).unwrap();
        let engine = SamplingEngine::new(
            pools,
            SamplingConfig {
                sample_size: 10,
                samples_per_prevalence: 1,
                seed: 3,
            },
        )
        .unwrap();
        let sample = engine.draw(0, 0.3).unwrap();

        let quantifier = SampledQuantifier::new("first", FirstFeature, &features);
        assert_eq!(quantifier.name(), "first");
        let estimate = quantifier.quantify(&sample).unwrap();
        assert!((estimate.prevalence() - 0.3).abs() < 1e-12);
    }
}
