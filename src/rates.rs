//! True/false positive rates measured once on the validation split.

use crate::data::PredictionSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that make a rate undefined
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateError {
    #[error("Validation set has no positive items: tpr/ptpr are undefined")]
    NoPositives,

    #[error("Validation set has no negative items: fpr/pfpr are undefined")]
    NoNegatives,
}

/// Classifier rates used by the adjusted estimators
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateEstimates {
    /// Fraction of gold positives predicted positive
    pub tpr: f64,
    /// Fraction of gold negatives predicted positive
    pub fpr: f64,
    /// Mean soft score over gold positives
    pub ptpr: f64,
    /// Mean soft score over gold negatives
    pub pfpr: f64,
}

impl RateEstimates {
    /// Measure rates on a validation prediction set.
    ///
    /// # Errors
    ///
    /// Returns `NoPositives` or `NoNegatives` when either class is missing.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_predictions(validation: &PredictionSet) -> Result<Self, RateError> {
        let (positives, negatives) = validation.split_pos_neg();
        if positives.is_empty() {
            return Err(RateError::NoPositives);
        }
        if negatives.is_empty() {
            return Err(RateError::NoNegatives);
        }

        let hard = validation.hard();
        let soft = validation.soft();
        let hard_rate =
            |ids: &[usize]| ids.iter().filter(|&&i| hard[i] == 1).count() as f64 / ids.len() as f64;
        let soft_rate = |ids: &[usize]| ids.iter().map(|&i| soft[i]).sum::<f64>() / ids.len() as f64;

        Ok(Self {
            tpr: hard_rate(&positives),
            fpr: hard_rate(&negatives),
            ptpr: soft_rate(&positives),
            pfpr: soft_rate(&negatives),
        })
    }

    /// Rates of a perfect classifier (the adjustment becomes the identity)
    #[must_use]
    pub const fn perfect() -> Self {
        Self {
            tpr: 1.0,
            fpr: 0.0,
            ptpr: 1.0,
            pfpr: 0.0,
        }
    }
}
