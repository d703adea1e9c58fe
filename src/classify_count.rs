//! Classify & count estimators: CC, ACC, PCC and APCC.
//!
//! CC and PCC average hard and soft classifier outputs over a sample. The
//! adjusted variants invert the rate bias measured on validation data:
//! `(raw - fpr) / (tpr - fpr)`. A denominator with magnitude below
//! [`DENOMINATOR_TOLERANCE`] is replaced by the tolerance (keeping its sign),
//! so the result saturates at a bound instead of turning into NaN or Inf.

use crate::data::PredictionSet;
use crate::quantifier::{PrevalenceEstimate, Quantifier, QuantifierError};
use crate::rates::RateEstimates;
use crate::sampling::Sample;
use serde::{Deserialize, Serialize};

/// Smallest `|tpr - fpr|` used as a divisor
pub const DENOMINATOR_TOLERANCE: f64 = 1e-9;

/// The four classify & count variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountMethod {
    /// Mean of hard predictions
    Cc,
    /// CC corrected with tpr/fpr
    Acc,
    /// Mean of soft predictions
    Pcc,
    /// PCC corrected with ptpr/pfpr
    Apcc,
}

impl CountMethod {
    /// Reporting order used by the evaluation
    pub const ALL: [Self; 4] = [Self::Cc, Self::Pcc, Self::Acc, Self::Apcc];

    /// Name used in result tables
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Cc => "cc",
            Self::Acc => "acc",
            Self::Pcc => "pcc",
            Self::Apcc => "apcc",
        }
    }
}

/// Bias-correct a raw count with the given rates, clamped into [0, 1]
#[must_use]
pub fn adjust(raw: f64, tpr: f64, fpr: f64) -> f64 {
    let mut denominator = tpr - fpr;
    if denominator.abs() < DENOMINATOR_TOLERANCE {
        denominator = DENOMINATOR_TOLERANCE.copysign(denominator);
    }
    PrevalenceEstimate::new((raw - fpr) / denominator).prevalence()
}

/// Classify & count over the items of a sample
#[derive(Debug, Clone)]
pub struct ClassifyAndCount<'a> {
    method: CountMethod,
    predictions: &'a PredictionSet,
    rates: RateEstimates,
}

impl<'a> ClassifyAndCount<'a> {
    /// Create an estimator over the prediction set sample ids refer to
    #[must_use]
    pub const fn new(method: CountMethod, predictions: &'a PredictionSet, rates: RateEstimates) -> Self {
        Self {
            method,
            predictions,
            rates,
        }
    }

    /// All four variants in reporting order
    #[must_use]
    pub fn family(predictions: &'a PredictionSet, rates: RateEstimates) -> Vec<Self> {
        CountMethod::ALL
            .iter()
            .map(|&method| Self::new(method, predictions, rates))
            .collect()
    }

    /// Which variant this is
    #[must_use]
    pub const fn method(&self) -> CountMethod {
        self.method
    }
}

impl Quantifier for ClassifyAndCount<'_> {
    fn name(&self) -> &str {
        self.method.name()
    }

    fn quantify(&self, sample: &Sample) -> Result<PrevalenceEstimate, QuantifierError> {
        let counts = SampleCounts::compute(sample, self.predictions)?;
        let value = match self.method {
            CountMethod::Cc => counts.cc,
            CountMethod::Pcc => counts.pcc,
            CountMethod::Acc => adjust(counts.cc, self.rates.tpr, self.rates.fpr),
            CountMethod::Apcc => adjust(counts.pcc, self.rates.ptpr, self.rates.pfpr),
        };
        Ok(PrevalenceEstimate::new(value))
    }
}

/// Raw CC and PCC of a sample
#[derive(Debug, Clone, Copy, PartialEq)]
struct SampleCounts {
    cc: f64,
    pcc: f64,
}

impl SampleCounts {
    #[allow(clippy::cast_precision_loss)]
    fn compute(sample: &Sample, predictions: &PredictionSet) -> Result<Self, QuantifierError> {
        if sample.is_empty() {
            return Err(QuantifierError::EmptySample);
        }
        let hard = predictions.hard();
        let soft = predictions.soft();
        let mut positives = 0usize;
        let mut soft_sum = 0.0;
        for &id in sample.ids() {
            if id >= predictions.len() {
                return Err(QuantifierError::IdOutOfRange {
                    id,
                    len: predictions.len(),
                });
            }
            positives += usize::from(hard[id]);
            soft_sum += soft[id];
        }
        let n = sample.len() as f64;
        Ok(Self {
            cc: positives as f64 / n,
            pcc: soft_sum / n,
        })
    }
}

/// Summary statistics handed to the primary quantifier with every sample:
/// the four classify & count estimates and the validation rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleStats {
    pub cc: f64,
    pub acc: f64,
    pub pcc: f64,
    pub apcc: f64,
    pub tpr: f64,
    pub fpr: f64,
    pub ptpr: f64,
    pub pfpr: f64,
}

impl SampleStats {
    /// Compute the statistics of one sample.
    ///
    /// # Errors
    ///
    /// Returns an error for empty samples or ids outside `predictions`.
    pub fn compute(
        sample: &Sample,
        predictions: &PredictionSet,
        rates: RateEstimates,
    ) -> Result<Self, QuantifierError> {
        let counts = SampleCounts::compute(sample, predictions)?;
        Ok(Self {
            cc: counts.cc,
            acc: adjust(counts.cc, rates.tpr, rates.fpr),
            pcc: counts.pcc,
            apcc: adjust(counts.pcc, rates.ptpr, rates.pfpr),
            tpr: rates.tpr,
            fpr: rates.fpr,
            ptpr: rates.ptpr,
            pfpr: rates.pfpr,
        })
    }

    /// Flatten in `[cc, acc, pcc, apcc, tpr, fpr, ptpr, pfpr]` order
    #[must_use]
    pub const fn to_array(&self) -> [f64; 8] {
        [
            self.cc, self.acc, self.pcc, self.apcc, self.tpr, self.fpr, self.ptpr, self.pfpr,
        ]
    }
}
