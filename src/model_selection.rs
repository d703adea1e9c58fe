//! Hyperparameter grid search scored with a quantification metric.
//!
//! Every candidate is built from its parameters, fitted on the training
//! rows and asked for the prevalence of each validation sample. The
//! candidate with the lowest metric value wins; ties keep grid order.
//! Candidates that fail anywhere are excluded and reported, never scored.

use crate::data::FeatureMatrix;
use crate::metrics::{Metric, MetricError};
use crate::quantifier::{FeatureQuantifier, QuantifierError};
use crate::sampling::Sample;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors from model selection
#[derive(Error, Debug)]
pub enum ModelSelectionError {
    #[error("Parameter grid is empty")]
    EmptyGrid,

    #[error("No validation samples to score candidates on")]
    NoValidationSamples,

    #[error("All {tried} candidates failed")]
    NoViableCandidate { tried: usize },

    #[error("Missing parameter '{0}'")]
    MissingParam(String),

    #[error("Parameter '{name}' has the wrong type: expected {expected}")]
    WrongParamType { name: String, expected: &'static str },

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A single hyperparameter value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Float(f64),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

/// One point of the grid
pub type Params = BTreeMap<String, ParamValue>;

/// Read a float parameter.
///
/// # Errors
///
/// Returns `MissingParam` or `WrongParamType`.
pub fn param_f64(params: &Params, name: &str) -> Result<f64, ModelSelectionError> {
    match params.get(name) {
        Some(ParamValue::Float(x)) => Ok(*x),
        Some(ParamValue::Bool(_)) => Err(ModelSelectionError::WrongParamType {
            name: name.to_string(),
            expected: "float",
        }),
        None => Err(ModelSelectionError::MissingParam(name.to_string())),
    }
}

/// Read a boolean parameter.
///
/// # Errors
///
/// Returns `MissingParam` or `WrongParamType`.
pub fn param_bool(params: &Params, name: &str) -> Result<bool, ModelSelectionError> {
    match params.get(name) {
        Some(ParamValue::Bool(b)) => Ok(*b),
        Some(ParamValue::Float(_)) => Err(ModelSelectionError::WrongParamType {
            name: name.to_string(),
            expected: "bool",
        }),
        None => Err(ModelSelectionError::MissingParam(name.to_string())),
    }
}

/// Render parameters as `a=1, b=true`
#[must_use]
pub fn describe_params(params: &Params) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Named axes whose cartesian product forms the candidates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamGrid {
    axes: BTreeMap<String, Vec<ParamValue>>,
}

impl ParamGrid {
    /// Empty grid
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an axis
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, values: Vec<ParamValue>) -> Self {
        self.axes.insert(name.into(), values);
        self
    }

    /// Add a float axis
    #[must_use]
    pub fn with_floats(self, name: impl Into<String>, values: &[f64]) -> Self {
        self.with(name, values.iter().map(|&x| ParamValue::Float(x)).collect())
    }

    /// Add a boolean axis
    #[must_use]
    pub fn with_bools(self, name: impl Into<String>, values: &[bool]) -> Self {
        self.with(name, values.iter().map(|&b| ParamValue::Bool(b)).collect())
    }

    /// Multinomial NB grid for EM: ten `alpha` decades and `fit_prior`
    #[must_use]
    pub fn em_default() -> Self {
        Self::new()
            .with_floats("alpha", &[1e-4, 1e-3, 1e-2, 1e-1, 1e0, 1e1, 1e2, 1e3, 1e4, 1e5])
            .with_bools("fit_prior", &[true, false])
    }

    /// SVMperf grid: seven `C` decades
    #[must_use]
    pub fn svmperf_default() -> Self {
        Self::new().with_floats("C", &[1e-2, 1e-1, 1e0, 1e1, 1e2, 1e3, 1e4])
    }

    /// Every combination, axes iterated in name order with the last varying fastest
    #[must_use]
    pub fn candidates(&self) -> Vec<Params> {
        if self.axes.is_empty() || self.axes.values().any(Vec::is_empty) {
            return Vec::new();
        }
        self.axes.iter().fold(vec![Params::new()], |acc, (name, values)| {
            acc.iter()
                .flat_map(|partial| {
                    values.iter().map(move |value| {
                        let mut next = partial.clone();
                        next.insert(name.clone(), *value);
                        next
                    })
                })
                .collect()
        })
    }

    /// Number of candidates
    #[must_use]
    pub fn len(&self) -> usize {
        if self.axes.is_empty() {
            0
        } else {
            self.axes.values().map(Vec::len).product()
        }
    }

    /// True when there are no candidates
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rows the validation samples refer to
#[derive(Debug, Clone, Copy)]
pub struct ValidationSet<'a> {
    pub features: &'a FeatureMatrix,
    pub samples: &'a [Sample],
}

/// A candidate excluded from selection
#[derive(Debug, Clone)]
pub struct CandidateFailure {
    pub params: Params,
    pub reason: String,
}

/// Selected model plus the full search record
#[derive(Debug)]
pub struct GridSearchOutcome<Q> {
    /// Winning model, fitted on the training rows
    pub model: Q,
    pub params: Params,
    pub score: f64,
    /// Scores of every viable candidate, in grid order
    pub scores: Vec<(Params, f64)>,
    pub failures: Vec<CandidateFailure>,
}

/// Candidate-level failure
#[derive(Error, Debug)]
enum CandidateError {
    #[error(transparent)]
    Build(#[from] ModelSelectionError),
    #[error(transparent)]
    Quantifier(#[from] QuantifierError),
    #[error(transparent)]
    Metric(#[from] MetricError),
}

/// Grid search driver
#[derive(Debug, Clone, Copy)]
pub struct GridSearch {
    /// Selection objective
    pub metric: Metric,
    /// Worker threads; 0 uses rayon's default
    pub parallelism: usize,
    /// Smoothing epsilon for smoothed metrics
    pub eps: f64,
}

impl GridSearch {
    /// Create a search
    #[must_use]
    pub const fn new(metric: Metric, parallelism: usize, eps: f64) -> Self {
        Self {
            metric,
            parallelism,
            eps,
        }
    }

    /// Search `grid`, building candidates with `build`.
    ///
    /// # Errors
    ///
    /// Returns `EmptyGrid`, `NoValidationSamples`, `NoViableCandidate` when
    /// every candidate failed, or a thread pool error.
    pub fn run<Q, F>(
        &self,
        grid: &ParamGrid,
        build: F,
        train_features: &FeatureMatrix,
        train_labels: &[u8],
        validation: ValidationSet<'_>,
    ) -> Result<GridSearchOutcome<Q>, ModelSelectionError>
    where
        Q: FeatureQuantifier,
        F: Fn(&Params) -> Result<Q, ModelSelectionError> + Sync,
    {
        let candidates = grid.candidates();
        if candidates.is_empty() {
            return Err(ModelSelectionError::EmptyGrid);
        }
        if validation.samples.is_empty() {
            return Err(ModelSelectionError::NoValidationSamples);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .build()?;
        let results: Vec<Result<(Q, f64), CandidateError>> = pool.install(|| {
            candidates
                .par_iter()
                .map(|params| self.evaluate(params, &build, train_features, train_labels, validation))
                .collect()
        });

        let tried = candidates.len();
        let mut best: Option<(Q, Params, f64)> = None;
        let mut scores = Vec::new();
        let mut failures = Vec::new();
        for (params, result) in candidates.into_iter().zip(results) {
            match result {
                Ok((model, score)) => {
                    scores.push((params.clone(), score));
                    if best.as_ref().map_or(true, |(_, _, s)| score < *s) {
                        best = Some((model, params, score));
                    }
                }
                Err(e) => failures.push(CandidateFailure {
                    params,
                    reason: e.to_string(),
                }),
            }
        }

        let (model, params, score) = best.ok_or(ModelSelectionError::NoViableCandidate { tried })?;
        Ok(GridSearchOutcome {
            model,
            params,
            score,
            scores,
            failures,
        })
    }

    fn evaluate<Q, F>(
        &self,
        params: &Params,
        build: &F,
        train_features: &FeatureMatrix,
        train_labels: &[u8],
        validation: ValidationSet<'_>,
    ) -> Result<(Q, f64), CandidateError>
    where
        Q: FeatureQuantifier,
        F: Fn(&Params) -> Result<Q, ModelSelectionError>,
    {
        let mut model = build(params)?;
        model.fit(train_features, train_labels)?;
        let mut true_prevs = Vec::with_capacity(validation.samples.len());
        let mut estimates = Vec::with_capacity(validation.samples.len());
        for sample in validation.samples {
            let rows = validation
                .features
                .select(sample.ids())
                .map_err(QuantifierError::from)?;
            estimates.push(model.predict(&rows)?.prevalence());
            true_prevs.push(sample.realized_prevalence());
        }
        let score = self.metric.evaluate(&true_prevs, &estimates, self.eps)?;
        if score.is_nan() {
            return Err(MetricError::InvalidMetric(format!("{} produced NaN", self.metric)).into());
        }
        Ok((model, score))
    }
}
