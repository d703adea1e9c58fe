//! Evaluation orchestration.
//!
//! Loads the inputs of a run, measures validation rates, draws the test
//! samples, fits the feature-based baselines through grid search, applies
//! every estimator to every sample and scores the results. This is the only
//! module that logs; everything below it reports through return values.

use crate::classify_count::ClassifyAndCount;
use crate::command::CommandQuantifier;
use crate::config::{ConfigError, RunConfig};
use crate::data::{check_len, DataError, FeatureMatrix, PredictionSet};
use crate::em::EmQuantifier;
use crate::metrics::{absolute_errors, smoothing_eps, Metric, MetricError};
use crate::model_selection::{
    describe_params, param_bool, param_f64, GridSearch, GridSearchOutcome, ModelSelectionError, ValidationSet,
};
use crate::naive_bayes::MultinomialNb;
use crate::quantifier::{FeatureQuantifier, Quantifier, QuantifierError, SampledQuantifier};
use crate::rates::{RateError, RateEstimates};
use crate::report::ReportBuilder;
use crate::results::{write_prevalences, ResultRow, ResultsError, ResultsTable, SAMPLE_MODE};
use crate::sampling::{
    prevalence_range, true_prevalences, ItemPools, Sample, SamplingConfig, SamplingEngine, SamplingError,
};
use crate::subprocess::ExternalError;
use crate::svmperf::SvmPerfQuantifier;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Mixed into the run seed for validation samples
const VALIDATION_SEED_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Errors that abort a run
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Rates(#[from] RateError),

    #[error(transparent)]
    Sampling(#[from] SamplingError),

    #[error(transparent)]
    Quantifier(#[from] QuantifierError),

    #[error(transparent)]
    External(#[from] ExternalError),

    #[error(transparent)]
    Metric(#[from] MetricError),

    #[error(transparent)]
    Results(#[from] ResultsError),

    #[error("Report serialization failed: {0}")]
    Report(#[from] serde_json::Error),

    #[error("No primary quantifier available for a primary-only run")]
    NoPrimary,
}

/// Feature matrices for the estimators that need raw features
#[derive(Debug, Clone)]
pub struct FeatureInputs {
    pub train: FeatureMatrix,
    pub train_labels: Vec<u8>,
    pub validation: FeatureMatrix,
    pub validation_labels: Vec<u8>,
    /// Rows aligned with the test prediction set
    pub test: FeatureMatrix,
}

/// Everything a run reads, already loaded
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub validation: PredictionSet,
    pub test: PredictionSet,
    pub features: Option<FeatureInputs>,
}

impl RunInputs {
    /// Load the files a configuration names.
    ///
    /// # Errors
    ///
    /// Returns an error for unreadable files or misaligned feature rows.
    pub fn load(config: &RunConfig) -> Result<Self, RunnerError> {
        let validation = PredictionSet::load(&config.predictions.validation)?;
        let test = PredictionSet::load(&config.predictions.test)?;
        let features = match &config.features {
            Some(paths) => {
                let (train, train_labels) = FeatureMatrix::load_svmlight(&paths.train)?;
                let (validation, validation_labels) = FeatureMatrix::load_svmlight(&paths.validation)?;
                let (test, _) = FeatureMatrix::load_svmlight(&paths.test)?;
                Some(FeatureInputs {
                    train,
                    train_labels,
                    validation,
                    validation_labels,
                    test,
                })
            }
            None => None,
        };
        let inputs = Self {
            validation,
            test,
            features,
        };
        inputs.check_alignment()?;
        Ok(inputs)
    }

    /// Test and validation feature rows must match their predictions one to one.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` otherwise.
    pub fn check_alignment(&self) -> Result<(), DataError> {
        if let Some(features) = &self.features {
            check_len("test feature rows", self.test.len(), features.test.n_rows())?;
            check_len(
                "validation feature rows",
                self.validation.len(),
                features.validation.n_rows(),
            )?;
        }
        Ok(())
    }
}

/// Per-sample estimates of one method and their scores
#[derive(Debug, Clone, Serialize)]
pub struct MethodOutcome {
    pub name: String,
    /// One entry per sample; `None` where estimation failed
    pub estimates: Vec<Option<f64>>,
    pub failed: usize,
    /// Estimates from an iterative method that hit its cap
    pub stalled: usize,
    /// Metric scores over the successful samples, in [`Metric::ALL`] order
    pub scores: Vec<(Metric, f64)>,
    /// Hyperparameters picked by grid search
    pub selected_params: Option<String>,
}

impl MethodOutcome {
    fn all_failed(name: &str, n: usize) -> Self {
        Self {
            name: name.to_string(),
            estimates: vec![None; n],
            failed: n,
            stalled: 0,
            scores: Vec::new(),
            selected_params: None,
        }
    }

    /// Score under one metric
    #[must_use]
    pub fn score(&self, metric: Metric) -> Option<f64> {
        self.scores.iter().find(|(m, _)| *m == metric).map(|(_, s)| *s)
    }

    /// Pairs of (true, estimate) over successful samples
    #[must_use]
    pub fn successful_pairs(&self, true_prevs: &[f64]) -> (Vec<f64>, Vec<f64>) {
        true_prevs
            .iter()
            .zip(&self.estimates)
            .filter_map(|(&p, est)| est.map(|e| (p, e)))
            .unzip()
    }
}

/// Apply one quantifier to every sample and score it.
///
/// Per-sample failures become missing estimates; the remaining samples are
/// scored under every metric.
///
/// # Errors
///
/// Returns a metric error if the vectors cannot be aggregated.
pub fn evaluate_quantifier(
    quantifier: &dyn Quantifier,
    samples: &[Sample],
    true_prevs: &[f64],
    eps: f64,
) -> Result<MethodOutcome, MetricError> {
    let results: Vec<Result<(f64, bool), QuantifierError>> = samples
        .par_iter()
        .map(|s| quantifier.quantify(s).map(|e| (e.prevalence(), e.converged())))
        .collect();

    let mut estimates = Vec::with_capacity(samples.len());
    let mut failed = 0;
    let mut stalled = 0;
    for (sample, result) in samples.iter().zip(results) {
        match result {
            Ok((value, converged)) => {
                stalled += usize::from(!converged);
                estimates.push(Some(value));
            }
            Err(e) => {
                debug!(method = quantifier.name(), sample = sample.index(), error = %e, "estimate failed");
                failed += 1;
                estimates.push(None);
            }
        }
    }

    let mut outcome = MethodOutcome {
        name: quantifier.name().to_string(),
        estimates,
        failed,
        stalled,
        scores: Vec::new(),
        selected_params: None,
    };
    let (truth, estimated) = outcome.successful_pairs(true_prevs);
    if !truth.is_empty() {
        for metric in Metric::ALL {
            outcome.scores.push((metric, metric.evaluate(&truth, &estimated, eps)?));
        }
    }
    Ok(outcome)
}

/// Scored output of one run
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub dataset: String,
    pub note: String,
    pub sample_size: usize,
    pub rates: RateEstimates,
    /// Target prevalence of every sample
    pub targets: Vec<f64>,
    /// Realized prevalence of every sample
    pub true_prevalences: Vec<f64>,
    /// Methods in reporting order; the primary one, if any, is last
    pub methods: Vec<MethodOutcome>,
    pub primary: Option<String>,
}

impl Evaluation {
    /// Look up a method by name
    #[must_use]
    pub fn method(&self, name: &str) -> Option<&MethodOutcome> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Results-table rows: metrics outer, methods inner
    #[must_use]
    pub fn to_rows(&self) -> Vec<ResultRow> {
        Metric::ALL
            .iter()
            .flat_map(|&metric| {
                self.methods.iter().filter_map(move |m| {
                    m.score(metric).map(|score| ResultRow {
                        method: m.name.clone(),
                        metric: metric.name().to_string(),
                        score,
                        mode: SAMPLE_MODE.to_string(),
                        dataset: self.dataset.clone(),
                        note: self.note.clone(),
                    })
                })
            })
            .collect()
    }

    /// Per-sample absolute errors of a method; `None` where it failed
    #[must_use]
    pub fn absolute_errors(&self, name: &str) -> Option<Vec<Option<f64>>> {
        self.method(name).map(|m| {
            self.true_prevalences
                .iter()
                .zip(&m.estimates)
                .map(|(&p, est)| est.map(|e| absolute_errors(&[p], &[e])[0]))
                .collect()
        })
    }

    /// Columns for the per-sample prevalence table
    #[must_use]
    pub fn prevalence_columns(&self) -> Vec<(String, Vec<Option<f64>>)> {
        self.methods
            .iter()
            .map(|m| (m.name.clone(), m.estimates.clone()))
            .collect()
    }
}

/// Drives one configured run
pub struct Orchestrator {
    config: RunConfig,
}

impl Orchestrator {
    /// Create an orchestrator for a validated configuration
    #[must_use]
    pub const fn new(config: RunConfig) -> Self {
        Self { config }
    }

    /// The run configuration
    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Load inputs, evaluate and write every configured output.
    ///
    /// # Errors
    ///
    /// Returns an error if loading, evaluation or writing fails.
    pub fn execute(&self) -> Result<Evaluation, RunnerError> {
        let inputs = RunInputs::load(&self.config)?;
        let evaluation = self.evaluate(&inputs, None)?;
        self.persist(&evaluation)?;
        Ok(evaluation)
    }

    /// Evaluate loaded inputs. `primary` takes precedence over the
    /// configured primary command.
    ///
    /// # Errors
    ///
    /// Returns an error if rates, samples or baselines cannot be produced.
    pub fn evaluate(
        &self,
        inputs: &RunInputs,
        primary: Option<&dyn Quantifier>,
    ) -> Result<Evaluation, RunnerError> {
        let config = &self.config;
        inputs.check_alignment()?;
        info!(dataset = %config.dataset, seed = config.seed, "starting evaluation");

        let rates = RateEstimates::from_predictions(&inputs.validation)?;
        info!(
            tpr = rates.tpr,
            fpr = rates.fpr,
            ptpr = rates.ptpr,
            pfpr = rates.pfpr,
            "validation rates"
        );

        let targets = prevalence_range(config.include_bounds);
        let engine = SamplingEngine::new(ItemPools::from_predictions(&inputs.test), config.sampling())?;
        let samples = engine.generate(&targets)?;
        let true_prevs = true_prevalences(&samples);
        let eps = smoothing_eps(config.sample_size);
        info!(samples = samples.len(), sample_size = config.sample_size, "test samples drawn");

        let mut methods = Vec::new();
        if config.primary_only {
            info!("primary-only run, skipping baselines");
        } else {
            for q in ClassifyAndCount::family(&inputs.test, rates) {
                methods.push(self.score(&q, &samples, &true_prevs, eps)?);
            }
            match &inputs.features {
                Some(features) => methods.extend(self.feature_baselines(features, &samples, &true_prevs, eps)?),
                None => warn!("no feature files configured, skipping em and svmperf"),
            }
        }

        let command;
        let primary: Option<&dyn Quantifier> = match (primary, &config.primary) {
            (Some(q), _) => Some(q),
            (None, Some(cmd)) => {
                command = CommandQuantifier::new(cmd, &inputs.test, rates)?;
                Some(&command)
            }
            (None, None) => None,
        };
        let primary_name = match primary {
            Some(q) => {
                methods.push(self.score(q, &samples, &true_prevs, eps)?);
                Some(q.name().to_string())
            }
            None if config.primary_only => return Err(RunnerError::NoPrimary),
            None => None,
        };

        Ok(Evaluation {
            dataset: config.dataset.clone(),
            note: config.note.clone(),
            sample_size: config.sample_size,
            rates,
            targets: samples.iter().map(Sample::target_prevalence).collect(),
            true_prevalences: true_prevs,
            methods,
            primary: primary_name,
        })
    }

    fn score(
        &self,
        quantifier: &dyn Quantifier,
        samples: &[Sample],
        true_prevs: &[f64],
        eps: f64,
    ) -> Result<MethodOutcome, RunnerError> {
        let outcome = evaluate_quantifier(quantifier, samples, true_prevs, eps)?;
        if outcome.failed > 0 {
            warn!(
                method = %outcome.name,
                failed = outcome.failed,
                total = samples.len(),
                "samples without an estimate"
            );
        }
        if outcome.stalled > 0 {
            warn!(method = %outcome.name, stalled = outcome.stalled, "estimates did not converge");
        }
        match outcome.score(Metric::Mae) {
            Some(mae) => info!(method = %outcome.name, mae, "method evaluated"),
            None => warn!(method = %outcome.name, "no successful estimates, method not scored"),
        }
        Ok(outcome)
    }

    /// Samples over the validation rows for hyperparameter selection
    fn validation_samples(&self, labels: &[u8]) -> Result<Vec<Sample>, SamplingError> {
        let pools = ItemPools::from_labels(labels);
        let size = self
            .config
            .sample_size
            .min(pools.positives().len())
            .min(pools.negatives().len());
        let engine = SamplingEngine::new(
            pools,
            SamplingConfig {
                sample_size: size,
                samples_per_prevalence: self.config.selection.samples_per_prevalence,
                seed: self.config.seed ^ VALIDATION_SEED_SALT,
            },
        )?;
        engine.generate(&prevalence_range(false))
    }

    /// Feature-based methods in reporting order
    fn feature_method_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.config.em.enabled {
            names.push("em".to_string());
        }
        if let Some(svm) = &self.config.svmperf {
            names.extend(svm.losses.iter().map(|loss| loss.method_name()));
        }
        names
    }

    fn feature_baselines(
        &self,
        features: &FeatureInputs,
        samples: &[Sample],
        true_prevs: &[f64],
        eps: f64,
    ) -> Result<Vec<MethodOutcome>, RunnerError> {
        let config = &self.config;
        let validation_samples = match self.validation_samples(&features.validation_labels) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "no validation samples for model selection");
                return Ok(self
                    .feature_method_names()
                    .iter()
                    .map(|name| MethodOutcome::all_failed(name, samples.len()))
                    .collect());
            }
        };
        let validation = ValidationSet {
            features: &features.validation,
            samples: &validation_samples,
        };
        let search = GridSearch::new(
            config.selection.metric,
            config.selection.parallelism,
            smoothing_eps(validation_samples.first().map_or(config.sample_size, Sample::len)),
        );
        debug!(
            validation_samples = validation_samples.len(),
            metric = %config.selection.metric,
            "model selection"
        );

        let mut outcomes = Vec::new();
        if config.em.enabled {
            let stopping = config.em.stopping;
            let result = search.run(
                &config.em.grid,
                |p| {
                    Ok(EmQuantifier::new(
                        MultinomialNb::new(param_f64(p, "alpha")?, param_bool(p, "fit_prior")?),
                        stopping,
                    ))
                },
                &features.train,
                &features.train_labels,
                validation,
            );
            outcomes.push(self.score_selected("em", result, &features.test, samples, true_prevs, eps)?);
        }

        if let Some(svm) = &config.svmperf {
            let tools = svm.tools()?;
            for &loss in &svm.losses {
                let result = search.run(
                    &svm.grid,
                    |p| Ok(SvmPerfQuantifier::new(tools.clone(), loss, param_f64(p, "C")?)),
                    &features.train,
                    &features.train_labels,
                    validation,
                );
                outcomes.push(self.score_selected(
                    &loss.method_name(),
                    result,
                    &features.test,
                    samples,
                    true_prevs,
                    eps,
                )?);
            }
        }
        Ok(outcomes)
    }

    fn score_selected<Q: FeatureQuantifier>(
        &self,
        name: &str,
        result: Result<GridSearchOutcome<Q>, ModelSelectionError>,
        test_features: &FeatureMatrix,
        samples: &[Sample],
        true_prevs: &[f64],
        eps: f64,
    ) -> Result<MethodOutcome, RunnerError> {
        let selected = match result {
            Ok(selected) => selected,
            Err(e) => {
                warn!(method = name, error = %e, "model selection failed");
                return Ok(MethodOutcome::all_failed(name, samples.len()));
            }
        };
        for failure in &selected.failures {
            warn!(
                method = name,
                params = %describe_params(&failure.params),
                reason = %failure.reason,
                "candidate excluded"
            );
        }
        let params = describe_params(&selected.params);
        info!(method = name, params = %params, score = selected.score, "selected hyperparameters");

        let quantifier = SampledQuantifier::new(name, selected.model, test_features);
        let mut outcome = self.score(&quantifier, samples, true_prevs, eps)?;
        outcome.selected_params = Some(params);
        Ok(outcome)
    }

    /// Append scores to the results table and write the optional outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if any output cannot be written.
    pub fn persist(&self, evaluation: &Evaluation) -> Result<(), RunnerError> {
        let output = &self.config.output;
        let rows = evaluation.to_rows();
        ResultsTable::append(&output.results, &rows)?;
        info!(rows = rows.len(), path = %output.results.display(), "results appended");

        if let Some(path) = &output.prevalences {
            write_prevalences(
                path,
                &evaluation.targets,
                &evaluation.true_prevalences,
                &evaluation.prevalence_columns(),
            )?;
            info!(path = %path.display(), "per-sample prevalences written");
        }

        if let Some(path) = &output.report {
            let report = ReportBuilder::from_evaluation(evaluation)
                .with_stat_config(self.config.stat_config())
                .build();
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(ResultsError::from)?;
            }
            let content = if path.extension().is_some_and(|e| e == "json") {
                report.to_json()?
            } else {
                report.to_markdown()
            };
            std::fs::write(path, content).map_err(ResultsError::from)?;
            info!(path = %path.display(), "report written");
        }
        Ok(())
    }
}
