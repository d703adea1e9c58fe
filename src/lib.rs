//! # Quant Eval
//!
//! Evaluation harness for binary quantification: estimating the positive-class
//! prevalence of a sample rather than labeling its items.
//!
//! ## Protocol
//!
//! Test items are drawn into fixed-size samples at prevalences 0.05..0.95
//! (optionally 0.00 and 1.00), a configurable number of samples per level,
//! from a seeded generator. Every estimator sees the same samples and is scored
//! with MAE, MSE, MNKLD, MKLD and MRAE.
//!
//! ## Architecture
//!
//! ```text
//! Classifier predictions (validation, test)   Features (train, validation, test)
//!        ↓                                            ↓
//! Validation rates (tpr, fpr, ptpr, pfpr)     Grid search (EM, SVMperf)
//!        ↓                                            ↓
//! CC / PCC / ACC / APCC                       Feature baselines
//!        ↓                                            ↓
//!                    Primary quantifier (external command)
//!                                 ↓
//!                  Metrics, results CSV, per-sample table
//!                                 ↓
//!                Report (bootstrap CIs, paired t-tests)
//! ```

pub mod classify_count;
pub mod command;
pub mod config;
pub mod data;
pub mod em;
pub mod metrics;
pub mod model_selection;
pub mod naive_bayes;
pub mod quantifier;
pub mod rates;
pub mod report;
pub mod results;
pub mod runner;
pub mod sampling;
pub mod subprocess;
pub mod svmperf;

pub use classify_count::{adjust, ClassifyAndCount, CountMethod, SampleStats};
pub use command::{CommandQuantifier, PrimaryCommand};
pub use config::{ConfigError, RunConfig};
pub use data::{ColumnMap, DataError, FeatureMatrix, PredictionSet};
pub use em::{expectation_maximization, EmConfig, EmOutcome, EmQuantifier};
pub use metrics::{
    bonferroni_correction, bootstrap_ci, paired_t_test, Metric, MetricError, SignificanceResult,
    StatConfig,
};
pub use model_selection::{GridSearch, GridSearchOutcome, ModelSelectionError, ParamGrid, Params};
pub use naive_bayes::{MultinomialNb, ProbabilisticLearner};
pub use quantifier::{
    FeatureQuantifier, PrevalenceEstimate, Quantifier, QuantifierError, SampledQuantifier,
};
pub use rates::{RateError, RateEstimates};
pub use report::{FullReport, ReportBuilder, ResultsSummary};
pub use results::{ResultRow, ResultsError, ResultsTable};
pub use runner::{Evaluation, MethodOutcome, Orchestrator, RunInputs, RunnerError};
pub use sampling::{Sample, SamplingConfig, SamplingEngine, SamplingError};
pub use subprocess::{ExternalError, ToolCommand};
pub use svmperf::{SvmPerfLoss, SvmPerfQuantifier, SvmPerfTools};
