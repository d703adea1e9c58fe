//! Run configuration.
//!
//! One YAML file describes one evaluation run: where the classifier outputs
//! and features live, how samples are drawn, which baselines run and where
//! results go. Relative paths resolve against the file's directory.

use crate::command::PrimaryCommand;
use crate::em::EmConfig;
use crate::metrics::{Metric, StatConfig};
use crate::model_selection::{param_f64, ParamGrid};
use crate::sampling::{SamplingConfig, DEFAULT_SAMPLES_PER_PREVALENCE};
use crate::subprocess::ToolCommand;
use crate::svmperf::{SvmPerfLoss, SvmPerfTools};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid glob pattern: {0}")]
    InvalidPattern(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Classifier outputs on validation and test items
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PredictionPaths {
    /// Source of the rate estimates
    pub validation: PathBuf,
    /// Pool the test samples are drawn from
    pub test: PathBuf,
}

/// SVMlight feature files for estimators that need raw features
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeaturePaths {
    pub train: PathBuf,
    pub validation: PathBuf,
    pub test: PathBuf,
}

/// EM baseline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "ParamGrid::em_default")]
    pub grid: ParamGrid,
    #[serde(flatten)]
    pub stopping: EmConfig,
}

impl Default for EmSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            grid: ParamGrid::em_default(),
            stopping: EmConfig::default(),
        }
    }
}

/// SVMperf baseline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SvmPerfSettings {
    /// Directory holding `svm_perf_learn` and `svm_perf_classify`
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Explicit training command (overrides `base_dir`)
    #[serde(default)]
    pub learn: Option<ToolCommand>,
    /// Explicit prediction command (overrides `base_dir`)
    #[serde(default)]
    pub classify: Option<ToolCommand>,
    #[serde(default = "default_svmperf_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_losses")]
    pub losses: Vec<SvmPerfLoss>,
    #[serde(default = "ParamGrid::svmperf_default")]
    pub grid: ParamGrid,
}

const fn default_svmperf_timeout() -> u64 {
    600
}

fn default_losses() -> Vec<SvmPerfLoss> {
    SvmPerfLoss::DEFAULT_SET.to_vec()
}

impl SvmPerfSettings {
    /// Resolve the two executables.
    ///
    /// # Errors
    ///
    /// Returns `MissingField` when neither `base_dir` nor both commands are set.
    pub fn tools(&self) -> Result<SvmPerfTools, ConfigError> {
        let from_dir = self.base_dir.as_ref().map(SvmPerfTools::from_dir);
        let learn = self
            .learn
            .clone()
            .or_else(|| from_dir.as_ref().map(|t| t.learn.clone()))
            .ok_or_else(|| ConfigError::MissingField("svmperf.learn or svmperf.base_dir".to_string()))?;
        let classify = self
            .classify
            .clone()
            .or_else(|| from_dir.as_ref().map(|t| t.classify.clone()))
            .ok_or_else(|| ConfigError::MissingField("svmperf.classify or svmperf.base_dir".to_string()))?;
        Ok(SvmPerfTools {
            learn,
            classify,
            timeout_secs: self.timeout_secs,
        })
    }
}

/// Hyperparameter selection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionSettings {
    #[serde(default = "default_metric")]
    pub metric: Metric,
    /// Concurrent candidates; 0 means one per core
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_validation_samples")]
    pub samples_per_prevalence: usize,
}

const fn default_metric() -> Metric {
    Metric::Mae
}
const fn default_parallelism() -> usize {
    4
}
const fn default_validation_samples() -> usize {
    5
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            metric: default_metric(),
            parallelism: default_parallelism(),
            samples_per_prevalence: default_validation_samples(),
        }
    }
}

/// Statistical comparison settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticsSettings {
    /// Bootstrap resamples for CI
    #[serde(default = "default_bootstrap_n")]
    pub bootstrap_n: usize,
    /// Confidence level
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Maximum p-value for significance (before correction)
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

const fn default_bootstrap_n() -> usize {
    10000
}
const fn default_confidence() -> f64 {
    0.95
}
const fn default_alpha() -> f64 {
    0.05
}

impl Default for StatisticsSettings {
    fn default() -> Self {
        Self {
            bootstrap_n: default_bootstrap_n(),
            confidence: default_confidence(),
            alpha: default_alpha(),
        }
    }
}

/// Output locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSettings {
    /// Results table, appended to across runs
    #[serde(default = "default_results_path")]
    pub results: PathBuf,
    /// Per-sample true and estimated prevalences
    #[serde(default)]
    pub prevalences: Option<PathBuf>,
    /// Markdown report
    #[serde(default)]
    pub report: Option<PathBuf>,
}

fn default_results_path() -> PathBuf {
    PathBuf::from("results/results.csv")
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            results: default_results_path(),
            prevalences: None,
            report: None,
        }
    }
}

/// Everything one evaluation run needs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Dataset identifier written to the results table
    pub dataset: String,
    /// Seed of the sample sequence
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_samples_per_prevalence")]
    pub samples_per_prevalence: usize,
    /// Include prevalences 0 and 1
    #[serde(default)]
    pub include_bounds: bool,
    /// Evaluate the primary quantifier only
    #[serde(default)]
    pub primary_only: bool,
    /// Free-text note written to the results table
    #[serde(default)]
    pub note: String,
    pub predictions: PredictionPaths,
    #[serde(default)]
    pub features: Option<FeaturePaths>,
    #[serde(default)]
    pub primary: Option<PrimaryCommand>,
    #[serde(default)]
    pub em: EmSettings,
    #[serde(default)]
    pub svmperf: Option<SvmPerfSettings>,
    #[serde(default)]
    pub selection: SelectionSettings,
    #[serde(default)]
    pub statistics: StatisticsSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

const fn default_seed() -> u64 {
    42
}
const fn default_sample_size() -> usize {
    500
}
const fn default_samples_per_prevalence() -> usize {
    DEFAULT_SAMPLES_PER_PREVALENCE
}

impl RunConfig {
    /// Load a run from a YAML file; relative paths resolve against its directory
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    /// Parse and validate a run from YAML text
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed or is invalid.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load every run matching a glob pattern (e.g. `runs/*.yaml`), in path order
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is invalid or any file fails to load.
    pub fn load_glob(pattern: &str) -> Result<Vec<Self>, ConfigError> {
        let paths = glob::glob(pattern).map_err(|e| ConfigError::InvalidPattern(e.to_string()))?;
        let mut configs = Vec::new();
        for entry in paths {
            let path = entry.map_err(|e| ConfigError::IoError(std::io::Error::other(format!("Glob error: {e}"))))?;
            configs.push(Self::load(&path)?);
        }
        Ok(configs)
    }

    /// Check value ranges and cross-field requirements.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.trim().is_empty() {
            return Err(ConfigError::MissingField("dataset".to_string()));
        }
        if self.sample_size == 0 {
            return Err(invalid("sample_size", "must be positive"));
        }
        if self.samples_per_prevalence == 0 {
            return Err(invalid("samples_per_prevalence", "must be positive"));
        }
        if self.selection.samples_per_prevalence == 0 {
            return Err(invalid("selection.samples_per_prevalence", "must be positive"));
        }
        if self.em.stopping.epsilon.is_nan() || self.em.stopping.epsilon <= 0.0 {
            return Err(invalid("em.epsilon", "must be positive"));
        }
        if self.em.stopping.max_iterations == 0 {
            return Err(invalid("em.max_iterations", "must be positive"));
        }
        let stats = &self.statistics;
        if !(stats.confidence > 0.0 && stats.confidence < 1.0) {
            return Err(invalid("statistics.confidence", "must lie in (0, 1)"));
        }
        if !(stats.alpha > 0.0 && stats.alpha < 1.0) {
            return Err(invalid("statistics.alpha", "must lie in (0, 1)"));
        }
        if self.primary_only && self.primary.is_none() {
            return Err(ConfigError::MissingField("primary (required by primary_only)".to_string()));
        }
        if let Some(primary) = &self.primary {
            if primary.name.trim().is_empty() {
                return Err(ConfigError::MissingField("primary.name".to_string()));
            }
        }
        if let Some(svm) = &self.svmperf {
            svm.tools()?;
            if svm.losses.is_empty() {
                return Err(invalid("svmperf.losses", "at least one loss is required"));
            }
            for params in svm.grid.candidates() {
                let c = param_f64(&params, "C").map_err(|e| invalid("svmperf.grid", e.to_string()))?;
                if c.is_nan() || c <= 0.0 {
                    return Err(invalid("svmperf.grid", format!("C must be positive, got {c}")));
                }
            }
        }
        Ok(())
    }

    /// Sampling settings of the test samples
    #[must_use]
    pub const fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            sample_size: self.sample_size,
            samples_per_prevalence: self.samples_per_prevalence,
            seed: self.seed,
        }
    }

    /// Statistical settings, seeded from the run seed
    #[must_use]
    pub const fn stat_config(&self) -> StatConfig {
        StatConfig {
            bootstrap_n: self.statistics.bootstrap_n,
            confidence: self.statistics.confidence,
            alpha: self.statistics.alpha,
            seed: self.seed,
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.predictions.validation);
        join(&mut self.predictions.test);
        if let Some(features) = &mut self.features {
            join(&mut features.train);
            join(&mut features.validation);
            join(&mut features.test);
        }
        join(&mut self.output.results);
        if let Some(p) = &mut self.output.prevalences {
            join(p);
        }
        if let Some(p) = &mut self.output.report {
            join(p);
        }
        if let Some(svm) = &mut self.svmperf {
            if let Some(dir) = &mut svm.base_dir {
                join(dir);
            }
        }
    }
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model_selection::ParamValue;

    const MINIMAL: &str = r"
dataset: imdb
predictions:
  validation: val.jsonl
  test: test.jsonl
";

    #[test]
    fn test_minimal_config_defaults() {
        let config = RunConfig::from_yaml(MINIMAL).expect("parse yaml");
        assert_eq!(config.dataset, "imdb");
        assert_eq!(config.seed, 42);
        assert_eq!(config.sample_size, 500);
        assert_eq!(config.samples_per_prevalence, 100);
        assert!(!config.include_bounds);
        assert!(!config.primary_only);
        assert!(config.note.is_empty());
        assert!(config.features.is_none());
        assert!(config.svmperf.is_none());
        assert!(config.em.enabled);
        assert_eq!(config.em.grid.len(), 20);
        assert_eq!(config.em.stopping, EmConfig::default());
        assert_eq!(config.selection.metric, Metric::Mae);
        assert_eq!(config.selection.samples_per_prevalence, 5);
        assert_eq!(config.output.results, PathBuf::from("results/results.csv"));
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
dataset: kindle
seed: 7
sample_size: 100
samples_per_prevalence: 10
include_bounds: true
note: run0
predictions:
  validation: val.jsonl
  test: test.jsonl
features:
  train: train.svm
  validation: val.svm
  test: test.svm
primary:
  name: QN-SL
  program: ./qnet
  args: "--model m.bin {input}"
em:
  grid:
    alpha: [0.1, 1.0]
    fit_prior: [true]
  max_iterations: 50
svmperf:
  base_dir: /opt/svm_perf
  losses: [nkld, q]
  grid:
    C: [0.1, 1.0]
selection:
  metric: mnkld
  parallelism: 2
"#;
        let config = RunConfig::from_yaml(yaml).expect("parse yaml");
        assert_eq!(config.sampling().seed, 7);
        assert_eq!(config.sampling().sample_size, 100);
        let primary = config.primary.as_ref().unwrap();
        assert_eq!(primary.name, "QN-SL");
        assert_eq!(primary.tool.program, PathBuf::from("./qnet"));
        assert_eq!(primary.timeout_secs, 60);
        assert_eq!(config.em.grid.len(), 2);
        assert_eq!(config.em.stopping.max_iterations, 50);
        assert!((config.em.stopping.epsilon - 1e-6).abs() < f64::EPSILON);
        let svm = config.svmperf.as_ref().unwrap();
        assert_eq!(svm.losses, vec![SvmPerfLoss::Nkld, SvmPerfLoss::Q]);
        assert_eq!(
            svm.tools().unwrap().learn.program,
            PathBuf::from("/opt/svm_perf/svm_perf_learn")
        );
        assert_eq!(config.selection.metric, Metric::Mnkld);
        assert_eq!(config.stat_config().seed, 7);
    }

    #[test]
    fn test_missing_predictions_rejected() {
        assert!(matches!(
            RunConfig::from_yaml("dataset: imdb\n"),
            Err(ConfigError::YamlError(_))
        ));
    }

    #[test]
    fn test_validation_errors() {
        let bad_size = format!("{MINIMAL}sample_size: 0\n");
        assert!(matches!(
            RunConfig::from_yaml(&bad_size),
            Err(ConfigError::InvalidValue { .. })
        ));

        let primary_only = format!("{MINIMAL}primary_only: true\n");
        assert!(matches!(
            RunConfig::from_yaml(&primary_only),
            Err(ConfigError::MissingField(_))
        ));

        let no_tools = format!("{MINIMAL}svmperf:\n  losses: [kld]\n");
        assert!(matches!(
            RunConfig::from_yaml(&no_tools),
            Err(ConfigError::MissingField(_))
        ));

        let bad_c = format!("{MINIMAL}svmperf:\n  base_dir: /x\n  grid:\n    C: [0.0]\n");
        assert!(matches!(
            RunConfig::from_yaml(&bad_c),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_explicit_svmperf_commands() {
        let yaml = format!(
            "{MINIMAL}svmperf:\n  learn:\n    program: sh\n    prefix_args: [learn.sh]\n  classify:\n    program: sh\n    prefix_args: [classify.sh]\n"
        );
        let config = RunConfig::from_yaml(&yaml).unwrap();
        let tools = config.svmperf.unwrap().tools().unwrap();
        assert_eq!(tools.learn.prefix_args, vec!["learn.sh".to_string()]);
        assert_eq!(tools.timeout_secs, 600);
    }

    #[test]
    fn test_grid_values_parse() {
        let yaml = format!("{MINIMAL}em:\n  grid:\n    alpha: [1]\n    fit_prior: [false]\n");
        let config = RunConfig::from_yaml(&yaml).unwrap();
        let candidates = config.em.grid.candidates();
        assert_eq!(candidates[0]["alpha"], ParamValue::Float(1.0));
        assert_eq!(candidates[0]["fit_prior"], ParamValue::Bool(false));
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.predictions.test, dir.path().join("test.jsonl"));
        assert_eq!(config.output.results, dir.path().join("results/results.csv"));
    }

    #[test]
    fn test_load_glob() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.yaml"), MINIMAL).unwrap();
        std::fs::write(dir.path().join("b.yaml"), MINIMAL.replace("imdb", "hp")).unwrap();
        let pattern = format!("{}/*.yaml", dir.path().display());
        let configs = RunConfig::load_glob(&pattern).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].dataset, "imdb");
        assert_eq!(configs[1].dataset, "hp");
    }

    #[test]
    fn test_load_glob_no_matches() {
        let configs = RunConfig::load_glob("nonexistent/*.yaml").unwrap();
        assert!(configs.is_empty());
    }

    #[test]
    fn test_load_file_not_found() {
        assert!(matches!(
            RunConfig::load("nonexistent.yaml"),
            Err(ConfigError::IoError(_))
        ));
    }

    #[test]
    fn test_invalid_glob_pattern() {
        assert!(matches!(
            RunConfig::load_glob("[invalid"),
            Err(ConfigError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_config_error_display() {
        let err = invalid("sample_size", "must be positive");
        let msg = format!("{err}");
        assert!(msg.contains("sample_size"));
        assert!(msg.contains("must be positive"));
    }
}
