//! Adapter for the SVMperf loss-optimizing quantifier.
//!
//! Training and prediction shell out to `svm_perf_learn` and
//! `svm_perf_classify`, exchanging SVMlight files through a private scratch
//! directory. The estimated prevalence is the fraction of positive decision
//! values.

use crate::data::FeatureMatrix;
use crate::quantifier::{FeatureQuantifier, PrevalenceEstimate, QuantifierError};
use crate::subprocess::{run_tool, ExternalError, ToolCommand};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tempfile::TempDir;

/// Quantification losses SVMperf can optimize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SvmPerfLoss {
    /// Kullback-Leibler divergence
    Kld,
    /// Normalized KLD
    Nkld,
    /// Q-measure
    Q,
    /// Mean absolute error
    Mae,
    /// Mean relative absolute error
    Mrae,
}

impl SvmPerfLoss {
    /// Losses evaluated by default
    pub const DEFAULT_SET: [Self; 3] = [Self::Kld, Self::Nkld, Self::Q];

    /// Numeric code passed via `-l`
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Kld => 12,
            Self::Nkld => 13,
            Self::Q => 22,
            Self::Mae => 26,
            Self::Mrae => 27,
        }
    }

    /// Short loss name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Kld => "kld",
            Self::Nkld => "nkld",
            Self::Q => "q",
            Self::Mae => "mae",
            Self::Mrae => "mrae",
        }
    }

    /// Method name used in result tables, e.g. `svm-nkld`
    #[must_use]
    pub fn method_name(self) -> String {
        format!("svm-{}", self.as_str())
    }
}

impl fmt::Display for SvmPerfLoss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SvmPerfLoss {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kld" => Ok(Self::Kld),
            "nkld" => Ok(Self::Nkld),
            "q" => Ok(Self::Q),
            "mae" => Ok(Self::Mae),
            "mrae" => Ok(Self::Mrae),
            other => Err(format!("unknown svmperf loss: {other}")),
        }
    }
}

/// Locations of the two SVMperf executables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvmPerfTools {
    /// Training executable
    pub learn: ToolCommand,
    /// Prediction executable
    pub classify: ToolCommand,
    /// Per-invocation timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    600
}

impl SvmPerfTools {
    /// Tools from an SVMperf build directory
    pub fn from_dir(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            learn: ToolCommand::new(base.join("svm_perf_learn")),
            classify: ToolCommand::new(base.join("svm_perf_classify")),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Timeout as a duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// A trained model file kept alive with its scratch directory
#[derive(Debug)]
struct TrainedModel {
    _dir: TempDir,
    path: PathBuf,
}

/// SVMperf quantifier for one loss and one `C`
#[derive(Debug)]
pub struct SvmPerfQuantifier {
    tools: SvmPerfTools,
    loss: SvmPerfLoss,
    c: f64,
    model: Option<TrainedModel>,
}

impl SvmPerfQuantifier {
    /// Create an untrained adapter
    #[must_use]
    pub const fn new(tools: SvmPerfTools, loss: SvmPerfLoss, c: f64) -> Self {
        Self {
            tools,
            loss,
            c,
            model: None,
        }
    }

    /// Optimized loss
    #[must_use]
    pub const fn loss(&self) -> SvmPerfLoss {
        self.loss
    }

    /// Regularization trade-off
    #[must_use]
    pub const fn c(&self) -> f64 {
        self.c
    }

    fn path_arg(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }
}

/// Labels alternate so the classifier input always holds both classes
fn placeholder_labels(n: usize) -> Vec<u8> {
    (0..n).map(|i| u8::from(i % 2 == 0)).collect()
}

/// Parse one decision value per line
fn parse_decisions(tool: &str, content: &str, expected: usize) -> Result<Vec<f64>, ExternalError> {
    let values = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            line.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ExternalError::MalformedOutput {
                    tool: tool.to_string(),
                    reason: format!("line {}: invalid decision value '{line}'", i + 1),
                })
        })
        .collect::<Result<Vec<f64>, _>>()?;
    if values.len() != expected {
        return Err(ExternalError::MalformedOutput {
            tool: tool.to_string(),
            reason: format!("expected {expected} predictions, got {}", values.len()),
        });
    }
    Ok(values)
}

impl FeatureQuantifier for SvmPerfQuantifier {
    fn fit(&mut self, features: &FeatureMatrix, labels: &[u8]) -> Result<(), QuantifierError> {
        if labels.is_empty() {
            return Err(QuantifierError::InvalidTrainingData("no training rows".to_string()));
        }
        let dir = TempDir::new().map_err(ExternalError::from)?;
        let train_path = dir.path().join("train.dat");
        let model_path = dir.path().join("model");
        let file = File::create(&train_path).map_err(ExternalError::from)?;
        features.write_svmlight(BufWriter::new(file), labels)?;

        let args = vec![
            "-c".to_string(),
            self.c.to_string(),
            "-l".to_string(),
            self.loss.code().to_string(),
            Self::path_arg(&train_path),
            Self::path_arg(&model_path),
        ];
        run_tool(&self.tools.learn, &args, dir.path(), self.tools.timeout())?;
        if !model_path.exists() {
            return Err(ExternalError::MalformedOutput {
                tool: self.tools.learn.display_name(),
                reason: "no model file written".to_string(),
            }
            .into());
        }

        self.model = Some(TrainedModel {
            _dir: dir,
            path: model_path,
        });
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn predict(&self, features: &FeatureMatrix) -> Result<PrevalenceEstimate, QuantifierError> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| QuantifierError::NotFitted(self.loss.method_name()))?;
        let n = features.n_rows();
        if n == 0 {
            return Err(QuantifierError::EmptySample);
        }

        let dir = TempDir::new().map_err(ExternalError::from)?;
        let test_path = dir.path().join("test.dat");
        let predictions_path = dir.path().join("predictions");
        let file = File::create(&test_path).map_err(ExternalError::from)?;
        features.write_svmlight(BufWriter::new(file), &placeholder_labels(n))?;

        let args = vec![
            Self::path_arg(&test_path),
            Self::path_arg(&model.path),
            Self::path_arg(&predictions_path),
        ];
        run_tool(&self.tools.classify, &args, dir.path(), self.tools.timeout())?;

        let tool = self.tools.classify.display_name();
        let content = std::fs::read_to_string(&predictions_path).map_err(|_| ExternalError::MalformedOutput {
            tool: tool.clone(),
            reason: "no predictions file written".to_string(),
        })?;
        let decisions = parse_decisions(&tool, &content, n)?;
        let positives = decisions.iter().filter(|&&d| d > 0.0).count();
        Ok(PrevalenceEstimate::new(positives as f64 / n as f64))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_codes_and_names() {
        assert_eq!(SvmPerfLoss::Kld.code(), 12);
        assert_eq!(SvmPerfLoss::Nkld.code(), 13);
        assert_eq!(SvmPerfLoss::Q.code(), 22);
        assert_eq!(SvmPerfLoss::Mae.code(), 26);
        assert_eq!(SvmPerfLoss::Mrae.code(), 27);
        assert_eq!(SvmPerfLoss::Nkld.method_name(), "svm-nkld");
        assert_eq!("Q".parse::<SvmPerfLoss>().unwrap(), SvmPerfLoss::Q);
        assert!("hinge".parse::<SvmPerfLoss>().is_err());
    }

    #[test]
    fn test_from_dir() {
        let tools = SvmPerfTools::from_dir("/opt/svm_perf");
        assert_eq!(tools.learn.program, PathBuf::from("/opt/svm_perf/svm_perf_learn"));
        assert_eq!(tools.classify.program, PathBuf::from("/opt/svm_perf/svm_perf_classify"));
        assert_eq!(tools.timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_placeholder_labels_alternate() {
        assert_eq!(placeholder_labels(5), vec![1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_parse_decisions() {
        let values = parse_decisions("t", "0.5\n-1.2\n\n3\n", 3).unwrap();
        assert_eq!(values, vec![0.5, -1.2, 3.0]);
        assert!(matches!(
            parse_decisions("t", "0.5\n", 2),
            Err(ExternalError::MalformedOutput { .. })
        ));
        assert!(matches!(
            parse_decisions("t", "0.5\nfoo\n", 2),
            Err(ExternalError::MalformedOutput { .. })
        ));
    }

    #[test]
    fn test_predict_before_fit() {
        let q = SvmPerfQuantifier::new(SvmPerfTools::from_dir("/nonexistent"), SvmPerfLoss::Kld, 1.0);
        let x = FeatureMatrix::from_dense(&[vec![1.0]]);
        assert!(matches!(q.predict(&x), Err(QuantifierError::NotFitted(_))));
    }

    #[test]
    fn test_missing_binary_is_tool_not_found() {
        let mut q = SvmPerfQuantifier::new(SvmPerfTools::from_dir("/nonexistent"), SvmPerfLoss::Kld, 1.0);
        let x = FeatureMatrix::from_dense(&[vec![1.0], vec![0.0, 1.0]]);
        let err = q.fit(&x, &[1, 0]).unwrap_err();
        assert!(matches!(
            err,
            QuantifierError::External(ExternalError::ToolNotFound(_))
        ));
    }

    #[cfg(unix)]
    mod fake_tools {
        use super::*;

        fn script(dir: &Path, name: &str, body: &str) -> ToolCommand {
            let path = dir.join(name);
            std::fs::write(&path, body).unwrap();
            ToolCommand::with_prefix("sh", vec![path.to_string_lossy().into_owned()])
        }

        /// learn copies the training file; classify marks rows holding feature 1
        fn tools(dir: &Path, classify_body: &str) -> SvmPerfTools {
            SvmPerfTools {
                learn: script(dir, "learn.sh", "cp \"$5\" \"$6\"\n"),
                classify: script(dir, "classify.sh", classify_body),
                timeout_secs: 30,
            }
        }

        const CLASSIFY: &str =
            "awk '{ if ($2 ~ /^1:/) print 0.7; else print -0.4 }' \"$1\" > \"$3\"\n";

        fn data() -> (FeatureMatrix, Vec<u8>) {
            let dense: Vec<Vec<f64>> = (0..10)
                .map(|i| if i < 4 { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
                .collect();
            let labels = (0..10).map(|i| u8::from(i < 4)).collect();
            (FeatureMatrix::from_dense(&dense), labels)
        }

        #[test]
        fn test_fit_and_predict_with_fake_tools() {
            let bin = tempfile::tempdir().unwrap();
            let (x, y) = data();
            let mut q = SvmPerfQuantifier::new(tools(bin.path(), CLASSIFY), SvmPerfLoss::Nkld, 10.0);
            q.fit(&x, &y).unwrap();
            let estimate = q.predict(&x).unwrap();
            assert!((estimate.prevalence() - 0.4).abs() < 1e-12);
        }

        #[test]
        fn test_learn_receives_c_and_loss_code() {
            let bin = tempfile::tempdir().unwrap();
            let log = bin.path().join("args.txt");
            let learn_body = format!(
                "echo \"$1 $2 $3 $4\" > '{}'\ncp \"$5\" \"$6\"\n",
                log.display()
            );
            let mut t = tools(bin.path(), CLASSIFY);
            t.learn = script(bin.path(), "learn_log.sh", &learn_body);
            let (x, y) = data();
            let mut q = SvmPerfQuantifier::new(t, SvmPerfLoss::Q, 0.01);
            q.fit(&x, &y).unwrap();
            assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "-c 0.01 -l 22");
        }

        #[test]
        fn test_malformed_predictions() {
            let bin = tempfile::tempdir().unwrap();
            let (x, y) = data();
            let mut q = SvmPerfQuantifier::new(
                tools(bin.path(), "echo 0.5 > \"$3\"\n"),
                SvmPerfLoss::Kld,
                1.0,
            );
            q.fit(&x, &y).unwrap();
            let err = q.predict(&x).unwrap_err();
            assert!(matches!(
                err,
                QuantifierError::External(ExternalError::MalformedOutput { .. })
            ));
        }

        #[test]
        fn test_failing_learner() {
            let bin = tempfile::tempdir().unwrap();
            let mut t = tools(bin.path(), CLASSIFY);
            t.learn = script(bin.path(), "fail.sh", "echo 'bad C' >&2\nexit 1\n");
            let (x, y) = data();
            let mut q = SvmPerfQuantifier::new(t, SvmPerfLoss::Kld, 1.0);
            let err = q.fit(&x, &y).unwrap_err();
            assert!(matches!(
                err,
                QuantifierError::External(ExternalError::ExecutionFailed { .. })
            ));
        }
    }
}
