//! Report generation for evaluation results.
//!
//! Two reports are produced:
//! - [`FullReport`]: one run in depth (scores, MAE confidence intervals,
//!   failed and stalled sample counts, paired significance tests of every
//!   baseline against the primary estimator)
//! - [`ResultsSummary`]: mean scores per method and metric across the rows of
//!   an accumulated results table

use crate::metrics::{bonferroni_correction, bootstrap_ci, paired_t_test, Metric, SignificanceResult, StatConfig};
use crate::rates::RateEstimates;
use crate::results::ResultsTable;
use crate::runner::Evaluation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as FmtWrite;
use tabled::{Table, Tabled};

/// Full evaluation report with all analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullReport {
    /// Report metadata
    pub metadata: ReportMetadata,
    /// Validation rates used by the adjusted estimators
    pub rates: RateEstimates,
    /// Per-method results in reporting order
    pub method_results: Vec<MethodReport>,
    /// Baselines compared against the primary estimator
    pub statistical_tests: Vec<StatisticalComparison>,
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Report title
    pub title: String,
    /// Dataset identifier
    pub dataset: String,
    /// Free-text run note
    pub note: String,
    /// Report generation timestamp
    pub generated_at: DateTime<Utc>,
    /// Framework version
    pub framework_version: String,
    /// Number of test samples
    pub samples: usize,
    /// Items per sample
    pub sample_size: usize,
    /// Statistical configuration used
    pub stat_config: StatConfigSummary,
}

/// Statistical configuration summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatConfigSummary {
    /// Bootstrap resamples
    pub bootstrap_n: usize,
    /// Confidence level
    pub confidence: f64,
    /// Significance threshold before correction
    pub alpha: f64,
    /// Threshold after Bonferroni correction
    pub corrected_alpha: f64,
}

/// Metric value with confidence interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricWithCI {
    /// Point estimate
    pub value: f64,
    /// Lower bound of CI
    pub ci_lower: f64,
    /// Upper bound of CI
    pub ci_upper: f64,
}

/// Detailed per-method report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodReport {
    pub method: String,
    pub is_primary: bool,
    /// Scores keyed by metric name, in reporting order
    pub scores: Vec<(String, f64)>,
    /// MAE with a bootstrap CI over per-sample absolute errors
    pub mae: Option<MetricWithCI>,
    pub failed: usize,
    pub stalled: usize,
    pub selected_params: Option<String>,
}

impl MethodReport {
    fn score(&self, metric: Metric) -> Option<f64> {
        self.scores
            .iter()
            .find(|(name, _)| name == metric.name())
            .map(|(_, s)| *s)
    }
}

/// Paired comparison of a baseline against the primary estimator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticalComparison {
    /// Baseline method
    pub baseline: String,
    /// Primary method
    pub primary: String,
    /// Samples where both produced an estimate
    pub paired_samples: usize,
    /// Test over per-sample absolute errors (baseline minus primary)
    pub significance: SignificanceResult,
}

/// Builds a [`FullReport`] from one evaluation
pub struct ReportBuilder<'a> {
    evaluation: &'a Evaluation,
    stat_config: StatConfig,
}

impl<'a> ReportBuilder<'a> {
    /// Start a report for an evaluation
    #[must_use]
    pub fn from_evaluation(evaluation: &'a Evaluation) -> Self {
        Self {
            evaluation,
            stat_config: StatConfig::default(),
        }
    }

    /// Set statistical configuration
    #[must_use]
    pub fn with_stat_config(mut self, config: StatConfig) -> Self {
        self.stat_config = config;
        self
    }

    /// Build the full report
    #[must_use]
    pub fn build(self) -> FullReport {
        let eval = self.evaluation;
        let baselines = match &eval.primary {
            Some(primary) => eval.methods.iter().filter(|m| &m.name != primary).count(),
            None => 0,
        };
        let corrected_alpha = bonferroni_correction(self.stat_config.alpha, baselines);

        FullReport {
            metadata: ReportMetadata {
                title: format!("Quantification Report: {}", eval.dataset),
                dataset: eval.dataset.clone(),
                note: eval.note.clone(),
                generated_at: Utc::now(),
                framework_version: env!("CARGO_PKG_VERSION").to_string(),
                samples: eval.true_prevalences.len(),
                sample_size: eval.sample_size,
                stat_config: StatConfigSummary {
                    bootstrap_n: self.stat_config.bootstrap_n,
                    confidence: self.stat_config.confidence,
                    alpha: self.stat_config.alpha,
                    corrected_alpha,
                },
            },
            rates: eval.rates,
            method_results: self.build_method_reports(),
            statistical_tests: self.build_statistical_tests(corrected_alpha),
        }
    }

    fn build_method_reports(&self) -> Vec<MethodReport> {
        let eval = self.evaluation;
        eval.methods
            .iter()
            .map(|m| {
                let errors: Vec<f64> = eval
                    .absolute_errors(&m.name)
                    .unwrap_or_default()
                    .into_iter()
                    .flatten()
                    .collect();
                let mae = m.score(Metric::Mae).map(|value| {
                    let (ci_lower, ci_upper) = bootstrap_ci(&errors, &self.stat_config);
                    MetricWithCI {
                        value,
                        ci_lower,
                        ci_upper,
                    }
                });
                MethodReport {
                    method: m.name.clone(),
                    is_primary: eval.primary.as_deref() == Some(m.name.as_str()),
                    scores: m
                        .scores
                        .iter()
                        .map(|(metric, score)| (metric.name().to_string(), *score))
                        .collect(),
                    mae,
                    failed: m.failed,
                    stalled: m.stalled,
                    selected_params: m.selected_params.clone(),
                }
            })
            .collect()
    }

    fn build_statistical_tests(&self, alpha: f64) -> Vec<StatisticalComparison> {
        let eval = self.evaluation;
        let Some(primary) = &eval.primary else {
            return Vec::new();
        };
        let Some(primary_errors) = eval.absolute_errors(primary) else {
            return Vec::new();
        };

        let mut comparisons = Vec::new();
        for method in eval.methods.iter().filter(|m| &m.name != primary) {
            let Some(errors) = eval.absolute_errors(&method.name) else {
                continue;
            };
            let (baseline, reference): (Vec<f64>, Vec<f64>) = errors
                .iter()
                .zip(&primary_errors)
                .filter_map(|(b, p)| b.zip(*p))
                .unzip();
            if let Some(significance) = paired_t_test(&baseline, &reference, alpha) {
                comparisons.push(StatisticalComparison {
                    baseline: method.name.clone(),
                    primary: primary.clone(),
                    paired_samples: baseline.len(),
                    significance,
                });
            }
        }
        comparisons
    }
}

fn format_score(score: Option<f64>) -> String {
    score.map_or_else(|| "-".to_string(), |s| format!("{s:.5}"))
}

/// Table row for text/markdown output
#[derive(Tabled)]
struct ScoreTableRow {
    #[tabled(rename = "Method")]
    method: String,
    #[tabled(rename = "MAE [CI]")]
    mae: String,
    #[tabled(rename = "MSE")]
    mse: String,
    #[tabled(rename = "MNKLD")]
    mnkld: String,
    #[tabled(rename = "MKLD")]
    mkld: String,
    #[tabled(rename = "MRAE")]
    mrae: String,
    #[tabled(rename = "Failed")]
    failed: usize,
    #[tabled(rename = "Stalled")]
    stalled: usize,
    #[tabled(rename = "Params")]
    params: String,
}

impl FullReport {
    /// Render report as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render report as markdown
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        writeln!(output, "# {}", self.metadata.title).ok();
        writeln!(output).ok();
        writeln!(
            output,
            "**Generated:** {}",
            self.metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
        .ok();
        writeln!(output, "**Framework Version:** {}", self.metadata.framework_version).ok();
        if !self.metadata.note.is_empty() {
            writeln!(output, "**Note:** {}", self.metadata.note).ok();
        }
        writeln!(
            output,
            "**Samples:** {} of {} items",
            self.metadata.samples, self.metadata.sample_size
        )
        .ok();
        writeln!(output).ok();

        writeln!(output, "## Validation Rates").ok();
        writeln!(output).ok();
        writeln!(output, "| tpr | fpr | ptpr | pfpr |").ok();
        writeln!(output, "|-----|-----|------|------|").ok();
        writeln!(
            output,
            "| {:.4} | {:.4} | {:.4} | {:.4} |",
            self.rates.tpr, self.rates.fpr, self.rates.ptpr, self.rates.pfpr
        )
        .ok();
        writeln!(output).ok();

        writeln!(output, "## Method Results").ok();
        writeln!(output).ok();
        let rows: Vec<ScoreTableRow> = self
            .method_results
            .iter()
            .map(|r| ScoreTableRow {
                method: if r.is_primary {
                    format!("{} (primary)", r.method)
                } else {
                    r.method.clone()
                },
                mae: r.mae.as_ref().map_or_else(
                    || "-".to_string(),
                    |m| format!("{:.5} [{:.5}-{:.5}]", m.value, m.ci_lower, m.ci_upper),
                ),
                mse: format_score(r.score(Metric::Mse)),
                mnkld: format_score(r.score(Metric::Mnkld)),
                mkld: format_score(r.score(Metric::Mkld)),
                mrae: format_score(r.score(Metric::Mrae)),
                failed: r.failed,
                stalled: r.stalled,
                params: r.selected_params.clone().unwrap_or_default(),
            })
            .collect();
        writeln!(output, "{}", Table::new(rows)).ok();
        writeln!(output).ok();

        if !self.statistical_tests.is_empty() {
            writeln!(output, "## Statistical Comparisons").ok();
            writeln!(output).ok();
            writeln!(
                output,
                "Paired t-tests on per-sample absolute errors, α = {:.4} after Bonferroni correction.",
                self.metadata.stat_config.corrected_alpha
            )
            .ok();
            writeln!(output).ok();
            writeln!(output, "| Comparison | n | t-stat | p-value | Effect Size | Significant |").ok();
            writeln!(output, "|------------|---|--------|---------|-------------|-------------|").ok();
            for test in &self.statistical_tests {
                writeln!(
                    output,
                    "| {} vs {} | {} | {:.3} | {:.4} | {} ({:.2}) | {} |",
                    test.baseline,
                    test.primary,
                    test.paired_samples,
                    test.significance.t_statistic,
                    test.significance.p_value,
                    test.significance.effect_interpretation,
                    test.significance.cohens_d,
                    if test.significance.is_significant { "Yes" } else { "No" }
                )
                .ok();
            }
            writeln!(output).ok();
        }

        writeln!(output, "## Configuration").ok();
        writeln!(output).ok();
        writeln!(output, "- Bootstrap resamples: {}", self.metadata.stat_config.bootstrap_n).ok();
        writeln!(
            output,
            "- Confidence level: {}%",
            self.metadata.stat_config.confidence * 100.0
        )
        .ok();
        writeln!(output, "- Significance threshold (α): {}", self.metadata.stat_config.alpha).ok();

        output
    }
}

/// Mean score of one method under every metric found in a results table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSummary {
    pub method: String,
    /// `(metric, mean score)` in first-seen metric order; missing pairs are absent
    pub scores: Vec<(String, f64)>,
}

/// Cross-run summary of an accumulated results table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub dataset: Option<String>,
    pub rows: usize,
    pub metrics: Vec<String>,
    pub methods: Vec<MethodSummary>,
}

impl ResultsSummary {
    /// Summarize a table, optionally restricted to one dataset
    #[must_use]
    pub fn from_table(table: &ResultsTable, dataset: Option<&str>) -> Self {
        let table = match dataset {
            Some(d) => table.for_dataset(d),
            None => table.clone(),
        };
        let metrics = table.metrics();
        let methods = table
            .methods()
            .into_iter()
            .map(|method| {
                let scores = metrics
                    .iter()
                    .filter_map(|metric| table.mean_score(&method, metric).map(|s| (metric.clone(), s)))
                    .collect();
                MethodSummary { method, scores }
            })
            .collect();
        Self {
            dataset: dataset.map(str::to_string),
            rows: table.len(),
            metrics,
            methods,
        }
    }

    /// Render as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Render as a markdown table, methods as rows and metrics as columns
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        let title = self
            .dataset
            .as_ref()
            .map_or_else(|| "all datasets".to_string(), Clone::clone);
        writeln!(output, "# Results Summary: {title}").ok();
        writeln!(output).ok();
        writeln!(output, "Mean scores over {} result rows.", self.rows).ok();
        writeln!(output).ok();

        let mut builder = tabled::builder::Builder::default();
        let mut header = vec!["Method".to_string()];
        header.extend(self.metrics.iter().cloned());
        builder.push_record(header);
        for m in &self.methods {
            let mut record = vec![m.method.clone()];
            record.extend(self.metrics.iter().map(|metric| {
                format_score(m.scores.iter().find(|(name, _)| name == metric).map(|(_, s)| *s))
            }));
            builder.push_record(record);
        }
        writeln!(output, "{}", builder.build()).ok();
        output
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_precision_loss)]
mod tests {
    use super::*;
    use crate::results::{ResultRow, SAMPLE_MODE};
    use crate::runner::MethodOutcome;

    fn outcome(name: &str, estimates: Vec<Option<f64>>, truth: &[f64]) -> MethodOutcome {
        let (t, e): (Vec<f64>, Vec<f64>) = truth
            .iter()
            .zip(&estimates)
            .filter_map(|(&p, est)| est.map(|x| (p, x)))
            .unzip();
        let scores = Metric::ALL
            .iter()
            .map(|&m| (m, m.evaluate(&t, &e, 0.01).unwrap()))
            .collect();
        MethodOutcome {
            name: name.to_string(),
            failed: estimates.iter().filter(|e| e.is_none()).count(),
            estimates,
            stalled: 0,
            scores,
            selected_params: None,
        }
    }

    fn evaluation() -> Evaluation {
        let truth: Vec<f64> = (0..40).map(|i| f64::from(i % 19 + 1) * 0.05).collect();
        let primary: Vec<Option<f64>> = truth
            .iter()
            .enumerate()
            .map(|(i, p)| Some(p + if i % 2 == 0 { 0.01 } else { -0.012 }))
            .collect();
        let cc: Vec<Option<f64>> = truth
            .iter()
            .enumerate()
            .map(|(i, p)| Some(0.2 + 0.6 * p + if i % 3 == 0 { 0.02 } else { 0.0 }))
            .collect();
        let mut em: Vec<Option<f64>> = truth.iter().map(|p| Some(p * 0.9)).collect();
        em[3] = None;
        Evaluation {
            dataset: "imdb".to_string(),
            note: "run0".to_string(),
            sample_size: 100,
            rates: RateEstimates::perfect(),
            targets: truth.clone(),
            methods: vec![
                outcome("cc", cc, &truth),
                outcome("em", em, &truth),
                outcome("qn", primary, &truth),
            ],
            true_prevalences: truth,
            primary: Some("qn".to_string()),
        }
    }

    fn stat_config() -> StatConfig {
        StatConfig {
            bootstrap_n: 500,
            ..StatConfig::default()
        }
    }

    #[test]
    fn test_report_structure() {
        let eval = evaluation();
        let report = ReportBuilder::from_evaluation(&eval).with_stat_config(stat_config()).build();
        assert_eq!(report.metadata.dataset, "imdb");
        assert_eq!(report.metadata.samples, 40);
        assert_eq!(report.method_results.len(), 3);
        assert!(report.method_results[2].is_primary);
        assert_eq!(report.method_results[1].failed, 1);
        assert!((report.metadata.stat_config.corrected_alpha - 0.025).abs() < 1e-12);
    }

    #[test]
    fn test_mae_ci_brackets_value() {
        let eval = evaluation();
        let report = ReportBuilder::from_evaluation(&eval).with_stat_config(stat_config()).build();
        for r in &report.method_results {
            let mae = r.mae.as_ref().unwrap();
            assert!(mae.ci_lower <= mae.value + 1e-12);
            assert!(mae.ci_upper >= mae.value - 1e-12);
        }
    }

    #[test]
    fn test_significance_against_primary() {
        let eval = evaluation();
        let report = ReportBuilder::from_evaluation(&eval).with_stat_config(stat_config()).build();
        assert_eq!(report.statistical_tests.len(), 2);
        let cc = &report.statistical_tests[0];
        assert_eq!(cc.baseline, "cc");
        assert_eq!(cc.primary, "qn");
        assert_eq!(cc.paired_samples, 40);
        assert!(cc.significance.is_significant);
        assert_eq!(report.statistical_tests[1].paired_samples, 39);
    }

    #[test]
    fn test_no_primary_means_no_tests() {
        let mut eval = evaluation();
        eval.primary = None;
        let report = ReportBuilder::from_evaluation(&eval).with_stat_config(stat_config()).build();
        assert!(report.statistical_tests.is_empty());
        assert!(report.method_results.iter().all(|r| !r.is_primary));
    }

    #[test]
    fn test_markdown_and_json() {
        let eval = evaluation();
        let report = ReportBuilder::from_evaluation(&eval).with_stat_config(stat_config()).build();
        let md = report.to_markdown();
        assert!(md.contains("# Quantification Report: imdb"));
        assert!(md.contains("qn (primary)"));
        assert!(md.contains("## Statistical Comparisons"));
        assert!(md.contains("cc vs qn"));
        let json = report.to_json().unwrap();
        assert!(json.contains("\"method_results\""));
        assert!(json.contains("\"corrected_alpha\""));
    }

    #[test]
    fn test_results_summary() {
        let row = |method: &str, metric: &str, score: f64, dataset: &str| ResultRow {
            method: method.to_string(),
            metric: metric.to_string(),
            score,
            mode: SAMPLE_MODE.to_string(),
            dataset: dataset.to_string(),
            note: String::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        ResultsTable::append(
            &path,
            &[
                row("cc", "mae", 0.10, "imdb"),
                row("qn", "mae", 0.02, "imdb"),
                row("cc", "mae", 0.20, "imdb"),
                row("cc", "mse", 0.05, "imdb"),
                row("cc", "mae", 0.90, "hp"),
            ],
        )
        .unwrap();
        let table = ResultsTable::load(&path).unwrap();

        let summary = ResultsSummary::from_table(&table, Some("imdb"));
        assert_eq!(summary.rows, 4);
        assert_eq!(summary.metrics, vec!["mae", "mse"]);
        let cc = &summary.methods[0];
        assert_eq!(cc.method, "cc");
        assert!((cc.scores[0].1 - 0.15).abs() < 1e-12);
        let qn = &summary.methods[1];
        assert_eq!(qn.scores.len(), 1);

        let md = summary.to_markdown();
        assert!(md.contains("Results Summary: imdb"));
        assert!(md.contains("0.15000"));
        assert!(summary.to_json().unwrap().contains("\"methods\""));

        let all = ResultsSummary::from_table(&table, None);
        assert_eq!(all.rows, 5);
    }
}
