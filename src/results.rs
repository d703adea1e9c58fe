//! Persistent results tables.
//!
//! Scores accumulate in one CSV file across runs, one row per
//! (method, metric) pair. Per-sample prevalences go to a separate table for
//! external correlation plots.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::Path;
use thiserror::Error;

/// Evaluation mode recorded with every score
pub const SAMPLE_MODE: &str = "sample";

/// Errors reading or writing result tables
#[derive(Error, Debug)]
pub enum ResultsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Column {method} has {actual} values, expected {expected}")]
    ColumnLength {
        method: String,
        expected: usize,
        actual: usize,
    },
}

/// One line of the results table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub method: String,
    pub metric: String,
    pub score: f64,
    pub mode: String,
    pub dataset: String,
    #[serde(default)]
    pub note: String,
}

/// All rows of a results file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultsTable {
    rows: Vec<ResultRow>,
}

impl ResultsTable {
    /// Load a results file; a missing file is an empty table
    ///
    /// # Errors
    ///
    /// Returns an error for unreadable or malformed files.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ResultsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let mut reader = csv::Reader::from_path(path)?;
        let rows = reader.deserialize().collect::<Result<Vec<ResultRow>, _>>()?;
        Ok(Self { rows })
    }

    /// Append rows, writing the header only when the file is new or empty.
    /// Parent directories are created as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn append<P: AsRef<Path>>(path: P, rows: &[ResultRow]) -> Result<(), ResultsError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let needs_header = std::fs::metadata(path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Every row
    #[must_use]
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// Rows of one dataset
    #[must_use]
    pub fn for_dataset(&self, dataset: &str) -> Self {
        Self {
            rows: self.rows.iter().filter(|r| r.dataset == dataset).cloned().collect(),
        }
    }

    /// Distinct values in first-seen order
    fn distinct<'a>(&'a self, field: impl Fn(&'a ResultRow) -> &'a str) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for row in &self.rows {
            let value = field(row);
            if !seen.iter().any(|s| s == value) {
                seen.push(value.to_string());
            }
        }
        seen
    }

    /// Methods in first-seen order
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        self.distinct(|r| r.method.as_str())
    }

    /// Metrics in first-seen order
    #[must_use]
    pub fn metrics(&self) -> Vec<String> {
        self.distinct(|r| r.metric.as_str())
    }

    /// Mean score of a method under a metric across all matching rows
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_score(&self, method: &str, metric: &str) -> Option<f64> {
        let scores: Vec<f64> = self
            .rows
            .iter()
            .filter(|r| r.method == method && r.metric == metric)
            .map(|r| r.score)
            .collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }

    /// Number of rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when there are no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Write the per-sample table: `sample,target,true,<method>...`; a failed
/// estimate is an empty cell.
///
/// # Errors
///
/// Returns `ColumnLength` if a method column does not cover every sample.
pub fn write_prevalences<P: AsRef<Path>>(
    path: P,
    targets: &[f64],
    true_prevs: &[f64],
    methods: &[(String, Vec<Option<f64>>)],
) -> Result<(), ResultsError> {
    let n = true_prevs.len();
    if targets.len() != n {
        return Err(ResultsError::ColumnLength {
            method: "target".to_string(),
            expected: n,
            actual: targets.len(),
        });
    }
    for (name, values) in methods {
        if values.len() != n {
            return Err(ResultsError::ColumnLength {
                method: name.clone(),
                expected: n,
                actual: values.len(),
            });
        }
    }

    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["sample".to_string(), "target".to_string(), "true".to_string()];
    header.extend(methods.iter().map(|(name, _)| name.clone()));
    writer.write_record(&header)?;

    for i in 0..n {
        let mut record = vec![i.to_string(), targets[i].to_string(), true_prevs[i].to_string()];
        record.extend(
            methods
                .iter()
                .map(|(_, values)| values[i].map_or_else(String::new, |v| v.to_string())),
        );
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
