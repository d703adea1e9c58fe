//! Labeled prediction sets, sparse feature matrices and label validation.
//!
//! Everything that enters the evaluation is validated eagerly here: shape
//! mismatches, non-binary encodings, multi-label rows and unknown classes are
//! reported as distinct errors instead of being coerced.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating evaluation data
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Dimension mismatch in {context}: expected {expected}, found {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("Non-binary encoding at row {row}: {value}")]
    NonBinaryEncoding { row: usize, value: String },

    #[error("Multi-label violation at row {row}: {active} active labels (exactly one required)")]
    MultiLabelViolation { row: usize, active: usize },

    #[error("Unknown class: {0}")]
    UnknownClass(String),

    #[error("Soft prediction out of [0, 1] at row {row}: {value}")]
    ProbabilityOutOfRange { row: usize, value: f64 },

    #[error("Malformed record at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Gold labels paired with classifier outputs over a fixed item ordering
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionSet {
    labels: Vec<u8>,
    hard: Vec<u8>,
    soft: Vec<f64>,
}

/// One line of a predictions file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PredictionRecord {
    label: i64,
    soft: f64,
    #[serde(default)]
    hard: Option<i64>,
}

impl PredictionSet {
    /// Build a prediction set, validating lengths, encodings and ranges.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if the arrays differ in length,
    /// `NonBinaryEncoding` for labels or hard predictions outside {0, 1}
    /// and `ProbabilityOutOfRange` for soft values outside [0, 1].
    pub fn new(labels: Vec<u8>, hard: Vec<u8>, soft: Vec<f64>) -> Result<Self, DataError> {
        check_len("hard predictions", labels.len(), hard.len())?;
        check_len("soft predictions", labels.len(), soft.len())?;

        for (row, (&label, &h)) in labels.iter().zip(&hard).enumerate() {
            for value in [label, h] {
                if value > 1 {
                    return Err(DataError::NonBinaryEncoding {
                        row,
                        value: value.to_string(),
                    });
                }
            }
        }
        for (row, &value) in soft.iter().enumerate() {
            if !(0.0..=1.0).contains(&value) {
                return Err(DataError::ProbabilityOutOfRange { row, value });
            }
        }

        Ok(Self { labels, hard, soft })
    }

    /// Build from soft outputs only; hard predictions threshold at 0.5.
    ///
    /// # Errors
    ///
    /// Same as [`PredictionSet::new`].
    pub fn from_soft(labels: Vec<u8>, soft: Vec<f64>) -> Result<Self, DataError> {
        let hard = soft.iter().map(|&p| u8::from(p >= 0.5)).collect();
        Self::new(labels, hard, soft)
    }

    /// Load a JSON Lines predictions file (`{"label":1,"soft":0.8,"hard":1}`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a line is malformed, or
    /// the resulting set fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DataError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parse JSON Lines predictions from any reader.
    ///
    /// # Errors
    ///
    /// See [`PredictionSet::load`].
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, DataError> {
        let mut labels = Vec::new();
        let mut hard = Vec::new();
        let mut soft = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record: PredictionRecord =
                serde_json::from_str(trimmed).map_err(|e| DataError::Parse {
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            let row = labels.len();
            labels.push(binary_value(record.label, row)?);
            let h = match record.hard {
                Some(h) => binary_value(h, row)?,
                None => u8::from(record.soft >= 0.5),
            };
            hard.push(h);
            soft.push(record.soft);
        }

        Self::new(labels, hard, soft)
    }

    /// Number of items
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the set holds no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Gold labels
    #[must_use]
    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    /// Hard 0/1 predictions
    #[must_use]
    pub fn hard(&self) -> &[u8] {
        &self.hard
    }

    /// Soft positive-class scores
    #[must_use]
    pub fn soft(&self) -> &[f64] {
        &self.soft
    }

    /// Fraction of gold-positive items
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn prevalence(&self) -> f64 {
        if self.labels.is_empty() {
            return 0.0;
        }
        self.labels.iter().filter(|&&l| l == 1).count() as f64 / self.labels.len() as f64
    }

    /// Split item ids into (positive, negative) pools by gold label
    #[must_use]
    pub fn split_pos_neg(&self) -> (Vec<usize>, Vec<usize>) {
        (0..self.labels.len()).partition(|&i| self.labels[i] == 1)
    }
}

pub(crate) fn check_len(context: &str, expected: usize, actual: usize) -> Result<(), DataError> {
    if expected == actual {
        Ok(())
    } else {
        Err(DataError::DimensionMismatch {
            context: context.to_string(),
            expected,
            actual,
        })
    }
}

fn binary_value(value: i64, row: usize) -> Result<u8, DataError> {
    match value {
        0 => Ok(0),
        1 => Ok(1),
        other => Err(DataError::NonBinaryEncoding {
            row,
            value: other.to_string(),
        }),
    }
}

/// Sparse row-major feature matrix (SVMlight layout, 0-based in memory)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureMatrix {
    rows: Vec<Vec<(usize, f64)>>,
    n_features: usize,
}

impl FeatureMatrix {
    /// Build from sparse rows; entries are sorted by index.
    #[must_use]
    pub fn new(mut rows: Vec<Vec<(usize, f64)>>) -> Self {
        for row in &mut rows {
            row.sort_by_key(|&(i, _)| i);
        }
        let n_features = rows
            .iter()
            .filter_map(|r| r.last().map(|&(i, _)| i + 1))
            .max()
            .unwrap_or(0);
        Self { rows, n_features }
    }

    /// Build from dense rows, dropping zero entries
    #[must_use]
    pub fn from_dense(rows: &[Vec<f64>]) -> Self {
        let n_features = rows.iter().map(Vec::len).max().unwrap_or(0);
        let rows = rows
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(_, &v)| v != 0.0)
                    .map(|(i, &v)| (i, v))
                    .collect()
            })
            .collect();
        Self { rows, n_features }
    }

    /// Number of rows
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Width of the matrix (highest feature index + 1)
    #[must_use]
    pub const fn n_features(&self) -> usize {
        self.n_features
    }

    /// Sparse entries of one row
    #[must_use]
    pub fn row(&self, idx: usize) -> &[(usize, f64)] {
        &self.rows[idx]
    }

    /// Iterate over rows
    pub fn rows(&self) -> impl Iterator<Item = &[(usize, f64)]> {
        self.rows.iter().map(Vec::as_slice)
    }

    /// Copy the given rows (in the given order) into a new matrix.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if an id is out of range.
    pub fn select(&self, ids: &[usize]) -> Result<Self, DataError> {
        let mut rows = Vec::with_capacity(ids.len());
        for &id in ids {
            let row = self.rows.get(id).ok_or_else(|| DataError::DimensionMismatch {
                context: "feature row id".to_string(),
                expected: self.rows.len(),
                actual: id + 1,
            })?;
            rows.push(row.clone());
        }
        Ok(Self {
            rows,
            n_features: self.n_features,
        })
    }

    /// Read an SVMlight file, returning the matrix and its 0/1 labels.
    ///
    /// # Errors
    ///
    /// Returns an error on IO failure, malformed lines or non-binary labels.
    pub fn load_svmlight<P: AsRef<Path>>(path: P) -> Result<(Self, Vec<u8>), DataError> {
        let file = std::fs::File::open(path)?;
        Self::read_svmlight(BufReader::new(file))
    }

    /// Parse SVMlight content from a reader.
    ///
    /// # Errors
    ///
    /// See [`FeatureMatrix::load_svmlight`].
    pub fn read_svmlight<R: BufRead>(reader: R) -> Result<(Self, Vec<u8>), DataError> {
        let mut rows = Vec::new();
        let mut labels = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let content = line.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let mut tokens = content.split_whitespace();
            let label_token = tokens.next().unwrap_or_default();
            labels.push(parse_svmlight_label(label_token, labels.len())?);

            let mut row = Vec::new();
            for token in tokens {
                let (index, value) = token.split_once(':').ok_or_else(|| DataError::Parse {
                    line: idx + 1,
                    reason: format!("expected index:value, found '{token}'"),
                })?;
                if index == "qid" {
                    continue;
                }
                let index: usize = index.parse().map_err(|_| DataError::Parse {
                    line: idx + 1,
                    reason: format!("invalid feature index '{index}'"),
                })?;
                if index == 0 {
                    return Err(DataError::Parse {
                        line: idx + 1,
                        reason: "feature indices are 1-based".to_string(),
                    });
                }
                let value: f64 = value.parse().map_err(|_| DataError::Parse {
                    line: idx + 1,
                    reason: format!("invalid feature value '{value}'"),
                })?;
                row.push((index - 1, value));
            }
            rows.push(row);
        }

        Ok((Self::new(rows), labels))
    }

    /// Write rows in SVMlight format with +1/-1 labels.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if `labels` does not match the row count,
    /// or an IO error.
    pub fn write_svmlight<W: Write>(&self, mut writer: W, labels: &[u8]) -> Result<(), DataError> {
        check_len("svmlight labels", self.rows.len(), labels.len())?;
        for (row, &label) in self.rows.iter().zip(labels) {
            write!(writer, "{}", if label == 1 { "+1" } else { "-1" })?;
            for &(index, value) in row {
                write!(writer, " {}:{value}", index + 1)?;
            }
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn parse_svmlight_label(token: &str, row: usize) -> Result<u8, DataError> {
    match token {
        "+1" | "1" | "1.0" | "+1.0" => Ok(1),
        "-1" | "0" | "-1.0" | "0.0" => Ok(0),
        other => Err(DataError::NonBinaryEncoding {
            row,
            value: other.to_string(),
        }),
    }
}

/// Collapse a 0/1 indicator matrix (rows x classes) into one label per row.
///
/// # Errors
///
/// Returns `DimensionMismatch` when a row width differs from `classes`,
/// `NonBinaryEncoding` for entries other than 0/1 and
/// `MultiLabelViolation` for rows without exactly one active label.
pub fn labels_from_indicator<C: Clone>(
    matrix: &[Vec<u8>],
    classes: &[C],
) -> Result<Vec<C>, DataError> {
    let mut labels = Vec::with_capacity(matrix.len());
    for (row, entries) in matrix.iter().enumerate() {
        check_len("indicator row width", classes.len(), entries.len())?;
        if let Some(&bad) = entries.iter().find(|&&v| v > 1) {
            return Err(DataError::NonBinaryEncoding {
                row,
                value: bad.to_string(),
            });
        }
        let active: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, &v)| v == 1)
            .map(|(c, _)| c)
            .collect();
        match active.as_slice() {
            [c] => labels.push(classes[*c].clone()),
            _ => {
                return Err(DataError::MultiLabelViolation {
                    row,
                    active: active.len(),
                })
            }
        }
    }
    Ok(labels)
}

/// Check that every label belongs to `classes`.
///
/// # Errors
///
/// Returns `UnknownClass` for the first label outside `classes`.
pub fn validate_labels<C: PartialEq + Display>(labels: &[C], classes: &[C]) -> Result<(), DataError> {
    match labels.iter().find(|l| !classes.contains(l)) {
        Some(label) => Err(DataError::UnknownClass(label.to_string())),
        None => Ok(()),
    }
}

/// Bijection from a fitted model's class columns to a target class ordering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    /// `targets[fitted_column]` is the destination column
    targets: Vec<usize>,
    width: usize,
}

impl ColumnMap {
    /// Build the mapping once from the two orderings.
    ///
    /// # Errors
    ///
    /// Returns `UnknownClass` if a fitted class is absent from `target`.
    pub fn new<C: Eq + Hash + Display>(fitted: &[C], target: &[C]) -> Result<Self, DataError> {
        let positions: HashMap<&C, usize> = target.iter().enumerate().map(|(i, c)| (c, i)).collect();
        let targets = fitted
            .iter()
            .map(|class| {
                positions
                    .get(class)
                    .copied()
                    .ok_or_else(|| DataError::UnknownClass(class.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            targets,
            width: target.len(),
        })
    }

    /// True when the mapping is the identity over the full target width
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.targets.len() == self.width && self.targets.iter().enumerate().all(|(i, &t)| i == t)
    }

    /// Reorder model output rows into the target ordering.
    ///
    /// Target columns with no fitted counterpart are zero.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if a row is not as wide as the fitted ordering.
    pub fn reorder(&self, output: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, DataError> {
        if self.is_identity() {
            for row in output {
                check_len("model output width", self.targets.len(), row.len())?;
            }
            return Ok(output.to_vec());
        }
        let mut reordered = vec![vec![0.0; self.width]; output.len()];
        for (row, dest) in output.iter().zip(reordered.iter_mut()) {
            check_len("model output width", self.targets.len(), row.len())?;
            for (&value, &to) in row.iter().zip(&self.targets) {
                dest[to] = value;
            }
        }
        Ok(reordered)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_prediction_set_valid() {
        let set = PredictionSet::new(vec![1, 0, 1], vec![1, 0, 0], vec![0.9, 0.2, 0.4]).unwrap();
        assert_eq!(set.len(), 3);
        assert!((set.prevalence() - 2.0 / 3.0).abs() < 1e-12);
        let (pos, neg) = set.split_pos_neg();
        assert_eq!(pos, vec![0, 2]);
        assert_eq!(neg, vec![1]);
    }

    #[test]
    fn test_prediction_set_length_mismatch() {
        let err = PredictionSet::new(vec![1, 0], vec![1], vec![0.9, 0.1]).unwrap_err();
        assert!(matches!(err, DataError::DimensionMismatch { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_prediction_set_non_binary_label() {
        let err = PredictionSet::new(vec![2, 0], vec![1, 0], vec![0.9, 0.1]).unwrap_err();
        assert!(matches!(err, DataError::NonBinaryEncoding { row: 0, .. }));
    }

    #[test]
    fn test_prediction_set_soft_out_of_range() {
        let err = PredictionSet::new(vec![1, 0], vec![1, 0], vec![1.2, 0.1]).unwrap_err();
        assert!(matches!(err, DataError::ProbabilityOutOfRange { row: 0, .. }));
    }

    #[test]
    fn test_prediction_set_from_jsonl() {
        let input = "{\"label\":1,\"soft\":0.8}\n\n{\"label\":0,\"soft\":0.6,\"hard\":0}\n";
        let set = PredictionSet::from_reader(Cursor::new(input)).unwrap();
        assert_eq!(set.labels(), &[1, 0]);
        assert_eq!(set.hard(), &[1, 0]);
        assert_eq!(set.soft(), &[0.8, 0.6]);
    }

    #[test]
    fn test_prediction_set_jsonl_bad_label() {
        let input = "{\"label\":3,\"soft\":0.8}\n";
        let err = PredictionSet::from_reader(Cursor::new(input)).unwrap_err();
        assert!(matches!(err, DataError::NonBinaryEncoding { .. }));
    }

    #[test]
    fn test_prediction_set_jsonl_malformed() {
        let err = PredictionSet::from_reader(Cursor::new("not json\n")).unwrap_err();
        assert!(matches!(err, DataError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_svmlight_read_write() {
        let input = "+1 1:2 3:1.5 # comment\n-1 2:4\n";
        let (matrix, labels) = FeatureMatrix::read_svmlight(Cursor::new(input)).unwrap();
        assert_eq!(labels, vec![1, 0]);
        assert_eq!(matrix.n_rows(), 2);
        assert_eq!(matrix.n_features(), 3);
        assert_eq!(matrix.row(0), &[(0, 2.0), (2, 1.5)]);

        let mut out = Vec::new();
        matrix.write_svmlight(&mut out, &labels).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "+1 1:2 3:1.5\n-1 2:4\n");
    }

    #[test]
    fn test_feature_matrix_sorts_rows() {
        let matrix = FeatureMatrix::new(vec![vec![(4, 1.0), (0, 2.0)], vec![]]);
        assert_eq!(matrix.n_features(), 5);
        assert_eq!(matrix.row(0), &[(0, 2.0), (4, 1.0)]);

        let (parsed, _) = FeatureMatrix::read_svmlight(Cursor::new("+1 5:1 1:2
")).unwrap();
        assert_eq!(parsed, matrix.select(&[0]).unwrap());
    }

    #[test]
    fn test_svmlight_rejects_multiclass_label() {
        let err = FeatureMatrix::read_svmlight(Cursor::new("3 1:1\n")).unwrap_err();
        assert!(matches!(err, DataError::NonBinaryEncoding { row: 0, .. }));
    }

    #[test]
    fn test_svmlight_rejects_zero_index() {
        let err = FeatureMatrix::read_svmlight(Cursor::new("1 0:1\n")).unwrap_err();
        assert!(matches!(err, DataError::Parse { .. }));
    }

    #[test]
    fn test_select_rows() {
        let matrix = FeatureMatrix::from_dense(&[vec![1.0, 0.0], vec![0.0, 2.0], vec![3.0, 3.0]]);
        let picked = matrix.select(&[2, 0]).unwrap();
        assert_eq!(picked.n_rows(), 2);
        assert_eq!(picked.row(0), &[(0, 3.0), (1, 3.0)]);
        assert_eq!(picked.n_features(), 2);
        assert!(matrix.select(&[5]).is_err());
    }

    #[test]
    fn test_labels_from_indicator() {
        let matrix = vec![vec![1, 0, 0], vec![0, 0, 1]];
        let labels = labels_from_indicator(&matrix, &["a", "b", "c"]).unwrap();
        assert_eq!(labels, vec!["a", "c"]);
    }

    #[test]
    fn test_labels_from_indicator_errors() {
        let classes = ["a", "b"];
        assert!(matches!(
            labels_from_indicator(&[vec![1, 0, 0]], &classes),
            Err(DataError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            labels_from_indicator(&[vec![2, 0]], &classes),
            Err(DataError::NonBinaryEncoding { .. })
        ));
        assert!(matches!(
            labels_from_indicator(&[vec![1, 1]], &classes),
            Err(DataError::MultiLabelViolation { row: 0, active: 2 })
        ));
        assert!(matches!(
            labels_from_indicator(&[vec![0, 0]], &classes),
            Err(DataError::MultiLabelViolation { row: 0, active: 0 })
        ));
    }

    #[test]
    fn test_validate_labels_unknown_class() {
        assert!(validate_labels(&["A", "B"], &["Z", "A", "B"]).is_ok());
        let err = validate_labels(&["A", "Q"], &["A", "B"]).unwrap_err();
        assert!(matches!(err, DataError::UnknownClass(c) if c == "Q"));
    }

    #[test]
    fn test_column_map_reorders_and_fills_missing() {
        // fitted on A, B, C; target also knows Z which the model never saw
        let map = ColumnMap::new(&["A", "B", "C"], &["Z", "C", "B", "A"]).unwrap();
        assert!(!map.is_identity());
        let out = map.reorder(&[vec![0.5, 0.3, 0.2], vec![0.1, 0.1, 0.8]]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], vec![0.0, 0.2, 0.3, 0.5]);
        assert_eq!(out[1], vec![0.0, 0.8, 0.1, 0.1]);
    }

    #[test]
    fn test_column_map_identity() {
        let map = ColumnMap::new(&[0u8, 1], &[0u8, 1]).unwrap();
        assert!(map.is_identity());
        let rows = vec![vec![0.3, 0.7]];
        assert_eq!(map.reorder(&rows).unwrap(), rows);
    }

    #[test]
    fn test_column_map_unknown_class() {
        let err = ColumnMap::new(&["A", "X"], &["A", "B"]).unwrap_err();
        assert!(matches!(err, DataError::UnknownClass(c) if c == "X"));
    }

    #[test]
    fn test_column_map_sizes_from_input() {
        let map = ColumnMap::new(&[1u8], &[0u8, 1]).unwrap();
        let out = map.reorder(&vec![vec![1.0]; 5]).unwrap();
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|r| r == &vec![0.0, 1.0]));
        assert!(map.reorder(&[vec![1.0, 0.0]]).is_err());
    }
}
