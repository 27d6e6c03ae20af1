//! # Module: dataset
//!
//! Immutable tabular data handed to the partitioner and trainer: numeric
//! feature rows plus a row-aligned integer label column.  Parsing raw files
//! is a data-source concern; this module only guarantees shape.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Class label type.
pub type Label = i64;

/// Ordered feature rows plus a parallel label column.
///
/// Construct through [`Dataset::new`], which checks that every row has the
/// same width, every value is finite, and labels align with rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    features: Vec<Vec<f64>>,
    labels: Vec<Label>,
}

impl Dataset {
    pub fn new(features: Vec<Vec<f64>>, labels: Vec<Label>) -> PipelineResult<Self> {
        if features.len() != labels.len() {
            return Err(PipelineError::InvalidDataset(format!(
                "{} feature rows but {} labels",
                features.len(),
                labels.len()
            )));
        }
        if let Some(first) = features.first() {
            let width = first.len();
            if width == 0 {
                return Err(PipelineError::InvalidDataset("rows have no feature columns".into()));
            }
            for (i, row) in features.iter().enumerate() {
                if row.len() != width {
                    return Err(PipelineError::InvalidDataset(format!(
                        "row {} has {} columns, expected {}",
                        i,
                        row.len(),
                        width
                    )));
                }
                if let Some(col) = row.iter().position(|v| !v.is_finite()) {
                    return Err(PipelineError::InvalidDataset(format!(
                        "row {} column {} is not a finite number",
                        i, col
                    )));
                }
            }
        }
        Ok(Self { features, labels })
    }

    /// Re-validate after deserialising from an untrusted source.
    pub fn validated(self) -> PipelineResult<Self> {
        Self::new(self.features, self.labels)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of feature columns (0 for an empty dataset).
    pub fn width(&self) -> usize {
        self.features.first().map_or(0, Vec::len)
    }

    pub fn features(&self) -> &[Vec<f64>] {
        &self.features
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Copy out the rows at `indices`, preserving the given order.
    ///
    /// Out-of-range indices are skipped.
    pub fn subset(&self, indices: &[usize]) -> Dataset {
        let mut features = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            if let (Some(row), Some(&label)) = (self.features.get(i), self.labels.get(i)) {
                features.push(row.clone());
                labels.push(label);
            }
        }
        Dataset { features, labels }
    }

    /// Distinct labels in ascending order.
    pub fn classes(&self) -> Vec<Label> {
        let mut classes = self.labels.clone();
        classes.sort_unstable();
        classes.dedup();
        classes
    }
}

/// Squared Euclidean distance; shorter slice bounds the sum.
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::new(
            vec![vec![0.0, 1.0], vec![2.0, 3.0], vec![4.0, 5.0]],
            vec![1, 0, 1],
        )
        .unwrap()
    }

    #[test]
    fn new_accepts_aligned_rows() {
        let d = sample();
        assert_eq!(d.len(), 3);
        assert_eq!(d.width(), 2);
        assert!(!d.is_empty());
    }

    #[test]
    fn new_rejects_misaligned_labels() {
        let err = Dataset::new(vec![vec![1.0]], vec![0, 1]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidDataset(_)));
    }

    #[test]
    fn new_rejects_ragged_rows() {
        let err = Dataset::new(vec![vec![1.0, 2.0], vec![1.0]], vec![0, 1]).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn new_rejects_non_finite_values() {
        let err = Dataset::new(vec![vec![f64::NAN]], vec![0]).unwrap_err();
        assert!(err.to_string().contains("finite"));
    }

    #[test]
    fn new_rejects_zero_width_rows() {
        assert!(Dataset::new(vec![vec![]], vec![0]).is_err());
    }

    #[test]
    fn empty_dataset_is_valid() {
        let d = Dataset::new(vec![], vec![]).unwrap();
        assert!(d.is_empty());
        assert_eq!(d.width(), 0);
    }

    #[test]
    fn subset_preserves_order_and_alignment() {
        let d = sample().subset(&[2, 0]);
        assert_eq!(d.features(), &[vec![4.0, 5.0], vec![0.0, 1.0]]);
        assert_eq!(d.labels(), &[1, 1]);
    }

    #[test]
    fn subset_skips_out_of_range() {
        assert_eq!(sample().subset(&[1, 99]).len(), 1);
    }

    #[test]
    fn classes_are_sorted_and_unique() {
        assert_eq!(sample().classes(), vec![0, 1]);
    }

    #[test]
    fn squared_distance_basic() {
        assert_eq!(squared_distance(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
    }
}
