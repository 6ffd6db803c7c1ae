//! # Prediction Metrics
//!
//! ROC curves for binary and multi-label predictions, AUROC, the Youden-optimal
//! threshold and bootstrap confidence intervals for AUROC.
//!
//! Labels are passed as 0/1 floats (anything above 0.5 is positive) and scores as
//! probabilities or logits; only the ranking of scores matters.

pub mod bootstrap;
pub mod roc;

pub use bootstrap::{BootstrapConfig, ConfidenceInterval, auroc_ci};
pub use roc::{MultiLabelRoc, Roc, RocPoint, auroc_score};

use ndarray::ArrayView1;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    #[error("Got {labels} labels but {scores} scores.")]
    LengthMismatch { labels: usize, scores: usize },
    #[error("Label matrix is {labels:?} but score matrix is {scores:?}.")]
    ShapeMismatch {
        labels: (usize, usize),
        scores: (usize, usize),
    },
    #[error("{names} label names given for {columns} label columns.")]
    LabelNameMismatch { names: usize, columns: usize },
    #[error("Score {index} is {value}; scores must be finite.")]
    NonFiniteScore { index: usize, value: f32 },
}

pub(crate) fn is_positive(label: f32) -> bool {
    label > 0.5
}

/// Pairs labels with scores, rejecting NaN and infinite scores.
pub(crate) fn scored_pairs(
    y: ArrayView1<f32>,
    scores: ArrayView1<f32>,
) -> Result<Vec<(bool, f64)>, MetricsError> {
    if y.len() != scores.len() {
        return Err(MetricsError::LengthMismatch {
            labels: y.len(),
            scores: scores.len(),
        });
    }
    y.iter()
        .zip(scores.iter())
        .enumerate()
        .map(|(index, (&l, &s))| {
            if s.is_finite() {
                Ok((is_positive(l), s as f64))
            } else {
                Err(MetricsError::NonFiniteScore { index, value: s })
            }
        })
        .collect()
}
