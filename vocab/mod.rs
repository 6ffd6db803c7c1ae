//! # Vocabularies
//!
//! Categorical code-to-index mappings for every demographic field and record stream.
//!
//! Two concrete vocabularies share one capability set ([`Vocabulary`]):
//!
//! - [`EhrVocab`]: plain lookup for diagnosis, medication, procedure and similar codes.
//! - [`ObsVocab`]: observation codes carrying a value, bucketed so continuous lab values
//!   become a small number of representative entries per (code, unit).
//!
//! Which one a record stream gets is decided once, at construction, through
//! [`RecordVocab`]. Every vocabulary reserves index 0 for "nothing recorded" and index
//! 1 for "unknown"; lookups of unseen codes fall back to index 1 and are recorded in the
//! [`ExceptionLog`] instead of failing.

pub mod ehr;
pub mod exceptions;
pub mod list;
pub mod obs;

pub use ehr::{CodeTable, EhrVocab};
pub use exceptions::ExceptionLog;
pub use list::{EmbeddingDims, VocabList};
pub use obs::{BucketValue, ObsBucket, ObsCodeRow, ObsKind, ObsVocab};

use crate::data::DataError;
use crate::shared::files::FileError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default scaling exponent for the embedding-width heuristic.
pub const DEFAULT_EMB_ALPHA: f64 = 0.5736;

/// Recommended embedding width for a vocabulary of `vocab_size` entries:
/// `round(6 * alpha * vocab_size^0.25)`.
pub fn embedding_width(vocab_size: usize, alpha: f64) -> usize {
    (6.0 * alpha * (vocab_size as f64).powf(0.25)).round() as usize
}

#[derive(Error, Debug)]
pub enum VocabError {
    #[error(
        "Observation vocabulary holds {vocab} distinct codes but the code table has {original}. This points to a data cleaning bug upstream."
    )]
    CodeCountMismatch { original: usize, vocab: usize },
    #[error("Observation code '{code}' is declared numeric but has non-numeric value '{value}'.")]
    InvalidNumericValue { code: String, value: String },
    #[error("Observation code '{code}' has unsupported type '{kind}' (expected 'numeric' or 'text').")]
    UnknownObservationType { code: String, kind: String },
    #[error("Number of observation buckets must be at least 1, got {0}.")]
    InvalidBucketCount(usize),
    #[error("Index {index} is outside the vocabulary (size {size}).")]
    IndexOutOfRange { index: usize, size: usize },
    #[error("Vocabulary file has format version {found}, this build reads version {expected}.")]
    UnsupportedFormat { found: u32, expected: u32 },
    #[error("Vocabulary file is inconsistent: {0}. Rebuild it with `ehrlearn vocab`.")]
    Inconsistent(String),
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Data(#[from] DataError),
}

/// One `textify` result: the code as it would be fed to `numericalize`, and the
/// human-readable descriptions known for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeText {
    pub code: String,
    pub descriptions: Vec<String>,
}

/// Shared capability set of all vocabularies.
pub trait Vocabulary {
    /// Maps raw codes to indices. Length preserving; unknown codes map to the unknown
    /// index and are recorded in `log`.
    fn numericalize<S: AsRef<str>>(&self, codes: &[S], log: &ExceptionLog) -> Vec<usize>;

    /// Inverse of `numericalize`, for diagnostics.
    fn textify(&self, indices: &[usize]) -> Result<Vec<CodeText>, VocabError>;

    fn size(&self) -> usize;

    /// `(vocab_size, embedding_width)` for sizing an embedding table.
    fn embedding_dims(&self, alpha: f64) -> (usize, usize) {
        (self.size(), embedding_width(self.size(), alpha))
    }
}

/// Vocabulary of one record stream, fixed when the vocab list is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordVocab {
    Plain(EhrVocab),
    Observation(ObsVocab),
}

impl Vocabulary for RecordVocab {
    fn numericalize<S: AsRef<str>>(&self, codes: &[S], log: &ExceptionLog) -> Vec<usize> {
        match self {
            Self::Plain(v) => v.numericalize(codes, log),
            Self::Observation(v) => v.numericalize(codes, log),
        }
    }

    fn textify(&self, indices: &[usize]) -> Result<Vec<CodeText>, VocabError> {
        match self {
            Self::Plain(v) => v.textify(indices),
            Self::Observation(v) => v.textify(indices),
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Plain(v) => v.size(),
            Self::Observation(v) => v.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_width_follows_fourth_root_heuristic() {
        // 6 * 0.5736 * 16^0.25 = 6.8832
        assert_eq!(embedding_width(16, DEFAULT_EMB_ALPHA), 7);
        // 6 * 0.5736 * 10000^0.25 = 34.416
        assert_eq!(embedding_width(10_000, DEFAULT_EMB_ALPHA), 34);
    }

    #[test]
    fn embedding_width_is_monotone_in_vocab_size() {
        let widths: Vec<usize> = (2..5000)
            .step_by(37)
            .map(|v| embedding_width(v, DEFAULT_EMB_ALPHA))
            .collect();
        assert!(widths.windows(2).all(|w| w[0] <= w[1]));
    }
}
