//! # Cleaned Data Loading
//!
//! Entry point for the tables written by the (external) cleaning step. Files are read
//! with the `polars` CSV reader with every column kept as text, then validated and
//! turned into plain Rust structures:
//!
//! - the training code tables that vocabularies are built from ([`tables`]),
//! - immutable per-patient records for a split ([`records`]).
//!
//! Failures are assumed to be input errors and name the offending file and column.

pub mod records;
pub mod tables;

pub use records::{Demographics, Event, PatientRecord, load_split, positive_weights};
pub use tables::{PatientCodeTable, VocabCodeTables, load_vocab_code_tables};

use crate::types::Split;
use polars::prelude::PolarsError;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Required data file '{0}' was not found. Has the dataset been cleaned?")]
    FileNotFound(PathBuf),
    #[error("Error reading '{path}': {source}")]
    Polars {
        path: PathBuf,
        #[source]
        source: PolarsError,
    },
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("The required column '{column}' was not found in '{path}'.")]
    ColumnNotFound { path: PathBuf, column: String },
    #[error("Missing value in required column '{column}' of '{path}' (row {row}).")]
    MissingValue {
        path: PathBuf,
        column: String,
        row: usize,
    },
    #[error("Column '{column}' of '{path}' (row {row}) holds '{value}', expected {expected}.")]
    InvalidValue {
        path: PathBuf,
        column: String,
        row: usize,
        value: String,
        expected: &'static str,
    },
    #[error("Patient '{patient}' is listed in '{path}' but has no demographics row.")]
    MissingDemographics { path: PathBuf, patient: String },
}

/// `{dataset}/cleaned/{split}`
pub fn cleaned_dir(dataset: &Path, split: Split) -> PathBuf {
    dataset.join("cleaned").join(split.dir_name())
}

/// `{dataset}/cleaned/train/codes`
pub fn codes_dir(dataset: &Path) -> PathBuf {
    cleaned_dir(dataset, Split::Train).join("codes")
}
