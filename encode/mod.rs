// ========================================================================================
//
//                        PATIENT ENCODING AND BATCH PREFETCHING
//
// ========================================================================================
//
// Turns immutable `PatientRecord`s into embedding-bag ready index arrays. Every patient
// encodes to the same number of age buckets per record stream, so the model sees a
// uniform outer sequence length regardless of how irregular the underlying events are.
//
// `patient` holds the per-patient encoder; `batch` collates encoded patients and runs
// the optional prefetching worker pool.

pub mod batch;
pub mod patient;

pub use batch::{BatchLoader, EncodedBatch, LoaderConfig};
pub use patient::{AgeSpan, BagInput, EncodedPatient, Granularity, PatientEncoder};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error(
        "Numericalizing {stream} returned {found} indices for {expected} codes. The vocabulary and encoder are out of sync."
    )]
    LengthMismatch {
        stream: String,
        expected: usize,
        found: usize,
    },
    #[error("Age span must satisfy start < stop, got [{start}, {stop}).")]
    InvalidAgeSpan { start: u32, stop: u32 },
    #[error("Batch size must be at least 1.")]
    InvalidBatchSize,
    #[error("A batch encoding worker panicked.")]
    WorkerPanicked,
}
