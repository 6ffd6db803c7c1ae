//! Explicit per-run context.
//!
//! Everything that would otherwise be process-global (where unknown codes are logged,
//! the RNG seed, whether to draw progress bars) is owned by a `RunContext` created at
//! the start of a run and handed to the encoder and the training loop.

use crate::vocab::ExceptionLog;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct RunContext {
    pub exceptions: ExceptionLog,
    /// Seed for shuffling, dropout, initialisation and bootstrap resampling. `None`
    /// draws fresh entropy.
    pub seed: Option<u64>,
    pub show_progress: bool,
}

impl RunContext {
    /// Context for library use and tests: no log file, no progress bars.
    pub fn quiet(seed: Option<u64>) -> Self {
        Self {
            exceptions: ExceptionLog::disabled(),
            seed,
            show_progress: false,
        }
    }

    /// Context for CLI runs, logging unknown codes below `log_dir`.
    pub fn with_log_dir(log_dir: impl Into<PathBuf>, seed: Option<u64>) -> Self {
        Self {
            exceptions: ExceptionLog::in_dir(log_dir),
            seed,
            show_progress: true,
        }
    }

    /// Seed derived from the run seed and a stream id, so separate consumers (shuffle,
    /// dropout, init) do not share a sequence. Falls back to entropy when unseeded.
    pub fn derive_seed(&self, stream: u64) -> u64 {
        match self.seed {
            Some(seed) => seed
                .wrapping_mul(0x9E37_79B9_7F4A_7C15)
                .wrapping_add(stream.wrapping_mul(0xBF58_476D_1CE4_E5B9)),
            None => rand::random::<u64>(),
        }
    }
}
