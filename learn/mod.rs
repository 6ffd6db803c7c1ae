// ========================================================================================
//
//                         MODEL, TRAINING LOOP AND EXPERIMENTS
//
// ========================================================================================
//
// `model` holds the embedding-bag classifier behind the `Classifier` seam; `loss`,
// `optim` and `scaler` are the pieces of one training step; `checkpoint` persists
// `(epoch, parameters, optimizer)`; `fit` drives epochs; `experiment` wires a
// configured dataset, vocabulary and model together and owns the on-disk layout.

pub mod checkpoint;
pub mod experiment;
pub mod fit;
pub mod history;
pub mod loss;
pub mod model;
pub mod optim;
pub mod scaler;

pub use checkpoint::{CheckpointError, load_for_inference, load_for_training, save_checkpoint};
pub use experiment::{
    ConfigError, DataParams, Experiment, ExperimentParams, ExperimentSettings, ModelKind,
    ModelParams, OptimParams, RunConfig,
};
pub use fit::{
    EpochOutput, FitOptions, FitPhase, FitReport, TrainEvalLoop, print_epochs,
    summarize_prediction,
};
pub use history::{EpochRow, PredictionRow, RunHistory, SplitOutputs};
pub use loss::BceWithLogits;
pub use model::{
    Classifier, EmbeddingBagNet, ModelError, NetConfig, Parameter, ParameterCount, Pooling,
    count_parameters,
};
pub use optim::{AdagradConfig, AdamConfig, Optimizer, OptimizerKind};
pub use scaler::LossScaler;

use crate::data::DataError;
use crate::encode::EncodeError;
use crate::metrics::MetricsError;
use crate::shared::files::FileError;
use crate::vocab::VocabError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LearnError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Vocab(#[from] VocabError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    #[error(transparent)]
    File(#[from] FileError),
    #[error("Failed to write '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("No test predictions to summarize. Run predict first.")]
    NoPredictions,
    #[error("The {0} pass saw no batches. Does the split contain any patients?")]
    EmptySplit(&'static str),
}
