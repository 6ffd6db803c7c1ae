// ========================================================================================
//
//                              VERSIONED TRAINING CHECKPOINTS
//
// ========================================================================================
//
// A checkpoint is one JSON document, `{dir}/checkpoint.json`, written atomically. It
// holds the epoch index, the label names the model was trained for, every parameter
// tensor by name and the optimizer's named buffers. Loading validates all of it
// against the live model; any disagreement is fatal.
//
// Tensor values are stored widened to f64. Every f32 is exactly representable as an
// f64, and the widened values survive the decimal round trip, so restored parameters
// are bit-identical to the saved ones. NaN and infinity have no JSON form, so a
// tensor holding either is refused at save time.

use super::model::{Classifier, Parameter};
use super::optim::{Optimizer, OptimizerKind, OptimizerState};
use crate::shared::files::{FileError, read_json, write_json_atomic};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("No checkpoint found at '{0}'.")]
    NotFound(PathBuf),
    #[error("Checkpoint has format version {found}, this build reads version {expected}.")]
    UnsupportedFormat { found: u32, expected: u32 },
    #[error("Checkpoint does not match the current experiment: {0}")]
    Mismatch(String),
    #[error("Refusing to checkpoint tensor '{tensor}': element {index} is {value}.")]
    NonFinite {
        tensor: String,
        index: usize,
        value: f32,
    },
    #[error(transparent)]
    File(FileError),
}

impl From<FileError> for CheckpointError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::NotFound(path) => Self::NotFound(path),
            other => Self::File(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredTensor {
    name: String,
    shape: [usize; 2],
    data: Vec<f64>,
}

impl StoredTensor {
    /// JSON cannot hold NaN or infinity, so such tensors are refused here rather than
    /// producing a file that fails to load.
    fn new(name: &str, value: &Array2<f32>) -> Result<Self, CheckpointError> {
        if let Some((index, &v)) = value.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(CheckpointError::NonFinite {
                tensor: name.to_string(),
                index,
                value: v,
            });
        }
        let (rows, cols) = value.dim();
        Ok(Self {
            name: name.to_string(),
            shape: [rows, cols],
            data: value.iter().map(|&v| f64::from(v)).collect(),
        })
    }

    fn to_array(&self) -> Result<Array2<f32>, CheckpointError> {
        let [rows, cols] = self.shape;
        Array2::from_shape_vec((rows, cols), self.data.iter().map(|&v| v as f32).collect())
            .map_err(|e| CheckpointError::Mismatch(format!("tensor '{}': {e}", self.name)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredOptimizer {
    kind: OptimizerKind,
    step: u64,
    buffers: Vec<StoredTensor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CheckpointFile {
    format_version: u32,
    epoch_index: usize,
    labels: Vec<String>,
    parameters: Vec<StoredTensor>,
    optimizer: StoredOptimizer,
}

pub fn checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(CHECKPOINT_FILE)
}

/// Persists `(epoch, parameters, optimizer)` as a single atomic write.
pub fn save_checkpoint<M: Classifier>(
    dir: &Path,
    epoch_index: usize,
    labels: &[String],
    model: &M,
    optimizer: &Optimizer,
) -> Result<PathBuf, CheckpointError> {
    let state = optimizer.export_state();
    let file = CheckpointFile {
        format_version: CHECKPOINT_FORMAT_VERSION,
        epoch_index,
        labels: labels.to_vec(),
        parameters: model
            .parameters()
            .iter()
            .map(|p| StoredTensor::new(&p.name, &p.value))
            .collect::<Result<_, _>>()?,
        optimizer: StoredOptimizer {
            kind: state.kind,
            step: state.step,
            buffers: state
                .buffers
                .iter()
                .map(|(name, t)| StoredTensor::new(name, t))
                .collect::<Result<_, _>>()?,
        },
    };
    let path = checkpoint_path(dir);
    write_json_atomic(&path, &file)?;
    log::info!("Saved checkpoint for epoch {epoch_index} to '{}'", path.display());
    Ok(path)
}

fn read_checkpoint(dir: &Path, labels: &[String]) -> Result<CheckpointFile, CheckpointError> {
    let file: CheckpointFile = read_json(&checkpoint_path(dir))?;
    if file.format_version != CHECKPOINT_FORMAT_VERSION {
        return Err(CheckpointError::UnsupportedFormat {
            found: file.format_version,
            expected: CHECKPOINT_FORMAT_VERSION,
        });
    }
    if file.labels != labels {
        return Err(CheckpointError::Mismatch(format!(
            "checkpoint labels {:?} differ from experiment labels {:?}",
            file.labels, labels
        )));
    }
    Ok(file)
}

/// Converts stored tensors after checking they line up with `params` one to one.
fn restore_parameters(
    stored: &[StoredTensor],
    params: &[Parameter],
) -> Result<Vec<Array2<f32>>, CheckpointError> {
    if stored.len() != params.len() {
        return Err(CheckpointError::Mismatch(format!(
            "checkpoint holds {} parameter tensors, model has {}",
            stored.len(),
            params.len()
        )));
    }
    stored
        .iter()
        .zip(params)
        .map(|(s, p)| {
            let value = s.to_array()?;
            if s.name != p.name || value.dim() != p.value.dim() {
                return Err(CheckpointError::Mismatch(format!(
                    "parameter '{}' {:?} does not match model parameter '{}' {:?}",
                    s.name,
                    value.dim(),
                    p.name,
                    p.value.dim()
                )));
            }
            Ok(value)
        })
        .collect()
}

fn assign<M: Classifier>(model: &mut M, values: Vec<Array2<f32>>) {
    for (param, value) in model.parameters_mut().iter_mut().zip(values) {
        param.value = value;
    }
}

/// Restores model and optimizer for resumed training. Returns the saved epoch index;
/// training continues at the next one. Nothing is modified unless everything matches.
pub fn load_for_training<M: Classifier>(
    dir: &Path,
    labels: &[String],
    model: &mut M,
    optimizer: &mut Optimizer,
) -> Result<usize, CheckpointError> {
    let file = read_checkpoint(dir, labels)?;
    let values = restore_parameters(&file.parameters, model.parameters())?;
    let buffers = file
        .optimizer
        .buffers
        .iter()
        .map(|t| Ok((t.name.clone(), t.to_array()?)))
        .collect::<Result<Vec<_>, CheckpointError>>()?;

    let mut restored = optimizer.clone();
    restored
        .import_state(OptimizerState {
            kind: file.optimizer.kind,
            step: file.optimizer.step,
            buffers,
        })
        .map_err(CheckpointError::Mismatch)?;

    assign(model, values);
    *optimizer = restored;
    log::info!(
        "Resumed from checkpoint at epoch {} in '{}'",
        file.epoch_index,
        dir.display()
    );
    Ok(file.epoch_index)
}

/// Restores model parameters only; optimizer state in the file is ignored.
pub fn load_for_inference<M: Classifier>(
    dir: &Path,
    labels: &[String],
    model: &mut M,
) -> Result<usize, CheckpointError> {
    let file = read_checkpoint(dir, labels)?;
    let values = restore_parameters(&file.parameters, model.parameters())?;
    assign(model, values);
    log::info!(
        "Loaded model weights from epoch {} in '{}'",
        file.epoch_index,
        dir.display()
    );
    Ok(file.epoch_index)
}
