// ========================================================================================
//
//                                 TRAIN / EVALUATE LOOP
//
// ========================================================================================
//
// Idle -> (Resuming) -> Training -> Evaluating -> ... -> Checkpointed -> Idle.
//
// Every epoch trains over all training batches, evaluates the validation split without
// dropout, scores both with per-label AUROC and appends one row per split to the run
// history. The checkpoint is written once, after the last epoch.

use super::LearnError;
use super::checkpoint::{load_for_inference, load_for_training, save_checkpoint};
use super::history::{EpochRow, PredictionRow, RunHistory, SplitOutputs};
use super::loss::{BceWithLogits, sigmoid};
use super::model::Classifier;
use super::optim::Optimizer;
use super::scaler::LossScaler;
use crate::context::RunContext;
use crate::encode::{BatchLoader, EncodedBatch};
use crate::metrics::{BootstrapConfig, MultiLabelRoc, auroc_ci, auroc_score};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io::IsTerminal;
use std::path::PathBuf;

/// RNG stream ids handed to `RunContext::derive_seed`.
pub const INIT_STREAM: u64 = 0;
pub const SHUFFLE_STREAM: u64 = 1;
pub const DROPOUT_STREAM: u64 = 2;
pub const BOOTSTRAP_STREAM: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitPhase {
    Idle,
    Resuming,
    Training { epoch: usize },
    Evaluating { epoch: usize },
    Checkpointed { epoch: usize },
}

/// Loss, labels and probabilities of one pass over a split.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochOutput {
    /// Mean of the per-batch losses.
    pub loss: f64,
    pub y: Array2<f32>,
    pub y_hat: Array2<f32>,
}

impl EpochOutput {
    fn into_row(self, epoch: usize) -> Result<(EpochRow, SplitOutputs), LearnError> {
        let aurocs = auroc_score(self.y.view(), self.y_hat.view())?;
        let row = EpochRow {
            epoch,
            loss: self.loss,
            aurocs,
        };
        Ok((row, SplitOutputs { y: self.y, y_hat: self.y_hat }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    pub epochs: usize,
    pub from_checkpoint: bool,
    pub to_checkpoint: bool,
    /// Fraction of epochs that get a printed table row.
    pub verbosity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitReport {
    pub start_epoch: usize,
    pub end_epoch: usize,
    /// Optimizer steps skipped by the loss scaler.
    pub skipped_steps: u64,
}

/// Row accumulator shared by training and evaluation passes.
struct Collected {
    pass: &'static str,
    num_labels: usize,
    loss_sum: f64,
    batches: usize,
    rows: usize,
    y: Vec<f32>,
    y_hat: Vec<f32>,
}

impl Collected {
    fn new(pass: &'static str, num_labels: usize) -> Self {
        Self {
            pass,
            num_labels,
            loss_sum: 0.0,
            batches: 0,
            rows: 0,
            y: Vec::new(),
            y_hat: Vec::new(),
        }
    }

    fn push(&mut self, batch: &EncodedBatch, logits: &Array2<f32>, loss: f32) {
        self.loss_sum += loss as f64;
        self.batches += 1;
        self.rows += batch.len();
        self.y.extend(batch.labels.iter());
        self.y_hat.extend(logits.iter().map(|&x| sigmoid(x)));
    }

    fn finish(self) -> Result<EpochOutput, LearnError> {
        if self.batches == 0 {
            return Err(LearnError::EmptySplit(self.pass));
        }
        let shape = (self.rows, self.num_labels);
        let y = Array2::from_shape_vec(shape, self.y).map_err(shape_error)?;
        let y_hat = Array2::from_shape_vec(shape, self.y_hat).map_err(shape_error)?;
        Ok(EpochOutput {
            loss: self.loss_sum / self.batches as f64,
            y,
            y_hat,
        })
    }
}

fn shape_error(e: ndarray::ShapeError) -> LearnError {
    LearnError::Model(super::model::ModelError::InvalidConfig(format!(
        "collected predictions do not form a matrix: {e}"
    )))
}

fn progress_bar(len: usize, message: &str, show: bool) -> ProgressBar {
    let draw_target = if show && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len as u64), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Epochs that get a table row: `⌊epochs·verbosity⌋` evenly spaced points from `start`
/// to `end` inclusive, truncated to integers.
pub fn print_epochs(start: usize, end: usize, epochs: usize, verbosity: f64) -> Vec<usize> {
    let n = (epochs as f64 * verbosity).floor().max(0.0) as usize;
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end as f64 - start as f64) / (n - 1) as f64;
            (0..n)
                .map(|i| {
                    if i + 1 == n {
                        end
                    } else {
                        (start as f64 + i as f64 * step) as usize
                    }
                })
                .dedup()
                .collect()
        }
    }
}

fn format_aurocs(aurocs: &[f64]) -> String {
    format!("[{}]", aurocs.iter().take(4).map(|a| format!("{a:.3}")).join(" "))
}

fn print_header() {
    println!(
        "{:>5} {:>16} {:^20} {:>25} {:^20}",
        "epoch |", "train loss |", "train aurocs", "valid loss |", "valid aurocs"
    );
    println!("{}", "-".repeat(100));
}

fn print_row(train: &EpochRow, valid: &EpochRow) {
    println!(
        "{:>5} |{:>15.3} | {}{:>19.3} | {}",
        train.epoch,
        train.loss,
        format_aurocs(&train.aurocs),
        valid.loss,
        format_aurocs(&valid.aurocs)
    );
}

pub struct TrainEvalLoop<M: Classifier> {
    model: M,
    optimizer: Optimizer,
    scaler: LossScaler,
    labels: Vec<String>,
    checkpoint_dir: PathBuf,
    dropout_rng: StdRng,
    show_progress: bool,
    phase: FitPhase,
}

impl<M: Classifier> TrainEvalLoop<M> {
    pub fn new(
        model: M,
        optimizer: Optimizer,
        labels: Vec<String>,
        checkpoint_dir: impl Into<PathBuf>,
        mixed_precision: bool,
        ctx: &RunContext,
    ) -> Self {
        Self {
            model,
            optimizer,
            scaler: LossScaler::new(mixed_precision),
            labels,
            checkpoint_dir: checkpoint_dir.into(),
            dropout_rng: StdRng::seed_from_u64(ctx.derive_seed(DROPOUT_STREAM)),
            show_progress: ctx.show_progress,
            phase: FitPhase::Idle,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn phase(&self) -> FitPhase {
        self.phase
    }

    fn enter(&mut self, phase: FitPhase) {
        log::debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// One pass over `loader` in training mode. Predictions are taken before each
    /// batch's update.
    pub fn train_epoch(
        &mut self,
        loader: &mut BatchLoader<'_>,
        loss_fn: &BceWithLogits,
    ) -> Result<EpochOutput, LearnError> {
        let pb = progress_bar(loader.num_batches(), "train", self.show_progress);
        let mut collected = Collected::new("training", loss_fn.pos_weight().len());
        let Self {
            model,
            optimizer,
            scaler,
            dropout_rng,
            ..
        } = self;

        loader.for_each_batch(|batch| {
            let (logits, cache) = model.forward(&batch, Some(&mut *dropout_rng))?;
            let (loss, mut grad) = loss_fn.loss_and_grad(logits.view(), batch.labels.view())?;
            let scale = scaler.scale();
            if scale != 1.0 {
                grad.mapv_inplace(|g| g * scale);
            }
            let mut grads = model.backward(&cache, grad.view());
            if scaler.unscale(&mut grads) {
                optimizer.step(model.parameters_mut(), &grads)?;
            }
            collected.push(&batch, &logits, loss);
            pb.inc(1);
            Ok::<(), LearnError>(())
        })?;
        pb.finish_and_clear();
        collected.finish()
    }

    /// One pass over `loader` without dropout or updates.
    pub fn evaluate(
        &self,
        loader: &mut BatchLoader<'_>,
        loss_fn: &BceWithLogits,
    ) -> Result<EpochOutput, LearnError> {
        let pb = progress_bar(loader.num_batches(), "evaluate", self.show_progress);
        let mut collected = Collected::new("evaluation", loss_fn.pos_weight().len());
        loader.for_each_batch(|batch| {
            let (logits, _) = self.model.forward(&batch, None)?;
            let loss = loss_fn.loss(logits.view(), batch.labels.view())?;
            collected.push(&batch, &logits, loss);
            pb.inc(1);
            Ok::<(), LearnError>(())
        })?;
        pb.finish_and_clear();
        collected.finish()
    }

    pub fn fit(
        &mut self,
        train: &mut BatchLoader<'_>,
        valid: &mut BatchLoader<'_>,
        train_loss: &BceWithLogits,
        valid_loss: &BceWithLogits,
        history: &mut RunHistory,
        options: &FitOptions,
    ) -> Result<FitReport, LearnError> {
        let start_epoch = if options.from_checkpoint {
            self.enter(FitPhase::Resuming);
            let last = load_for_training(
                &self.checkpoint_dir,
                &self.labels,
                &mut self.model,
                &mut self.optimizer,
            )?;
            last + 1
        } else {
            0
        };
        if options.epochs == 0 {
            self.enter(FitPhase::Idle);
            return Ok(FitReport {
                start_epoch,
                end_epoch: start_epoch,
                skipped_steps: self.scaler.skipped_steps(),
            });
        }
        let end_epoch = start_epoch + options.epochs - 1;
        let printed = print_epochs(start_epoch, end_epoch, options.epochs, options.verbosity);
        if !printed.is_empty() {
            print_header();
        }

        for epoch in start_epoch..=end_epoch {
            self.enter(FitPhase::Training { epoch });
            let trained = self.train_epoch(train, train_loss)?;
            self.enter(FitPhase::Evaluating { epoch });
            let evaluated = self.evaluate(valid, valid_loss)?;

            let (train_row, train_outputs) = trained.into_row(epoch)?;
            let (valid_row, valid_outputs) = evaluated.into_row(epoch)?;
            if printed.contains(&epoch) {
                print_row(&train_row, &valid_row);
            }
            log::debug!(
                "epoch {epoch}: train loss {:.4}, valid loss {:.4}",
                train_row.loss,
                valid_row.loss
            );
            history.train.push(train_row);
            history.valid.push(valid_row);
            history.train_outputs = Some(train_outputs);
            history.valid_outputs = Some(valid_outputs);
        }

        if options.to_checkpoint {
            let path = save_checkpoint(
                &self.checkpoint_dir,
                end_epoch,
                &self.labels,
                &self.model,
                &self.optimizer,
            )?;
            println!("Checkpointed to \"{}\"", path.display());
            self.enter(FitPhase::Checkpointed { epoch: end_epoch });
        }
        if self.scaler.skipped_steps() > 0 {
            log::info!(
                "Loss scaler skipped {} optimizer steps",
                self.scaler.skipped_steps()
            );
        }
        self.enter(FitPhase::Idle);
        Ok(FitReport {
            start_epoch,
            end_epoch,
            skipped_steps: self.scaler.skipped_steps(),
        })
    }

    /// Loads checkpointed weights, evaluates the test split once and records the result.
    pub fn predict(
        &mut self,
        test: &mut BatchLoader<'_>,
        test_loss: &BceWithLogits,
        history: &mut RunHistory,
    ) -> Result<EpochRow, LearnError> {
        let epoch = load_for_inference(&self.checkpoint_dir, &self.labels, &mut self.model)?;
        self.enter(FitPhase::Evaluating { epoch });
        let (row, outputs) = self.evaluate(test, test_loss)?.into_row(epoch)?;
        println!("test loss = {}", row.loss);
        println!("test aurocs = {}", format_aurocs_full(&row.aurocs));
        history.test = Some(row.clone());
        history.test_outputs = Some(outputs);
        self.enter(FitPhase::Idle);
        Ok(row)
    }
}

fn format_aurocs_full(aurocs: &[f64]) -> String {
    format!("[{}]", aurocs.iter().map(|a| format!("{a:.4}")).join(", "))
}

/// Per-label AUROC, Youden-optimal threshold and bootstrap 95% CI on the last test
/// predictions. The rows are stored in `history` and printed.
pub fn summarize_prediction(
    history: &mut RunHistory,
    labels: &[String],
    bootstrap: BootstrapConfig,
) -> Result<Vec<PredictionRow>, LearnError> {
    let outputs = history.test_outputs.as_ref().ok_or(LearnError::NoPredictions)?;
    let rocs = MultiLabelRoc::new(outputs.y.view(), outputs.y_hat.view(), labels)?;

    let mut rows = Vec::with_capacity(labels.len());
    for (i, (label, roc)) in rocs.labels.iter().zip(&rocs.rocs).enumerate() {
        let ci = auroc_ci(outputs.y.column(i), outputs.y_hat.column(i), BootstrapConfig {
            seed: bootstrap.seed.map(|s| s.wrapping_add(i as u64)),
            ..bootstrap
        })?;
        rows.push(PredictionRow {
            label: label.clone(),
            auroc: roc.auroc,
            optimal_threshold: roc.optimal_threshold(),
            ci_lower: ci.lower,
            ci_upper: ci.upper,
        });
    }

    println!("\nPrediction Summary ...");
    println!(
        "{:<24} {:>12} {:>18} {:>20}",
        "label", "auroc_score", "optimal_threshold", "auroc_95_ci"
    );
    for row in &rows {
        println!(
            "{:<24} {:>12.3} {:>18.3} {:>20}",
            row.label,
            row.auroc,
            row.optimal_threshold,
            format!("({:.3}, {:.3})", row.ci_lower, row.ci_upper)
        );
    }

    history.prediction_summary = rows.clone();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{AgeSpan, BagInput, EncodedPatient, Granularity, LoaderConfig, PatientEncoder};
    use crate::learn::model::EmbeddingBagNet;
    use crate::learn::optim::AdamConfig;
    use crate::vocab::ExceptionLog;
    use crate::encode::patient::tests::{sample_record, sample_vocabs};
    use tempfile::tempdir;

    #[test]
    fn printed_epochs_follow_linspace() {
        assert_eq!(print_epochs(0, 9, 10, 0.5), vec![0, 2, 4, 6, 9]);
        assert_eq!(print_epochs(5, 5, 1, 1.0), vec![5]);
        assert!(print_epochs(0, 3, 4, 0.2).is_empty());
        assert_eq!(print_epochs(10, 13, 4, 1.0), vec![10, 11, 12, 13]);
    }

    #[test]
    fn aurocs_are_truncated_to_four_columns() {
        assert_eq!(format_aurocs(&[0.5, 0.25, 1.0, 0.125, 0.9]), "[0.500 0.250 1.000 0.125]");
    }

    #[test]
    fn collected_rows_form_label_matrices() {
        let patient = EncodedPatient {
            id: "p".to_string(),
            records: vec![BagInput { values: vec![0], offsets: vec![0] }],
            demographics: vec![0],
            age_now: 0.0,
            labels: vec![true, false],
        };
        let batch = EncodedBatch::collate(0, vec![patient.clone(), patient]);
        let mut collected = Collected::new("training", 2);
        collected.push(&batch, &Array2::zeros((2, 2)), 0.5);
        collected.push(&batch, &Array2::zeros((2, 2)), 1.5);
        let out = collected.finish().unwrap();
        assert_eq!(out.loss, 1.0);
        assert_eq!(out.y.dim(), (4, 2));
        assert_eq!(out.y[[2, 0]], 1.0);
        assert!(out.y_hat.iter().all(|&p| p == 0.5));
    }

    #[test]
    fn a_pass_without_batches_is_an_error() {
        match Collected::new("evaluation", 2).finish() {
            Err(LearnError::EmptySplit(pass)) => assert_eq!(pass, "evaluation"),
            other => panic!("expected EmptySplit, got {other:?}"),
        }
    }

    #[test]
    fn fit_resumes_from_the_checkpointed_epoch() {
        let vocabs = sample_vocabs();
        let log = ExceptionLog::disabled();
        let encoder =
            PatientEncoder::new(&vocabs, AgeSpan::new(0, 3, Granularity::Year).unwrap(), &log);
        let records: Vec<_> = (0..12)
            .map(|i| sample_record(&format!("p{i}"), i % 2 == 0))
            .collect();
        let loader_config = LoaderConfig {
            batch_size: 4,
            num_workers: 0,
            shuffle: true,
            preserve_order: true,
            seed: 1,
        };
        let mut train = BatchLoader::new(&records, &encoder, loader_config).unwrap();
        let mut valid = BatchLoader::new(&records, &encoder, loader_config).unwrap();

        let dims = vocabs.default_embedding_dims();
        let mut config = crate::learn::model::NetConfig::from_embedding_dims(&dims, 1);
        config.linear_layers = 1;
        let ctx = RunContext::quiet(Some(5));
        let build = || {
            let model =
                EmbeddingBagNet::new(config.clone(), &mut StdRng::seed_from_u64(0)).unwrap();
            let optimizer = Optimizer::adam(model.parameters(), AdamConfig::default());
            (model, optimizer)
        };

        let dir = tempdir().unwrap();
        let labels = vec!["flag".to_string()];
        let loss = BceWithLogits::new(vec![1.0]);
        let mut history = RunHistory::default();

        let (model, optimizer) = build();
        let mut run = TrainEvalLoop::new(model, optimizer, labels.clone(), dir.path(), false, &ctx);
        let options = FitOptions {
            epochs: 2,
            from_checkpoint: false,
            to_checkpoint: true,
            verbosity: 0.0,
        };
        let report = run.fit(&mut train, &mut valid, &loss, &loss, &mut history, &options).unwrap();
        assert_eq!((report.start_epoch, report.end_epoch), (0, 1));
        assert_eq!(history.train.len(), 2);
        assert_eq!(history.valid_outputs.as_ref().unwrap().y.dim(), (12, 1));
        assert_eq!(run.phase(), FitPhase::Idle);

        let (model, optimizer) = build();
        let mut resumed = TrainEvalLoop::new(model, optimizer, labels.clone(), dir.path(), false, &ctx);
        let options = FitOptions { from_checkpoint: true, epochs: 1, ..options };
        let report = resumed
            .fit(&mut train, &mut valid, &loss, &loss, &mut history, &options)
            .unwrap();
        assert_eq!((report.start_epoch, report.end_epoch), (2, 2));
        assert_eq!(history.last_epoch(), Some(2));
        // Three batches per epoch over three epochs.
        assert_eq!(resumed.optimizer().steps(), 9);

        let (model, optimizer) = build();
        let mut predictor = TrainEvalLoop::new(model, optimizer, labels.clone(), dir.path(), false, &ctx);
        let row = predictor.predict(&mut valid, &loss, &mut history).unwrap();
        assert_eq!(row.epoch, 2);
        assert_eq!(predictor.model().parameters(), resumed.model().parameters());

        let summary = summarize_prediction(
            &mut history,
            &labels,
            BootstrapConfig { n_bootstraps: 50, seed: Some(3) },
        )
        .unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(history.prediction_summary, summary);
    }

    #[test]
    fn summary_requires_predictions() {
        let mut history = RunHistory::default();
        assert!(matches!(
            summarize_prediction(&mut history, &["a".to_string()], BootstrapConfig::default()),
            Err(LearnError::NoPredictions)
        ));
    }
}
