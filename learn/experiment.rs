//! # Experiments
//!
//! An experiment is a named, typed configuration plus the history of its runs. Its
//! settings live in `{path}/{name}/experiment.toml`, its history in
//! `{path}/{name}/history.json` and its checkpoint in `{checkpoint_path}/{name}/`.
//!
//! `fit` and `predict` assemble vocabulary, patient records, encoder, loaders, model and
//! optimizer from the settings, run the training loop and save the experiment.

use super::fit::{
    BOOTSTRAP_STREAM, FitOptions, FitReport, INIT_STREAM, SHUFFLE_STREAM, TrainEvalLoop,
    summarize_prediction,
};
use super::history::{PredictionRow, RunHistory};
use super::loss::BceWithLogits;
use super::model::{Classifier, EmbeddingBagNet, NetConfig, Pooling, count_parameters};
use super::optim::{AdagradConfig, AdamConfig, Optimizer, OptimizerKind};
use super::LearnError;
use crate::context::RunContext;
use crate::data::{PatientRecord, load_split, positive_weights};
use crate::encode::{AgeSpan, BatchLoader, Granularity, LoaderConfig, PatientEncoder};
use crate::metrics::BootstrapConfig;
use crate::shared::files::{read_json, read_toml, write_atomic, write_json_atomic, write_toml_atomic};
use crate::types::Split;
use crate::vocab::{DEFAULT_EMB_ALPHA, VocabList};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_EXPERIMENT_STORE: &str = "experiments";
pub const DEFAULT_MODEL_STORE: &str = "models";
pub const SETTINGS_FILE: &str = "experiment.toml";
pub const HISTORY_FILE: &str = "history.json";
pub const SUMMARY_FILE: &str = "prediction_summary.tsv";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid {
        field,
        reason: reason.into(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    /// Experiment store; the experiment lives in `{path}/{name}`.
    pub path: PathBuf,
    pub desc: String,
    /// Model store; checkpoints live in `{checkpoint_path}/{name}`.
    pub checkpoint_path: PathBuf,
}

impl RunConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: PathBuf::from(DEFAULT_EXPERIMENT_STORE),
            desc: String::new(),
            checkpoint_path: PathBuf::from(DEFAULT_MODEL_STORE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataParams {
    pub dataset_path: PathBuf,
    pub labels: Vec<String>,
    pub age_start: u32,
    pub age_stop: u32,
    pub age_in_months: bool,
    pub bs: usize,
    pub num_workers: usize,
}

impl Default for DataParams {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::new(),
            labels: Vec::new(),
            age_start: 0,
            age_stop: 20,
            age_in_months: false,
            bs: 128,
            num_workers: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimParams {
    pub optim: OptimizerKind,
    /// Used by Adagrad only; SGD and Adam keep their fixed default rates.
    pub lr: f64,
    pub lr_decay: f64,
    pub weight_decay: f64,
}

impl Default for OptimParams {
    fn default() -> Self {
        Self {
            optim: OptimizerKind::Adam,
            lr: 0.01,
            lr_decay: 0.0,
            weight_decay: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Mean,
    Recency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub model: ModelKind,
    /// Per-bucket decay of the recency pooling.
    pub recency_decay: f64,
    /// Embedding-width scaling exponent.
    pub alpha_d: f64,
    pub linear_layers: usize,
    pub initrange: f64,
    pub input_drp: f64,
    pub linear_drp: f64,
    /// Dynamic loss scaling with half-precision overflow checks.
    pub mixed_precision: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: ModelKind::Mean,
            recency_decay: 0.8,
            alpha_d: DEFAULT_EMB_ALPHA,
            linear_layers: 4,
            initrange: 0.3,
            input_drp: 0.3,
            linear_drp: 0.3,
            mixed_precision: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentParams {
    pub data_params: DataParams,
    pub optim_params: OptimParams,
    pub model_params: ModelParams,
}

impl ExperimentParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let data = &self.data_params;
        if data.labels.is_empty() {
            invalid("labels", "at least one label is required")?;
        }
        for (i, label) in data.labels.iter().enumerate() {
            if data.labels[..i].contains(label) {
                invalid("labels", format!("'{label}' is listed twice"))?;
            }
        }
        if data.age_start >= data.age_stop {
            invalid(
                "age_stop",
                format!("must exceed age_start ({} >= {})", data.age_start, data.age_stop),
            )?;
        }
        if data.bs == 0 {
            invalid("bs", "batch size must be at least 1")?;
        }

        let optim = &self.optim_params;
        if !(optim.lr.is_finite() && optim.lr > 0.0) {
            invalid("lr", format!("must be a positive number, got {}", optim.lr))?;
        }
        for (field, value) in [("lr_decay", optim.lr_decay), ("weight_decay", optim.weight_decay)] {
            if !(value.is_finite() && value >= 0.0) {
                invalid(field, format!("must be non-negative, got {value}"))?;
            }
        }

        let model = &self.model_params;
        if !(model.alpha_d.is_finite() && model.alpha_d > 0.0) {
            invalid("alpha_d", format!("must be positive, got {}", model.alpha_d))?;
        }
        if !(model.initrange.is_finite() && model.initrange >= 0.0) {
            invalid("initrange", format!("must be non-negative, got {}", model.initrange))?;
        }
        for (field, value) in [("input_drp", model.input_drp), ("linear_drp", model.linear_drp)] {
            if !(0.0..1.0).contains(&value) {
                invalid(field, format!("must be in [0, 1), got {value}"))?;
            }
        }
        if !(model.recency_decay > 0.0 && model.recency_decay <= 1.0) {
            invalid(
                "recency_decay",
                format!("must be in (0, 1], got {}", model.recency_decay),
            )?;
        }
        Ok(())
    }
}

/// The contents of `experiment.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSettings {
    pub config: RunConfig,
    pub params: ExperimentParams,
}

impl ExperimentSettings {
    /// Default settings for a new experiment on `dataset_path` predicting `labels`.
    pub fn new(name: impl Into<String>, dataset_path: impl Into<PathBuf>, labels: Vec<String>) -> Self {
        Self {
            config: RunConfig::new(name),
            params: ExperimentParams {
                data_params: DataParams {
                    dataset_path: dataset_path.into(),
                    labels,
                    ..DataParams::default()
                },
                ..ExperimentParams::default()
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Experiment {
    settings: ExperimentSettings,
    history: RunHistory,
}

impl Experiment {
    /// A new experiment with an empty history.
    pub fn create(settings: ExperimentSettings) -> Result<Self, LearnError> {
        if settings.config.name.trim().is_empty() {
            invalid("name", "experiment name must not be empty")?;
        }
        settings.params.validate()?;
        Ok(Self {
            settings,
            history: RunHistory::default(),
        })
    }

    /// A new experiment from `{path}/{name}/experiment.toml`, with an empty history.
    pub fn create_from_file(path: &Path, name: &str) -> Result<Self, LearnError> {
        let mut settings: ExperimentSettings = read_toml(&path.join(name).join(SETTINGS_FILE))?;
        settings.config.name = name.to_string();
        Self::create(settings)
    }

    /// An existing experiment: settings plus the saved history, if any.
    pub fn load(name: &str, path: &Path) -> Result<Self, LearnError> {
        let mut experiment = Self::create_from_file(path, name)?;
        let history_path = path.join(name).join(HISTORY_FILE);
        if history_path.exists() {
            experiment.history = read_json(&history_path)?;
        }
        println!("Loaded experiment from {}", path.join(name).display());
        Ok(experiment)
    }

    pub fn name(&self) -> &str {
        &self.settings.config.name
    }

    pub fn settings(&self) -> &ExperimentSettings {
        &self.settings
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub fn labels(&self) -> &[String] {
        &self.settings.params.data_params.labels
    }

    pub fn dir(&self) -> PathBuf {
        self.settings.config.path.join(self.name())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.settings.config.checkpoint_path.join(self.name())
    }

    /// Writes the history (and prediction summary, if any). The settings file is only
    /// written when it does not exist yet, so hand edits survive.
    pub fn save(&self) -> Result<PathBuf, LearnError> {
        let dir = self.dir();
        let history_path = dir.join(HISTORY_FILE);
        write_json_atomic(&history_path, &self.history)?;
        println!("Saved experiment to {}", history_path.display());

        let settings_path = dir.join(SETTINGS_FILE);
        if !settings_path.exists() {
            println!("No experiment settings file found, so creating it ..");
            write_toml_atomic(&settings_path, &self.settings)?;
            println!("Saved experiment settings to {}", settings_path.display());
        }

        if !self.history.prediction_summary.is_empty() {
            let summary_path = dir.join(SUMMARY_FILE);
            let csv_error = |source| LearnError::Csv {
                path: summary_path.clone(),
                source,
            };
            let mut writer = csv::WriterBuilder::new()
                .delimiter(b'\t')
                .from_writer(Vec::new());
            for row in &self.history.prediction_summary {
                writer.serialize(row).map_err(csv_error)?;
            }
            let bytes = writer
                .into_inner()
                .map_err(|e| csv_error(csv::Error::from(e.into_error())))?;
            write_atomic(&summary_path, &bytes)?;
        }
        Ok(dir)
    }

    fn age_span(&self) -> Result<AgeSpan, LearnError> {
        let data = &self.settings.params.data_params;
        let granularity = if data.age_in_months {
            Granularity::Month
        } else {
            Granularity::Year
        };
        Ok(AgeSpan::new(data.age_start, data.age_stop, granularity)?)
    }

    fn loader_config(&self, shuffle: bool, ctx: &RunContext) -> LoaderConfig {
        let data = &self.settings.params.data_params;
        LoaderConfig {
            batch_size: data.bs,
            num_workers: data.num_workers,
            shuffle,
            preserve_order: true,
            seed: ctx.derive_seed(SHUFFLE_STREAM),
        }
    }

    fn build_model(
        &self,
        vocabs: &VocabList,
        ctx: &RunContext,
    ) -> Result<(EmbeddingBagNet, Optimizer), LearnError> {
        let model_params = &self.settings.params.model_params;
        let dims = vocabs.all_embedding_dims(model_params.alpha_d);
        let config = NetConfig {
            pooling: match model_params.model {
                ModelKind::Mean => Pooling::Mean,
                ModelKind::Recency => Pooling::Recency {
                    decay: model_params.recency_decay as f32,
                },
            },
            linear_layers: model_params.linear_layers,
            initrange: model_params.initrange as f32,
            input_dropout: model_params.input_drp as f32,
            linear_dropout: model_params.linear_drp as f32,
            ..NetConfig::from_embedding_dims(&dims, self.labels().len())
        };
        let mut rng = StdRng::seed_from_u64(ctx.derive_seed(INIT_STREAM));
        let model = EmbeddingBagNet::new(config, &mut rng)?;

        let optim = &self.settings.params.optim_params;
        let optimizer = match optim.optim {
            OptimizerKind::Sgd => Optimizer::sgd(model.parameters()),
            OptimizerKind::Adam => Optimizer::adam(model.parameters(), AdamConfig::default()),
            OptimizerKind::Adagrad => Optimizer::adagrad(
                model.parameters(),
                AdagradConfig {
                    lr: optim.lr as f32,
                    lr_decay: optim.lr_decay as f32,
                    weight_decay: optim.weight_decay as f32,
                    eps: 1e-10,
                },
            ),
        };

        let count = count_parameters(&model);
        log::info!(
            "Model has {} parameters ({} trainable, {} non-trainable)",
            count.total,
            count.trainable,
            count.non_trainable
        );
        Ok((model, optimizer))
    }

    fn load_records(&self, split: Split) -> Result<Vec<PatientRecord>, LearnError> {
        let data = &self.settings.params.data_params;
        Ok(load_split(&data.dataset_path, split, &data.labels)?)
    }

    fn run_loop(
        &self,
        vocabs: &VocabList,
        ctx: &RunContext,
    ) -> Result<TrainEvalLoop<EmbeddingBagNet>, LearnError> {
        let (model, optimizer) = self.build_model(vocabs, ctx)?;
        Ok(TrainEvalLoop::new(
            model,
            optimizer,
            self.labels().to_vec(),
            self.checkpoint_dir(),
            self.settings.params.model_params.mixed_precision,
            ctx,
        ))
    }

    /// Trains on the train split, validates on the valid split and saves.
    pub fn fit(&mut self, options: &FitOptions, ctx: &RunContext) -> Result<FitReport, LearnError> {
        let dataset = self.settings.params.data_params.dataset_path.clone();
        let vocabs = VocabList::load(&dataset)?;
        let train = self.load_records(Split::Train)?;
        let valid = self.load_records(Split::Valid)?;
        let num_labels = self.labels().len();

        let encoder = PatientEncoder::new(&vocabs, self.age_span()?, &ctx.exceptions);
        let mut train_loader = BatchLoader::new(&train, &encoder, self.loader_config(true, ctx))?;
        let mut valid_loader = BatchLoader::new(&valid, &encoder, self.loader_config(false, ctx))?;
        let train_loss = BceWithLogits::new(positive_weights(&train, num_labels));
        let valid_loss = BceWithLogits::new(positive_weights(&valid, num_labels));

        let mut run = self.run_loop(&vocabs, ctx)?;
        let report = run.fit(
            &mut train_loader,
            &mut valid_loader,
            &train_loss,
            &valid_loss,
            &mut self.history,
            options,
        )?;
        if ctx.exceptions.recorded() > 0 {
            log::info!("{} unknown codes were mapped to xxunk", ctx.exceptions.recorded());
        }
        self.save()?;
        Ok(report)
    }

    /// Evaluates the checkpointed model on the test split, summarizes and saves.
    pub fn predict(&mut self, ctx: &RunContext) -> Result<Vec<PredictionRow>, LearnError> {
        let dataset = self.settings.params.data_params.dataset_path.clone();
        let vocabs = VocabList::load(&dataset)?;
        let test = self.load_records(Split::Test)?;

        let encoder = PatientEncoder::new(&vocabs, self.age_span()?, &ctx.exceptions);
        let mut test_loader = BatchLoader::new(&test, &encoder, self.loader_config(false, ctx))?;
        let test_loss = BceWithLogits::new(positive_weights(&test, self.labels().len()));

        let mut run = self.run_loop(&vocabs, ctx)?;
        run.predict(&mut test_loader, &test_loss, &mut self.history)?;
        let labels = self.labels().to_vec();
        let bootstrap = BootstrapConfig {
            seed: ctx.seed.map(|_| ctx.derive_seed(BOOTSTRAP_STREAM)),
            ..BootstrapConfig::default()
        };
        let rows = summarize_prediction(&mut self.history, &labels, bootstrap)?;
        self.save()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::history::EpochRow;
    use std::fs;
    use tempfile::tempdir;

    fn settings(store: &Path) -> ExperimentSettings {
        let mut s = ExperimentSettings::new("baseline", "/data/synthea", vec!["diabetes".to_string()]);
        s.config.path = store.join("experiments");
        s.config.checkpoint_path = store.join("models");
        s
    }

    #[test]
    fn defaults_follow_the_reference_configuration() {
        let s = ExperimentSettings::new("x", "d", vec!["a".to_string()]);
        let data = &s.params.data_params;
        assert_eq!((data.age_start, data.age_stop, data.bs, data.num_workers), (0, 20, 128, 0));
        assert!(!data.age_in_months);
        assert_eq!(s.params.optim_params.lr, 0.01);
        assert_eq!(s.params.model_params.alpha_d, 0.5736);
        assert_eq!(s.params.model_params.linear_layers, 4);
        assert!(s.params.validate().is_ok());
    }

    #[test]
    fn settings_round_trip_through_toml() {
        let dir = tempdir().unwrap();
        let mut s = settings(dir.path());
        s.params.optim_params.optim = OptimizerKind::Sgd;
        s.params.model_params.model = ModelKind::Recency;
        let text = toml::to_string_pretty(&s).unwrap();
        assert!(text.contains("optim = \"SGD\""));
        assert!(text.contains("model = \"recency\""));
        let back: ExperimentSettings = toml::from_str(&text).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let text = r#"
            [config]
            name = "minimal"
            path = "exp"
            desc = ""
            checkpoint_path = "models"

            [params.data_params]
            dataset_path = "data"
            labels = ["asthma"]

            [params.optim_params]

            [params.model_params]
            linear_layers = 2
        "#;
        let s: ExperimentSettings = toml::from_str(text).unwrap();
        assert_eq!(s.params.data_params.bs, 128);
        assert_eq!(s.params.model_params.linear_layers, 2);
        assert_eq!(s.params.optim_params.optim, OptimizerKind::Adam);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let dir = tempdir().unwrap();
        let mut s = settings(dir.path());
        s.params.data_params.age_stop = 0;
        assert!(matches!(
            Experiment::create(s),
            Err(LearnError::Config(ConfigError::Invalid { field: "age_stop", .. }))
        ));

        let mut s = settings(dir.path());
        s.params.model_params.input_drp = 1.5;
        assert!(Experiment::create(s).is_err());

        let mut s = settings(dir.path());
        s.params.data_params.labels = vec!["a".to_string(), "a".to_string()];
        assert!(Experiment::create(s).is_err());
    }

    #[test]
    fn save_keeps_hand_edited_settings_and_load_restores_history() {
        let dir = tempdir().unwrap();
        let mut experiment = Experiment::create(settings(dir.path())).unwrap();
        experiment.save().unwrap();
        let settings_path = experiment.dir().join(SETTINGS_FILE);
        assert!(settings_path.exists());

        let edited = fs::read_to_string(&settings_path)
            .unwrap()
            .replace("linear_layers = 4", "linear_layers = 1");
        fs::write(&settings_path, &edited).unwrap();

        experiment.history.train.push(EpochRow {
            epoch: 0,
            loss: 0.5,
            aurocs: vec![0.75],
        });
        experiment.save().unwrap();
        assert_eq!(fs::read_to_string(&settings_path).unwrap(), edited);
        assert!(!experiment.dir().join(SUMMARY_FILE).exists());

        let loaded = Experiment::load("baseline", &dir.path().join("experiments")).unwrap();
        assert_eq!(loaded.settings().params.model_params.linear_layers, 1);
        assert_eq!(loaded.history().train.len(), 1);
        assert_eq!(loaded.checkpoint_dir(), dir.path().join("models").join("baseline"));

        let fresh = Experiment::create_from_file(&dir.path().join("experiments"), "baseline").unwrap();
        assert!(fresh.history().train.is_empty());
    }

    #[test]
    fn prediction_summary_is_written_as_tsv() {
        let dir = tempdir().unwrap();
        let mut experiment = Experiment::create(settings(dir.path())).unwrap();
        experiment.history.prediction_summary.push(PredictionRow {
            label: "diabetes".to_string(),
            auroc: 0.8,
            optimal_threshold: 0.4,
            ci_lower: f64::NAN,
            ci_upper: f64::NAN,
        });
        experiment.save().unwrap();
        let tsv = fs::read_to_string(experiment.dir().join(SUMMARY_FILE)).unwrap();
        let mut lines = tsv.lines();
        assert_eq!(
            lines.next(),
            Some("label\tauroc\toptimal_threshold\tci_lower\tci_upper")
        );
        assert_eq!(lines.next(), Some("diabetes\t0.8\t0.4\t\t"));
    }
}
