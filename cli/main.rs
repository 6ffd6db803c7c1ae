#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use ehrlearn::RunContext;
use ehrlearn::learn::experiment::{DEFAULT_EXPERIMENT_STORE, DEFAULT_MODEL_STORE};
use ehrlearn::learn::{Experiment, ExperimentSettings, FitOptions, ModelKind, OptimizerKind};
use ehrlearn::vocab::VocabList;

#[derive(Clone, Copy, ValueEnum)]
pub enum OptimCli {
    Sgd,
    Adam,
    Adagrad,
}

impl From<OptimCli> for OptimizerKind {
    fn from(value: OptimCli) -> Self {
        match value {
            OptimCli::Sgd => OptimizerKind::Sgd,
            OptimCli::Adam => OptimizerKind::Adam,
            OptimCli::Adagrad => OptimizerKind::Adagrad,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModelCli {
    Mean,
    Recency,
}

impl From<ModelCli> for ModelKind {
    fn from(value: ModelCli) -> Self {
        match value {
            ModelCli::Mean => ModelKind::Mean,
            ModelCli::Recency => ModelKind::Recency,
        }
    }
}

#[derive(Args)]
pub struct RuntimeArgs {
    /// Directory holding experiments
    #[arg(long, default_value = DEFAULT_EXPERIMENT_STORE)]
    pub experiments: PathBuf,

    /// Directory for the daily unknown-code log
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Seed for initialisation, shuffling, dropout and bootstrap resampling
    #[arg(long)]
    pub seed: Option<u64>,
}

impl RuntimeArgs {
    fn context(&self) -> RunContext {
        RunContext::with_log_dir(&self.log_dir, self.seed)
    }
}

#[derive(Args)]
pub struct CreateArgs {
    /// Experiment name
    pub name: String,

    /// Dataset root containing the cleaned/ tables
    #[arg(long)]
    pub dataset: PathBuf,

    /// Comma-separated label columns of patients.csv
    #[arg(long, value_delimiter = ',', required = true)]
    pub labels: Vec<String>,

    #[arg(long, default_value = "")]
    pub desc: String,

    /// Directory holding experiments
    #[arg(long, default_value = DEFAULT_EXPERIMENT_STORE)]
    pub experiments: PathBuf,

    /// Directory holding checkpoints
    #[arg(long, default_value = DEFAULT_MODEL_STORE)]
    pub models: PathBuf,

    #[arg(long, value_enum, default_value_t = OptimCli::Adam)]
    pub optim: OptimCli,

    /// Temporal pooling over age buckets
    #[arg(long, value_enum, default_value_t = ModelCli::Mean)]
    pub model: ModelCli,

    #[arg(long, default_value = "0")]
    pub age_start: u32,

    #[arg(long, default_value = "20")]
    pub age_stop: u32,

    /// Bucket events by month of age instead of year
    #[arg(long)]
    pub age_in_months: bool,

    #[arg(long, default_value = "128")]
    pub bs: usize,

    /// Batch encoding threads; 0 encodes on the training thread
    #[arg(long, default_value = "0")]
    pub num_workers: usize,

    /// Learning rate (Adagrad)
    #[arg(long, default_value = "0.01")]
    pub lr: f64,

    #[arg(long, default_value = "0")]
    pub lr_decay: f64,

    #[arg(long, default_value = "0")]
    pub weight_decay: f64,

    /// Embedding-width scaling exponent
    #[arg(long, default_value = "0.5736")]
    pub alpha_d: f64,

    #[arg(long, default_value = "4")]
    pub linear_layers: usize,

    #[arg(long, default_value = "0.3")]
    pub initrange: f64,

    #[arg(long, default_value = "0.3")]
    pub input_drp: f64,

    #[arg(long, default_value = "0.3")]
    pub linear_drp: f64,

    /// Per-bucket decay for --model recency
    #[arg(long, default_value = "0.8")]
    pub recency_decay: f64,

    /// Train with dynamic loss scaling
    #[arg(long)]
    pub mixed_precision: bool,
}

#[derive(Args)]
pub struct FitArgs {
    /// Experiment name
    pub name: String,

    #[arg(long)]
    pub epochs: usize,

    /// Resume from the experiment's checkpoint
    #[arg(long)]
    pub from_checkpoint: bool,

    /// Do not write a checkpoint after the last epoch
    #[arg(long)]
    pub no_checkpoint: bool,

    /// Fraction of epochs printed in the progress table
    #[arg(long, default_value = "0.75")]
    pub verbosity: f64,

    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

#[derive(Parser)]
#[command(
    name = "ehrlearn",
    about = "Vocabulary building, patient encoding and onset prediction on cleaned EHR tables",
    long_about = "Builds code vocabularies from cleaned EHR tables, trains an embedding-bag \
                  classifier predicting multiple condition labels per patient, and summarizes \
                  test-set performance with AUROC, optimal thresholds and bootstrap intervals."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and save the vocabularies of a dataset
    #[command(about = "Build vocabularies (outputs: processed/vocabs.json)")]
    Vocab {
        /// Dataset root containing cleaned/train/codes
        #[arg(value_name = "DATASET")]
        dataset: PathBuf,

        /// Representative values per numeric observation (code, unit)
        #[arg(long, default_value = "5")]
        num_buckets: usize,
    },

    /// Create a new experiment
    #[command(about = "Create an experiment (outputs: experiment.toml)")]
    Create(CreateArgs),

    /// Train an experiment's model
    #[command(about = "Train and validate (outputs: checkpoint.json, history.json)")]
    Fit(FitArgs),

    /// Evaluate the checkpointed model on the test split
    #[command(about = "Predict and summarize (outputs: prediction_summary.tsv)")]
    Predict {
        /// Experiment name
        name: String,

        #[command(flatten)]
        runtime: RuntimeArgs,
    },

    /// Display version information
    #[command(about = "Display version information")]
    Version,
}

fn run_vocab(dataset: PathBuf, num_buckets: usize) -> Result<(), Box<dyn std::error::Error>> {
    println!("Building vocabularies from {}", dataset.display());
    let vocabs = VocabList::create(&dataset, num_buckets)?;
    let dims = vocabs.default_embedding_dims();
    println!(
        "Demographic embedding width {}, record embedding width {}",
        dims.demographics_width, dims.records_width
    );
    let path = vocabs.save()?;
    println!("Saved vocab list to {}", path.display());
    Ok(())
}

fn run_create(args: CreateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = ExperimentSettings::new(args.name, args.dataset, args.labels);
    settings.config.desc = args.desc;
    settings.config.path = args.experiments;
    settings.config.checkpoint_path = args.models;

    let data = &mut settings.params.data_params;
    data.age_start = args.age_start;
    data.age_stop = args.age_stop;
    data.age_in_months = args.age_in_months;
    data.bs = args.bs;
    data.num_workers = args.num_workers;

    let optim = &mut settings.params.optim_params;
    optim.optim = args.optim.into();
    optim.lr = args.lr;
    optim.lr_decay = args.lr_decay;
    optim.weight_decay = args.weight_decay;

    let model = &mut settings.params.model_params;
    model.model = args.model.into();
    model.alpha_d = args.alpha_d;
    model.linear_layers = args.linear_layers;
    model.initrange = args.initrange;
    model.input_drp = args.input_drp;
    model.linear_drp = args.linear_drp;
    model.recency_decay = args.recency_decay;
    model.mixed_precision = args.mixed_precision;

    let experiment = Experiment::create(settings)?;
    let dir = experiment.save()?;
    println!("Created experiment '{}' in {}", experiment.name(), dir.display());
    Ok(())
}

fn run_fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = args.runtime.context();
    let mut experiment = Experiment::load(&args.name, &args.runtime.experiments)?;
    let options = FitOptions {
        epochs: args.epochs,
        from_checkpoint: args.from_checkpoint,
        to_checkpoint: !args.no_checkpoint,
        verbosity: args.verbosity,
    };
    let report = experiment.fit(&options, &ctx)?;
    println!(
        "Trained epochs {}..={} of '{}'",
        report.start_epoch,
        report.end_epoch,
        experiment.name()
    );
    if report.skipped_steps > 0 {
        println!("{} optimizer steps were skipped on gradient overflow", report.skipped_steps);
    }
    if ctx.exceptions.recorded() > 0 {
        if let Some(file) = ctx.exceptions.current_file() {
            println!(
                "{} unknown codes were logged to {}",
                ctx.exceptions.recorded(),
                file.display()
            );
        }
    }
    Ok(())
}

fn run_predict(name: String, runtime: RuntimeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = runtime.context();
    let mut experiment = Experiment::load(&name, &runtime.experiments)?;
    experiment.predict(&ctx)?;
    Ok(())
}

fn print_version_info() {
    println!("ehrlearn {}", env!("CARGO_PKG_VERSION"));
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Vocab {
            dataset,
            num_buckets,
        }) => run_vocab(dataset, num_buckets),
        Some(Commands::Create(args)) => run_create(args),
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Predict { name, runtime }) => run_predict(name, runtime),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
