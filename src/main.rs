use std::path::PathBuf;

use clap::Parser;
use eyre::Result;

use fuzzgate::config::{
    TrainConfig, DEFAULT_BATCH_SIZE, DEFAULT_DATA_DIR, DEFAULT_EPOCHS, DEFAULT_LEARNING_RATE,
    DEFAULT_THRESHOLD, DEFAULT_VALN_DIR,
};
use fuzzgate::model::DEFAULT_HEADS;
use fuzzgate::report::ReportFormat;

#[derive(Parser, Debug)]
#[command(
    name = "fuzzgate",
    about = "Train a pass/fail gate network on a corpus of fuzzlogs."
)]
struct Cli {
    /// Training passes over the corpus
    #[arg(default_value_t = DEFAULT_EPOCHS)]
    epochs: usize,

    /// Runs per gradient step (large batches tend to produce NaNs)
    #[arg(default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Number of parallel sigmoid heads
    #[arg(default_value_t = DEFAULT_HEADS)]
    heads: usize,

    /// Directory of `.s` / `.f` training fuzzlogs
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Directory of validation fuzzlogs, used only if it exists
    #[arg(long, default_value = DEFAULT_VALN_DIR)]
    valn_dir: PathBuf,

    /// Validation predictions above this count as success
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,

    /// Seed for initialization, shuffling and dropout
    #[arg(long)]
    seed: Option<u64>,

    /// Adam learning rate
    #[arg(long, default_value_t = DEFAULT_LEARNING_RATE)]
    learning_rate: f64,

    /// Score this fuzzlog with the trained network (repeatable)
    #[arg(long, value_name = "FUZZLOG")]
    predict: Vec<PathBuf>,

    /// Output format: summary or json
    #[arg(long, default_value = "summary")]
    format: String,
}

impl Cli {
    fn into_config(self) -> Result<(TrainConfig, ReportFormat)> {
        let format = ReportFormat::parse(&self.format)?;
        let config = TrainConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            heads: self.heads,
            data_dir: self.data_dir,
            valn_dir: Some(self.valn_dir),
            threshold: self.threshold,
            seed: self.seed,
            learning_rate: self.learning_rate,
            predict: self.predict,
        };
        Ok((config, format))
    }
}

fn run(cli: Cli) -> Result<()> {
    let (config, format) = cli.into_config()?;
    let report = fuzzgate::build_and_train(config)?;
    print!("{}", report.render(format)?);
    Ok(())
}

fn main() {
    // Logs go to stderr; stdout carries only the report.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}
