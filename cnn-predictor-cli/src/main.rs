use anyhow::Result;
use clap::{Parser, Subcommand};
use cnn_predictor::config::DEFAULT_LIMIT;
use cnn_predictor::{get_all_models, CnnPredictor, PredictorConfig, Session};
use cnn_predictor_cli::{format_predictions, predict_samples, read_features};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List checkpoints in a results directory
    List {
        #[arg(long)]
        model_dir: PathBuf,
        /// Case-insensitive file name prefix, such as `step1_`
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Predict the top classes of every sample in a feature file
    Predict {
        #[arg(long)]
        model_dir: PathBuf,
        /// Checkpoint base name, without `.meta`
        #[arg(long)]
        model: String,
        /// Scope the model's variables were saved under
        #[arg(long)]
        scope: String,
        /// Feature matrix, one flattened sample per line
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 1)]
        k: usize,
        /// Samples evaluated per pass
        #[arg(long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Args::parse().command {
        Command::List { model_dir, prefix } => {
            for name in get_all_models(&model_dir, &prefix)? {
                println!("{name}");
            }
        }
        Command::Predict { model_dir, model, scope, input, k, limit } => {
            let features = read_features(&input)?;
            let mut session = Session::new();
            let config = PredictorConfig::new().with_k(k).with_limit(limit);
            let predictor =
                CnnPredictor::with_config(&mut session, &scope, &model_dir, &model, config)?;
            let top = predict_samples(&predictor, features.view())?;
            info!(samples = top.nrows(), k = top.k(), "Predicted");
            for line in format_predictions(&top) {
                println!("{line}");
            }
        }
    }
    Ok(())
}
