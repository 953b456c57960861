mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::TrainOverrides;
use pipeline::TrainArgs;

#[cfg(not(feature = "wgpu"))]
type TrainBackend = burn::backend::Autodiff<burn::backend::NdArray<f32>>;
#[cfg(feature = "wgpu")]
type TrainBackend = burn::backend::Autodiff<burn::backend::Wgpu>;

/// simclr: SimCLR contrastive pretraining with a disentangler bottleneck.
#[derive(Parser)]
#[command(name = "simclr", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Pretrain the disentangler, then train SimCLR on CIFAR-10.
    Train {
        /// Path to the TOML config (default: configs/simclr.toml if present).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Backbone architecture: resnet18 or resnet34.
        #[arg(long)]
        backbone: Option<String>,
        /// Source images per batch.
        #[arg(long)]
        batch_size: Option<usize>,
        /// Number of training epochs.
        #[arg(long)]
        epochs: Option<usize>,
        /// Peak learning rate.
        #[arg(long)]
        learning_rate: Option<f64>,
        /// SGD momentum.
        #[arg(long)]
        momentum: Option<f64>,
        /// SGD weight decay.
        #[arg(long)]
        weight_decay: Option<f64>,
        /// NT-Xent temperature.
        #[arg(long)]
        temperature: Option<f64>,
        /// Projection head output dimension.
        #[arg(long)]
        projection_dim: Option<usize>,
        /// Data loader worker threads.
        #[arg(long)]
        workers: Option<usize>,
        /// Epochs between checkpoints.
        #[arg(long)]
        log_interval: Option<usize>,
        /// Dataset root (downloaded here if missing).
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Directory for checkpoint files.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Seed for initialization, shuffling and augmentation.
        #[arg(long)]
        seed: Option<u64>,
        /// Disable progress bars.
        #[arg(long)]
        no_progress: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            backbone,
            batch_size,
            epochs,
            learning_rate,
            momentum,
            weight_decay,
            temperature,
            projection_dim,
            workers,
            log_interval,
            data_dir,
            output_dir,
            seed,
            no_progress,
        } => {
            let device = Default::default();
            pipeline::run_train::<TrainBackend>(
                TrainArgs {
                    config,
                    overrides: TrainOverrides {
                        backbone,
                        batch_size,
                        epochs,
                        learning_rate,
                        momentum,
                        weight_decay,
                        temperature,
                        projection_dim,
                        workers,
                        log_interval,
                        data_dir,
                        output_dir,
                        seed,
                    },
                    progress: !no_progress,
                },
                &device,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_train_overrides() {
        let cli = Cli::try_parse_from([
            "simclr",
            "train",
            "--backbone",
            "resnet34",
            "--epochs",
            "5",
            "--temperature",
            "0.2",
            "--no-progress",
        ])
        .unwrap();
        match cli.command {
            Command::Train {
                backbone,
                epochs,
                temperature,
                batch_size,
                no_progress,
                ..
            } => {
                assert_eq!(backbone.as_deref(), Some("resnet34"));
                assert_eq!(epochs, Some(5));
                assert_eq!(temperature, Some(0.2));
                assert_eq!(batch_size, None);
                assert!(no_progress);
            }
        }
    }
}
