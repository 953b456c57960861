//! Training pipeline: config → data → disentangler → model → training loop.

use std::path::PathBuf;
use std::time::Instant;

use burn::data::dataset::Dataset;
use burn::tensor::backend::AutodiffBackend;

use simclr::{
    fit_disentangler, pair_loader, train, AugmentConfig, Augmenter, Cifar10Dataset,
    FileCheckpointSink, PairDataset, SimClr, SimClrConfig, Split, TrainingContext,
};

use crate::config::{load_simclr_toml, SimClrToml, TrainOverrides};

/// Default config location, used when `--config` is not given and it exists.
pub const DEFAULT_CONFIG: &str = "configs/simclr.toml";

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Explicit TOML config path.
    pub config: Option<PathBuf>,
    /// CLI overrides for `[train]` values.
    pub overrides: TrainOverrides,
    /// Draw per-epoch progress bars.
    pub progress: bool,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<SimClrToml> {
    match path {
        Some(path) => load_simclr_toml(path),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if default.exists() {
                load_simclr_toml(&default)
            } else {
                tracing::info!("No config file, using built-in defaults");
                Ok(SimClrToml::default())
            }
        }
    }
}

/// Pretrain the disentangler, then run SimCLR training and write checkpoints.
pub fn run_train<B: AutodiffBackend>(args: TrainArgs, device: &B::Device) -> anyhow::Result<()> {
    let start = Instant::now();

    // 1. Config and validation
    let toml = load_config(args.config.as_ref())?;
    let mut options = toml.train;
    options.apply(&args.overrides);
    let backbone = options.validate()?;
    let data_dir = options.resolved_data_dir()?;

    B::seed(options.seed);

    // 2. Dataset
    let raw = Cifar10Dataset::load_or_download(&data_dir, Split::Train)?;

    // 3. Disentangler pretraining on raw images
    let ae_config = toml.disentangler.model_config();
    let (disentangler, report) = fit_disentangler(
        &toml.disentangler.fit_config(),
        ae_config.init::<B>(device),
        ae_config.init_predictor::<B>(device),
        &raw,
        device,
    )?;
    tracing::info!(
        rec_loss = report.rec_loss.last().copied().unwrap_or_default(),
        adv_loss = report.adv_loss.last().copied().unwrap_or_default(),
        pixel_error = report.pixel_error,
        "Disentangler ready"
    );

    // 4. Representation model
    let model_config = SimClrConfig::new()
        .with_backbone(backbone)
        .with_projection_dim(options.projection_dim)
        .with_disentangler(ae_config);
    let model: SimClr<B> = model_config.init_with_disentangler(disentangler.into_encoder(), device);
    tracing::info!("Base model: {backbone}");
    tracing::info!(
        "feature dim: {} (backbone {} + latent {}), projection dim: {}",
        model.feature_dim(),
        model.backbone_dim(),
        model.feature_dim() - model.backbone_dim(),
        options.projection_dim
    );

    // 5. Paired-view loader
    let pairs = PairDataset::new(raw, Augmenter::new(AugmentConfig::new()), options.seed);
    let epoch_counter = pairs.epoch_counter();
    let num_images = pairs.len();
    let loader = pair_loader::<B, _>(pairs, options.batch_size, options.workers, device);

    // 6. Optimizer, schedule and checkpoint sink
    let train_config = options
        .training_config(backbone)
        .with_show_progress(args.progress);
    let total_steps = train_config.total_steps(num_images);
    let mut ctx = TrainingContext::new(
        model,
        train_config.optimizer().init::<B, SimClr<B>>(),
        train_config.learning_rate,
        train_config.min_learning_rate,
        total_steps,
    );
    let mut sink = FileCheckpointSink::new(&options.output_dir)?;
    sink.write_config(&model_config)?;

    // 7. Train
    let summary = train(&train_config, &mut ctx, loader.as_ref(), &epoch_counter, &mut sink)?;

    tracing::info!(
        steps = summary.steps,
        checkpoints = summary.checkpoints.len(),
        final_loss = summary.final_loss().unwrap_or_default(),
        output_dir = %sink.dir().display(),
        elapsed_secs = format!("{:.1}", start.elapsed().as_secs_f64()),
        "SimCLR run finished"
    );
    Ok(())
}
