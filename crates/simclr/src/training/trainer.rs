//! SimCLR training loop: SGD with Nesterov momentum and a per-step cosine
//! learning-rate schedule.
//!
//! Mutable training state (model, optimizer, step counter) lives in a
//! [`TrainingContext`]; checkpoints go through an injected [`CheckpointSink`].

use std::time::Instant;

use burn::data::dataloader::DataLoader;
use burn::optim::momentum::MomentumConfig;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};

use crate::data::pair::{EpochCounter, PairBatch};
use crate::model::bridge::tensor_to_f64;
use crate::model::resnet::Backbone;
use crate::model::simclr::SimClr;
use crate::training::checkpoint::{CheckpointMeta, CheckpointSink};
use crate::training::loss::nt_xent_loss;
use crate::training::metrics::LossMeter;

/// Configuration for contrastive training.
#[derive(Config, Debug)]
pub struct SimClrTrainingConfig {
    /// Number of passes over the dataset.
    #[config(default = 1000)]
    pub epochs: usize,
    /// Source images per batch (each contributes two views).
    #[config(default = 512)]
    pub batch_size: usize,
    /// Peak learning rate, reached at step 0.
    #[config(default = 0.6)]
    pub learning_rate: f64,
    /// Final learning rate at the last step.
    #[config(default = 1e-3)]
    pub min_learning_rate: f64,
    /// Nesterov momentum for SGD.
    #[config(default = 0.9)]
    pub momentum: f64,
    /// L2 weight decay for SGD.
    #[config(default = 1e-6)]
    pub weight_decay: f64,
    /// NT-Xent temperature.
    #[config(default = 0.5)]
    pub temperature: f64,
    /// Epochs between checkpoints (0 disables checkpointing).
    #[config(default = 50)]
    pub log_interval: usize,
    /// Backbone name recorded in checkpoint metadata and file names.
    #[config(default = "Backbone::Resnet18")]
    pub backbone: Backbone,
    /// Draw a terminal progress bar per epoch.
    #[config(default = true)]
    pub show_progress: bool,
}

impl SimClrTrainingConfig {
    /// SGD with Nesterov momentum and weight decay.
    pub fn optimizer(&self) -> SgdConfig {
        SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(self.momentum)
                    .with_dampening(0.0)
                    .with_nesterov(true),
            ))
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay as _)))
    }

    /// Full batches per epoch; the trailing partial batch is dropped.
    pub fn steps_per_epoch(&self, num_images: usize) -> usize {
        if self.batch_size == 0 {
            0
        } else {
            num_images / self.batch_size
        }
    }

    /// Schedule length for a dataset of `num_images` images.
    pub fn total_steps(&self, num_images: usize) -> usize {
        self.epochs * self.steps_per_epoch(num_images)
    }
}

/// Cosine-annealed learning rate at `step` of `total_steps`.
///
/// Returns `lr_max` at step 0 and exactly `lr_min` at `total_steps`; steps
/// past the end stay at `lr_min`. A zero-length schedule returns `lr_max`.
pub fn cosine_lr(step: usize, total_steps: usize, lr_max: f64, lr_min: f64) -> f64 {
    if total_steps == 0 {
        return lr_max;
    }
    let progress = step.min(total_steps) as f64 / total_steps as f64;
    let w = 0.5 * (1.0 - (std::f64::consts::PI * progress).cos());
    lr_min * w + lr_max * (1.0 - w)
}

/// Model, optimizer and schedule position for one training run.
pub struct TrainingContext<B: AutodiffBackend, O> {
    model: SimClr<B>,
    optimizer: O,
    lr_max: f64,
    lr_min: f64,
    total_steps: usize,
    step: usize,
}

impl<B, O> TrainingContext<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<SimClr<B>, B>,
{
    pub fn new(
        model: SimClr<B>,
        optimizer: O,
        lr_max: f64,
        lr_min: f64,
        total_steps: usize,
    ) -> Self {
        Self {
            model,
            optimizer,
            lr_max,
            lr_min,
            total_steps,
            step: 0,
        }
    }

    /// Learning rate the next optimizer step will use.
    pub fn current_lr(&self) -> f64 {
        cosine_lr(self.step, self.total_steps, self.lr_max, self.lr_min)
    }

    /// Optimizer steps taken so far.
    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn model(&self) -> &SimClr<B> {
        &self.model
    }

    /// One forward/backward/update on a `(2N, c, h, w)` batch of paired views.
    ///
    /// Returns the batch loss.
    pub fn step(&mut self, views: Tensor<B, 4>, temperature: f64) -> f64 {
        let lr = self.current_lr();

        let (_, projection) = self.model.forward(views);
        let loss = nt_xent_loss(projection, temperature);
        let loss_val = tensor_to_f64(loss.clone());

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self.optimizer.step(lr, self.model.clone(), grads);
        self.step += 1;

        loss_val
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone, Default)]
pub struct TrainingSummary {
    /// Optimizer steps taken.
    pub steps: usize,
    /// Average loss of each epoch, in order.
    pub epoch_losses: Vec<f64>,
    /// Epochs at which a checkpoint was written.
    pub checkpoints: Vec<usize>,
}

impl TrainingSummary {
    pub fn final_loss(&self) -> Option<f64> {
        self.epoch_losses.last().copied()
    }
}

const PROGRESS_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

fn epoch_progress(steps: usize, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(steps as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(PROGRESS_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

/// Run the contrastive training loop.
///
/// `loader` must yield full batches of `config.batch_size` pairs (see
/// [`pair_loader`](crate::data::pair::pair_loader)); its item count is the
/// number of steps per epoch, and `ctx` must be scheduled for exactly
/// `config.epochs` of them. For each epoch the augmentation epoch counter is
/// advanced, every batch is trained on, and a checkpoint is saved through
/// `sink` when `epoch >= log_interval && epoch % log_interval == 0`. Any error
/// aborts the run.
pub fn train<B, O>(
    config: &SimClrTrainingConfig,
    ctx: &mut TrainingContext<B, O>,
    loader: &dyn DataLoader<PairBatch<B>>,
    epoch_counter: &EpochCounter,
    sink: &mut dyn CheckpointSink<B>,
) -> anyhow::Result<TrainingSummary>
where
    B: AutodiffBackend,
    O: Optimizer<SimClr<B>, B>,
{
    let steps_per_epoch = loader.num_items();
    if steps_per_epoch == 0 {
        anyhow::bail!("Loader yields no full batch of {} pairs", config.batch_size);
    }
    let expected_steps = ctx.steps_taken() + config.epochs * steps_per_epoch;
    if ctx.total_steps() != expected_steps {
        anyhow::bail!(
            "Schedule of {} steps does not match {} epochs of {steps_per_epoch} batches",
            ctx.total_steps(),
            config.epochs
        );
    }

    tracing::info!(
        epochs = config.epochs,
        steps_per_epoch,
        total_steps = ctx.total_steps(),
        batch_size = config.batch_size,
        lr = config.learning_rate,
        temperature = config.temperature,
        "Starting SimCLR training"
    );

    let train_start = Instant::now();
    let mut summary = TrainingSummary::default();

    for epoch in 1..=config.epochs {
        epoch_counter.set(epoch);
        let mut meter = LossMeter::new();
        let pb = epoch_progress(steps_per_epoch, config.show_progress);
        let mut epoch_steps = 0;

        for batch in loader.iter() {
            let pairs = batch.num_pairs();
            if pairs != config.batch_size {
                anyhow::bail!(
                    "Epoch {epoch} got a batch of {pairs} pairs, expected {}",
                    config.batch_size
                );
            }

            let loss = ctx.step(batch.views, config.temperature);
            meter.update(loss, 2 * pairs);
            epoch_steps += 1;

            pb.inc(1);
            pb.set_message(format!("Train epoch {epoch}, SimCLR loss: {:.4}", meter.avg()));
        }
        pb.finish_and_clear();

        if epoch_steps != steps_per_epoch {
            anyhow::bail!("Epoch {epoch} produced {epoch_steps} of {steps_per_epoch} batches");
        }

        let avg = meter.avg();
        summary.epoch_losses.push(avg);
        tracing::info!(
            epoch,
            step = ctx.steps_taken(),
            lr = %format!("{:.2e}", ctx.current_lr()),
            "Train epoch {epoch}, SimCLR loss: {avg:.4}"
        );

        if config.log_interval > 0
            && epoch >= config.log_interval
            && epoch % config.log_interval == 0
        {
            tracing::info!("==> Save checkpoint. Train epoch {epoch}, SimCLR loss: {avg:.4}");
            let meta = CheckpointMeta {
                epoch,
                step: ctx.steps_taken(),
                backbone: config.backbone,
                loss: avg,
            };
            sink.save(ctx.model(), &meta)?;
            summary.checkpoints.push(epoch);
        }
    }

    summary.steps = ctx.steps_taken();
    tracing::info!(
        steps = summary.steps,
        checkpoints = summary.checkpoints.len(),
        elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
        "Training complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::augment::{AugmentConfig, Augmenter};
    use crate::data::cifar::{Cifar10Dataset, CifarImage};
    use crate::data::pair::{pair_loader, PairDataset};
    use crate::model::disentangler::DisentanglerConfig;
    use crate::model::simclr::SimClrConfig;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use std::sync::{Arc, Mutex};

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    #[derive(Default)]
    struct RecordingSink {
        saved: Vec<CheckpointMeta>,
    }

    impl<B: Backend> CheckpointSink<B> for RecordingSink {
        fn save(&mut self, _model: &SimClr<B>, meta: &CheckpointMeta) -> anyhow::Result<()> {
            self.saved.push(meta.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl<B: Backend> CheckpointSink<B> for FailingSink {
        fn save(&mut self, _model: &SimClr<B>, _meta: &CheckpointMeta) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    fn tiny_model() -> SimClr<TestAutodiffBackend> {
        SimClrConfig::new()
            .with_base_width(2)
            .with_projection_hidden(8)
            .with_projection_dim(4)
            .with_disentangler(DisentanglerConfig::new().with_z_dim(3).with_base_channels(2))
            .init(&Default::default())
    }

    fn images(n: usize) -> Cifar10Dataset {
        Cifar10Dataset::from_images(
            (0..n)
                .map(|i| CifarImage {
                    pixels: (0..3072).map(|p| ((p * 7 + i * 31) % 256) as u8).collect(),
                    label: (i % 10) as u8,
                })
                .collect(),
        )
    }

    type TestModel = SimClr<TestAutodiffBackend>;
    type TestLoader = Arc<dyn DataLoader<PairBatch<TestAutodiffBackend>>>;

    fn setup(
        config: &SimClrTrainingConfig,
        n: usize,
    ) -> (
        TrainingContext<TestAutodiffBackend, impl Optimizer<TestModel, TestAutodiffBackend>>,
        TestLoader,
        EpochCounter,
    ) {
        setup_with_workers(config, n, 0)
    }

    fn setup_with_workers(
        config: &SimClrTrainingConfig,
        n: usize,
        workers: usize,
    ) -> (
        TrainingContext<TestAutodiffBackend, impl Optimizer<TestModel, TestAutodiffBackend>>,
        TestLoader,
        EpochCounter,
    ) {
        let device = Default::default();
        let dataset = PairDataset::new(images(n), Augmenter::new(AugmentConfig::new()), 0);
        let counter = dataset.epoch_counter();
        let loader =
            pair_loader::<TestAutodiffBackend, _>(dataset, config.batch_size, workers, &device);
        let ctx = TrainingContext::new(
            tiny_model(),
            config
                .optimizer()
                .init::<TestAutodiffBackend, SimClr<TestAutodiffBackend>>(),
            config.learning_rate,
            config.min_learning_rate,
            config.total_steps(n),
        );
        (ctx, loader, counter)
    }

    fn quick_config() -> SimClrTrainingConfig {
        SimClrTrainingConfig::new()
            .with_epochs(2)
            .with_batch_size(2)
            .with_learning_rate(0.05)
            .with_log_interval(1)
            .with_show_progress(false)
    }

    #[test]
    fn test_cosine_lr_endpoints() {
        assert_eq!(cosine_lr(0, 100, 0.1, 0.001), 0.1);
        assert_eq!(cosine_lr(100, 100, 0.1, 0.001), 0.001);

        let mid = cosine_lr(50, 100, 0.1, 0.001);
        assert!((mid - 0.0505).abs() < 1e-12, "midpoint: {mid}");

        assert_eq!(cosine_lr(250, 100, 0.1, 0.001), 0.001);
        assert_eq!(cosine_lr(5, 0, 0.1, 0.001), 0.1);
    }

    #[test]
    fn test_cosine_lr_monotonic() {
        let rates: Vec<f64> = (0..=37).map(|s| cosine_lr(s, 37, 0.6, 1e-3)).collect();
        for pair in rates.windows(2) {
            assert!(pair[1] <= pair[0], "schedule increased: {} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_steps_per_epoch_drops_partial() {
        let config = SimClrTrainingConfig::new().with_batch_size(4).with_epochs(3);
        assert_eq!(config.steps_per_epoch(10), 2);
        assert_eq!(config.total_steps(10), 6);
        assert_eq!(config.steps_per_epoch(3), 0);
    }

    #[test]
    fn test_context_step_advances_schedule() {
        let config = quick_config();
        let (mut ctx, loader, _) = setup(&config, 4);
        assert_eq!(ctx.total_steps(), 4);
        assert_eq!(ctx.current_lr(), config.learning_rate);

        let batch = loader.iter().next().unwrap();
        let loss = ctx.step(batch.views, config.temperature);
        assert!(loss.is_finite() && loss >= 0.0);
        assert_eq!(ctx.steps_taken(), 1);
        assert!(ctx.current_lr() < config.learning_rate);
    }

    #[test]
    fn test_train_checkpoints_every_interval() {
        let config = quick_config().with_epochs(3).with_log_interval(2);
        let (mut ctx, loader, counter) = setup(&config, 4);
        let mut sink = RecordingSink::default();

        let summary = train(&config, &mut ctx, loader.as_ref(), &counter, &mut sink).unwrap();

        assert_eq!(summary.steps, 6);
        assert_eq!(summary.epoch_losses.len(), 3);
        assert!(summary.final_loss().unwrap().is_finite());
        assert_eq!(summary.checkpoints, vec![2]);
        assert_eq!(counter.get(), 3);

        assert_eq!(sink.saved.len(), 1);
        assert_eq!(sink.saved[0].epoch, 2);
        assert_eq!(sink.saved[0].step, 4);
        assert_eq!(sink.saved[0].backbone, Backbone::Resnet18);
    }

    #[test]
    fn test_log_interval_zero_disables_checkpoints() {
        let config = quick_config().with_log_interval(0);
        let (mut ctx, loader, counter) = setup(&config, 4);
        let mut sink = RecordingSink::default();
        let summary = train(&config, &mut ctx, loader.as_ref(), &counter, &mut sink).unwrap();
        assert!(sink.saved.is_empty());
        assert!(summary.checkpoints.is_empty());
    }

    #[test]
    fn test_partial_batches_are_dropped() {
        let config = quick_config().with_epochs(1).with_batch_size(2);
        let (mut ctx, loader, counter) = setup(&config, 5);
        let mut sink = RecordingSink::default();
        let summary = train(&config, &mut ctx, loader.as_ref(), &counter, &mut sink).unwrap();
        assert_eq!(summary.steps, 2);
    }

    #[test]
    fn test_worker_threads_keep_every_step_and_finish_schedule() {
        // 8 images, batch 3: 2 full batches per epoch whatever the worker count.
        let config = quick_config().with_batch_size(3).with_log_interval(0);
        for workers in [0, 1, 2, 4] {
            let (mut ctx, loader, counter) = setup_with_workers(&config, 8, workers);
            let summary =
                train(&config, &mut ctx, loader.as_ref(), &counter, &mut RecordingSink::default())
                    .unwrap();
            assert_eq!(summary.steps, 4, "workers = {workers}");
            assert_eq!(ctx.steps_taken(), ctx.total_steps());
            assert_eq!(
                ctx.current_lr(),
                config.min_learning_rate,
                "schedule should end at the minimum rate with {workers} workers"
            );
        }
    }

    #[test]
    fn test_schedule_mismatch_is_error() {
        let config = quick_config();
        let (_, loader, counter) = setup(&config, 4);
        let mut ctx = TrainingContext::new(
            tiny_model(),
            config
                .optimizer()
                .init::<TestAutodiffBackend, SimClr<TestAutodiffBackend>>(),
            config.learning_rate,
            config.min_learning_rate,
            config.total_steps(4) + 1,
        );
        let err = train(&config, &mut ctx, loader.as_ref(), &counter, &mut RecordingSink::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("does not match"), "{err}");
        assert_eq!(ctx.steps_taken(), 0);
    }

    #[test]
    fn test_too_small_dataset_is_error() {
        let config = quick_config().with_batch_size(8);
        let (mut ctx, loader, counter) = setup(&config, 4);
        let err = train(&config, &mut ctx, loader.as_ref(), &counter, &mut RecordingSink::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("no full batch"));
        assert_eq!(ctx.steps_taken(), 0);
    }

    #[test]
    fn test_sink_failure_aborts_run() {
        let config = quick_config().with_epochs(3);
        let (mut ctx, loader, counter) = setup(&config, 4);
        let result = train(&config, &mut ctx, loader.as_ref(), &counter, &mut FailingSink);
        assert!(result.unwrap_err().to_string().contains("disk full"));
        assert_eq!(ctx.steps_taken(), 2, "run should stop after the first epoch");
    }

    #[test]
    fn test_shared_sink_records_epochs() {
        let shared: Arc<Mutex<Vec<usize>>> = Arc::default();

        struct SharedSink(Arc<Mutex<Vec<usize>>>);
        impl<B: Backend> CheckpointSink<B> for SharedSink {
            fn save(&mut self, _model: &SimClr<B>, meta: &CheckpointMeta) -> anyhow::Result<()> {
                self.0
                    .lock()
                    .map_err(|_| anyhow::anyhow!("poisoned"))?
                    .push(meta.epoch);
                Ok(())
            }
        }

        let config = quick_config();
        let (mut ctx, loader, counter) = setup(&config, 2);
        let mut sink = SharedSink(shared.clone());
        train(&config, &mut ctx, loader.as_ref(), &counter, &mut sink).unwrap();
        assert_eq!(*shared.lock().unwrap(), vec![1, 2]);
    }
}
