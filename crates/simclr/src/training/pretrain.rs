//! Disentangler pretraining by predictability minimization.
//!
//! Each iteration samples a batch of raw images, then
//! 1. trains the [`LatentPredictor`] for `predictor_iters` Adam steps to
//!    predict each latent unit from the others (on detached latents),
//! 2. takes one Adam step on the autoencoder minimizing
//!    `rec_loss - adversarial_ratio * adv_loss`, i.e. reconstructing well while
//!    making the latents hard to predict from one another.

use burn::data::dataset::Dataset;
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::data::cifar::{CifarImage, CHANNELS, IMAGE_SIZE};
use crate::model::bridge::{images_to_tensor, tensor_to_f64};
use crate::model::disentangler::{normalize, Disentangler, LatentPredictor};

/// Hyperparameters for [`fit_disentangler`].
#[derive(Config, Debug)]
pub struct DisentanglerFitConfig {
    /// Number of outer iterations (one autoencoder step each).
    #[config(default = 100)]
    pub iterations: usize,
    /// Weight of the adversarial (predictability) term.
    #[config(default = 0.1)]
    pub adversarial_ratio: f64,
    /// Predictor steps per iteration.
    #[config(default = 5)]
    pub predictor_iters: usize,
    /// Adam learning rate for both optimizers.
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    /// Images sampled per iteration (capped at the dataset size).
    #[config(default = 100)]
    pub batch_size: usize,
    /// Seed for batch sampling.
    #[config(default = 0)]
    pub seed: u64,
    /// Iterations between progress logs (0 disables).
    #[config(default = 20)]
    pub log_interval: usize,
}

/// Per-iteration loss histories from a fit.
#[derive(Debug, Clone, Default)]
pub struct DisentanglerFitReport {
    pub rec_loss: Vec<f64>,
    pub adv_loss: Vec<f64>,
    /// Predictor loss of the last predictor step in each iteration.
    pub pred_loss: Vec<f64>,
    /// Pixel-space MSE of the fitted autoencoder on a fresh sample, in `[0, 1]` units.
    pub pixel_error: f64,
}

fn mse<B: Backend, const D: usize>(prediction: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    MseLoss::new().forward(prediction, target, Reduction::Mean)
}

/// Sample `batch_size` distinct images as a `[0, 1]` tensor.
fn sample_batch<B: Backend, D: Dataset<CifarImage>>(
    dataset: &D,
    rng: &mut StdRng,
    batch_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let pixels: Vec<Vec<f32>> = rand::seq::index::sample(rng, dataset.len(), batch_size)
        .iter()
        .filter_map(|i| dataset.get(i))
        .map(|img| img.to_unit_floats())
        .collect();
    images_to_tensor::<B, _>(&pixels, [CHANNELS, IMAGE_SIZE, IMAGE_SIZE], device)
}

/// Fit the disentangler on raw (unaugmented) images.
///
/// Returns the trained autoencoder and the loss histories. Fails if the
/// dataset is empty.
pub fn fit_disentangler<B, D>(
    config: &DisentanglerFitConfig,
    mut model: Disentangler<B>,
    mut predictor: LatentPredictor<B>,
    dataset: &D,
    device: &B::Device,
) -> anyhow::Result<(Disentangler<B>, DisentanglerFitReport)>
where
    B: AutodiffBackend,
    D: Dataset<CifarImage>,
{
    let len = dataset.len();
    if len == 0 {
        anyhow::bail!("Cannot fit disentangler on an empty dataset");
    }
    let batch_size = config.batch_size.clamp(1, len);

    tracing::info!(
        iterations = config.iterations,
        batch_size,
        adversarial_ratio = config.adversarial_ratio,
        predictor_iters = config.predictor_iters,
        "Fitting disentangler"
    );

    let mut ae_optim = AdamConfig::new().init();
    let mut pred_optim = AdamConfig::new().init();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut report = DisentanglerFitReport::default();

    for iteration in 0..config.iterations {
        let x = normalize(sample_batch::<B, _>(dataset, &mut rng, batch_size, device));

        // (a) predictor on frozen latents
        let z_fixed = model.encoder.forward_normalized(x.clone()).detach();
        let mut pred_val = 0.0;
        for _ in 0..config.predictor_iters {
            let pred_loss = mse(predictor.forward(z_fixed.clone()), z_fixed.clone());
            pred_val = tensor_to_f64(pred_loss.clone());
            let grads = GradientsParams::from_grads(pred_loss.backward(), &predictor);
            predictor = pred_optim.step(config.learning_rate, predictor, grads);
        }

        // (b) autoencoder against the current predictor
        let z = model.encoder.forward_normalized(x.clone());
        let rec_loss = mse(model.decoder.forward(z.clone()), x);
        let adv_loss = mse(predictor.forward(z.clone()), z);
        let rec_val = tensor_to_f64(rec_loss.clone());
        let adv_val = tensor_to_f64(adv_loss.clone());

        let loss = rec_loss - adv_loss * config.adversarial_ratio;
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = ae_optim.step(config.learning_rate, model, grads);

        report.rec_loss.push(rec_val);
        report.adv_loss.push(adv_val);
        report.pred_loss.push(pred_val);

        if config.log_interval > 0 && (iteration + 1) % config.log_interval == 0 {
            tracing::info!(
                iteration = iteration + 1,
                rec_loss = format!("{rec_val:.4}"),
                adv_loss = format!("{adv_val:.4}"),
                pred_loss = format!("{pred_val:.4}"),
                "Disentangler progress"
            );
        }
    }

    let raw = sample_batch::<B, _>(dataset, &mut rng, batch_size, device);
    let reconstruction = model.reconstruct(raw.clone()).clamp(0.0, 1.0);
    report.pixel_error = tensor_to_f64(mse(reconstruction, raw));

    tracing::info!(
        final_rec_loss = report.rec_loss.last().copied().unwrap_or_default(),
        pixel_error = format!("{:.4}", report.pixel_error),
        "Disentangler fit complete"
    );
    Ok((model, report))
}
