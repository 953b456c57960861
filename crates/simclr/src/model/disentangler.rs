//! Predictability-minimization disentangler.
//!
//! A small convolutional autoencoder whose bottleneck is pushed towards
//! statistically independent units: a [`LatentPredictor`] learns to predict
//! each latent unit from all the others, and the encoder is trained to make
//! that prediction fail (see [`crate::training::pretrain`]).
//!
//! ```text
//! (batch, 3, s, s) in [0, 1]
//!   → normalize (CIFAR-10 mean/std)
//!   → conv4x4/2 (3→c) → ReLU → conv4x4/2 (c→2c) → ReLU → conv4x4/2 (2c→4c) → ReLU
//!   → flatten → Linear(4c·(s/8)² → z_dim) → sigmoid
//!   → z: (batch, z_dim)
//!
//! z → Linear(z_dim → 4c·(s/8)²) → ReLU → reshape
//!   → deconv4x4/2 (4c→2c) → ReLU → deconv4x4/2 (2c→c) → ReLU → deconv4x4/2 (c→3)
//!   → reconstruction in normalized space: (batch, 3, s, s)
//! ```

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::{Distribution, TensorData};

/// Per-channel mean of the CIFAR-10 training set.
pub const CIFAR10_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
/// Per-channel standard deviation of the CIFAR-10 training set.
pub const CIFAR10_STD: [f32; 3] = [0.2470, 0.2435, 0.2616];

/// Configuration for the disentangler autoencoder.
#[derive(Config, Debug)]
pub struct DisentanglerConfig {
    /// Bottleneck dimension.
    #[config(default = 32)]
    pub z_dim: usize,
    /// Channel width of the first encoder convolution.
    #[config(default = 32)]
    pub base_channels: usize,
    /// Input height and width. Must be divisible by 8.
    #[config(default = 32)]
    pub image_size: usize,
}

impl DisentanglerConfig {
    fn latent_hw(&self) -> usize {
        assert!(
            self.image_size >= 8 && self.image_size % 8 == 0,
            "image_size must be a positive multiple of 8, got {}",
            self.image_size
        );
        self.image_size / 8
    }

    fn flat_dim(&self) -> usize {
        let hw = self.latent_hw();
        4 * self.base_channels * hw * hw
    }

    /// Initialize the encoder half only (used when restoring a representation
    /// model whose disentangler weights come from a checkpoint).
    pub fn init_encoder<B: Backend>(&self, device: &B::Device) -> DisentanglerEncoder<B> {
        let c = self.base_channels;
        DisentanglerEncoder {
            conv1: down_conv(3, c, device),
            conv2: down_conv(c, 2 * c, device),
            conv3: down_conv(2 * c, 4 * c, device),
            fc: LinearConfig::new(self.flat_dim(), self.z_dim).init(device),
            z_dim: self.z_dim,
        }
    }

    /// Initialize the full autoencoder.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Disentangler<B> {
        let c = self.base_channels;
        let decoder = DisentanglerDecoder {
            fc: LinearConfig::new(self.z_dim, self.flat_dim()).init(device),
            deconv1: up_conv(4 * c, 2 * c, device),
            deconv2: up_conv(2 * c, c, device),
            deconv3: up_conv(c, 3, device),
            channels: 4 * c,
            latent_hw: self.latent_hw(),
        };
        Disentangler {
            encoder: self.init_encoder(device),
            decoder,
        }
    }

    /// Initialize a latent predictor sized for this bottleneck.
    pub fn init_predictor<B: Backend>(&self, device: &B::Device) -> LatentPredictor<B> {
        let std_dev = (1.0 / self.z_dim as f64).sqrt();
        LatentPredictor {
            weight: Param::from_tensor(Tensor::random(
                [self.z_dim, self.z_dim],
                Distribution::Normal(0.0, std_dev),
                device,
            )),
            bias: Param::from_tensor(Tensor::zeros([self.z_dim], device)),
        }
    }
}

fn down_conv<B: Backend>(d_in: usize, d_out: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([d_in, d_out], [4, 4])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

fn up_conv<B: Backend>(d_in: usize, d_out: usize, device: &B::Device) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([d_in, d_out], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .init(device)
}

fn channel_stats<B: Backend>(values: [f32; 3], device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(TensorData::new(values.to_vec(), [1, 3, 1, 1]), device)
}

/// Map `[0, 1]` images into CIFAR-10 normalized space.
pub fn normalize<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = x.device();
    (x - channel_stats(CIFAR10_MEAN, &device)) / channel_stats(CIFAR10_STD, &device)
}

/// Inverse of [`normalize`].
pub fn denormalize<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = x.device();
    x * channel_stats(CIFAR10_STD, &device) + channel_stats(CIFAR10_MEAN, &device)
}

/// Encoder half: images to a sigmoid bottleneck.
#[derive(Module, Debug)]
pub struct DisentanglerEncoder<B: Backend> {
    pub(crate) conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pub(crate) fc: Linear<B>,
    z_dim: usize,
}

impl<B: Backend> DisentanglerEncoder<B> {
    /// Input: `(batch, 3, s, s)` images in `[0, 1]`. Output: `(batch, z_dim)`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = normalize(x);
        self.forward_normalized(x)
    }

    /// Same as [`forward`](Self::forward) for inputs that are already normalized.
    pub fn forward_normalized(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.conv1.forward(x));
        let x = relu(self.conv2.forward(x));
        let x = relu(self.conv3.forward(x));
        let [batch, c, h, w] = x.dims();
        sigmoid(self.fc.forward(x.reshape([batch, c * h * w])))
    }

    pub fn z_dim(&self) -> usize {
        self.z_dim
    }
}

/// Decoder half: bottleneck back to normalized image space.
#[derive(Module, Debug)]
pub struct DisentanglerDecoder<B: Backend> {
    fc: Linear<B>,
    deconv1: ConvTranspose2d<B>,
    deconv2: ConvTranspose2d<B>,
    deconv3: ConvTranspose2d<B>,
    channels: usize,
    latent_hw: usize,
}

impl<B: Backend> DisentanglerDecoder<B> {
    /// Input: `(batch, z_dim)`. Output: `(batch, 3, s, s)`, normalized space.
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, _] = z.dims();
        let x = relu(self.fc.forward(z));
        let x = x.reshape([batch, self.channels, self.latent_hw, self.latent_hw]);
        let x = relu(self.deconv1.forward(x));
        let x = relu(self.deconv2.forward(x));
        self.deconv3.forward(x)
    }
}

/// Autoencoder trained during disentangler pretraining.
#[derive(Module, Debug)]
pub struct Disentangler<B: Backend> {
    pub encoder: DisentanglerEncoder<B>,
    pub decoder: DisentanglerDecoder<B>,
}

impl<B: Backend> Disentangler<B> {
    /// Encode `[0, 1]` images to the bottleneck.
    pub fn encode(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        self.encoder.forward(x)
    }

    /// Reconstruct `[0, 1]` images (output is denormalized, not clamped).
    pub fn reconstruct(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        denormalize(self.decoder.forward(self.encoder.forward(x)))
    }

    /// Drop the decoder, keeping the bottleneck encoder.
    pub fn into_encoder(self) -> DisentanglerEncoder<B> {
        self.encoder
    }
}

/// Predicts every latent unit from all other units.
///
/// A linear map whose weight diagonal is masked to zero, so output `i`
/// never sees input `i`.
#[derive(Module, Debug)]
pub struct LatentPredictor<B: Backend> {
    pub(crate) weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> LatentPredictor<B> {
    /// Input and output shape: `(batch, z_dim)`.
    pub fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 2> {
        let weight = self.weight.val();
        let [z_dim, _] = weight.dims();
        let device = weight.device();

        let mask: Vec<f32> = (0..z_dim * z_dim)
            .map(|i| if i / z_dim == i % z_dim { 0.0 } else { 1.0 })
            .collect();
        let mask = Tensor::<B, 2>::from_data(TensorData::new(mask, [z_dim, z_dim]), &device);

        let masked = weight * mask;
        z.matmul(masked.transpose()) + self.bias.val().unsqueeze_dim::<2>(0)
    }
}
