use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

use crate::model::disentangler::{DisentanglerConfig, DisentanglerEncoder};
use crate::model::resnet::{Backbone, ResNet, ResNetConfig};

/// Configuration for the SimCLR representation model.
///
/// ```text
/// (batch, 3, 32, 32)
///   ├→ ResNet backbone            → (batch, 8w)
///   └→ disentangler encoder       → (batch, z_dim)
///   → concat → feature: (batch, 8w + z_dim)
///   → Linear(feature → hidden) → ReLU → Linear(hidden → projection_dim)
///   → projection: (batch, projection_dim)
/// ```
#[derive(Config, Debug)]
pub struct SimClrConfig {
    /// Backbone architecture.
    #[config(default = "Backbone::Resnet18")]
    pub backbone: Backbone,
    /// Output dimension of the projection head (the contrastive embedding).
    #[config(default = 128)]
    pub projection_dim: usize,
    /// Hidden width of the projection head.
    #[config(default = 2048)]
    pub projection_hidden: usize,
    /// Backbone stage-1 width.
    #[config(default = 64)]
    pub base_width: usize,
    /// Disentangler architecture; must match the fitted disentangler.
    #[config(default = "DisentanglerConfig::new()")]
    pub disentangler: DisentanglerConfig,
    /// Keep the pretrained disentangler fixed during contrastive training.
    #[config(default = true)]
    pub freeze_disentangler: bool,
}

/// Backbone encoder + disentangler bottleneck + projection head.
#[derive(Module, Debug)]
pub struct SimClr<B: Backend> {
    pub(crate) backbone: ResNet<B>,
    pub(crate) disentangler: DisentanglerEncoder<B>,
    pub(crate) projector_in: Linear<B>,
    pub(crate) projector_out: Linear<B>,
}

impl SimClrConfig {
    fn resnet(&self) -> ResNetConfig {
        ResNetConfig::new()
            .with_backbone(self.backbone)
            .with_base_width(self.base_width)
    }

    /// Initialize with a fresh (untrained) disentangler encoder.
    ///
    /// Used to build the skeleton a checkpoint is loaded into.
    pub fn init<B: Backend>(&self, device: &B::Device) -> SimClr<B> {
        self.init_with_disentangler(self.disentangler.init_encoder(device), device)
    }

    /// Initialize around an already fitted disentangler encoder.
    pub fn init_with_disentangler<B: Backend>(
        &self,
        disentangler: DisentanglerEncoder<B>,
        device: &B::Device,
    ) -> SimClr<B> {
        assert_eq!(
            disentangler.z_dim(),
            self.disentangler.z_dim,
            "disentangler bottleneck does not match config"
        );
        let disentangler = if self.freeze_disentangler {
            disentangler.no_grad()
        } else {
            disentangler
        };

        let backbone = self.resnet().init(device);
        let feature_dim = backbone.feature_dim() + self.disentangler.z_dim;

        SimClr {
            backbone,
            disentangler,
            projector_in: LinearConfig::new(feature_dim, self.projection_hidden).init(device),
            projector_out: LinearConfig::new(self.projection_hidden, self.projection_dim)
                .init(device),
        }
    }
}

impl<B: Backend> SimClr<B> {
    /// Returns `(feature, projection)`.
    ///
    /// Input shape: `(batch, 3, h, w)` with values in `[0, 1]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let backbone_features = self.backbone.forward(x.clone());
        let latent = self.disentangler.forward(x);
        let feature = Tensor::cat(vec![backbone_features, latent], 1);

        let hidden = relu(self.projector_in.forward(feature.clone()));
        let projection = self.projector_out.forward(hidden);
        (feature, projection)
    }

    /// Width of the representation returned as `feature`.
    pub fn feature_dim(&self) -> usize {
        self.backbone.feature_dim() + self.disentangler.z_dim()
    }

    /// Width of the backbone part of the representation.
    pub fn backbone_dim(&self) -> usize {
        self.backbone.feature_dim()
    }
}
