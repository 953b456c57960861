//! CIFAR-variant ResNet backbones (ResNet-18 / ResNet-34).
//!
//! Differs from the ImageNet layout in the stem: a single 3x3 stride-1
//! convolution and no max-pool, so 32x32 inputs keep enough spatial extent
//! for four stages. The classifier is dropped; `forward` returns pooled
//! features of width `8 * base_width`.

use std::fmt;
use std::str::FromStr;

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};

/// Backbone architecture choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    Resnet18,
    Resnet34,
}

/// Returned when a backbone name is not one of the supported architectures.
#[derive(Debug, thiserror::Error)]
#[error("unknown backbone '{0}' (expected one of: resnet18, resnet34)")]
pub struct UnknownBackbone(pub String);

impl Backbone {
    /// Number of BasicBlocks in each of the four stages.
    pub fn block_counts(self) -> [usize; 4] {
        match self {
            Self::Resnet18 => [2, 2, 2, 2],
            Self::Resnet34 => [3, 4, 6, 3],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resnet18 => "resnet18",
            Self::Resnet34 => "resnet34",
        }
    }
}

impl fmt::Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backbone {
    type Err = UnknownBackbone;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "resnet18" => Ok(Self::Resnet18),
            "resnet34" => Ok(Self::Resnet34),
            _ => Err(UnknownBackbone(s.to_string())),
        }
    }
}

/// Configuration for a [`ResNet`] backbone.
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Block layout.
    #[config(default = "Backbone::Resnet18")]
    pub backbone: Backbone,
    /// Channel width of the first stage; stages use w, 2w, 4w, 8w.
    #[config(default = 64)]
    pub base_width: usize,
    /// Input image channels.
    #[config(default = 3)]
    pub in_channels: usize,
}

/// 1x1 projection shortcut used when a block changes resolution or width.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

/// Two 3x3 convolutions with a residual connection.
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(d_in: usize, d_out: usize, stride: usize, device: &B::Device) -> Self {
        let downsample = (stride != 1 || d_in != d_out).then(|| Downsample {
            conv: Conv2dConfig::new([d_in, d_out], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(d_out).init(device),
        });

        Self {
            conv1: conv3x3(d_in, d_out, stride, device),
            bn1: BatchNormConfig::new(d_out).init(device),
            conv2: conv3x3(d_out, d_out, 1, device),
            bn2: BatchNormConfig::new(d_out).init(device),
            downsample,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(ds) => ds.bn.forward(ds.conv.forward(x.clone())),
            None => x.clone(),
        };

        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let out = self.bn2.forward(self.conv2.forward(out));
        relu(out + identity)
    }
}

fn conv3x3<B: Backend>(d_in: usize, d_out: usize, stride: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([d_in, d_out], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

/// ResNet feature extractor.
///
/// ```text
/// (batch, 3, H, W)
///   → conv3x3(3→w) → BN → ReLU
///   → stage1 (w, stride 1) → stage2 (2w, stride 2)
///   → stage3 (4w, stride 2) → stage4 (8w, stride 2)
///   → global avg pool → flatten
///   → features: (batch, 8w)
/// ```
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub(crate) stem_conv: Conv2d<B>,
    stem_bn: BatchNorm<B, 2>,
    blocks: Vec<BasicBlock<B>>,
    pool: AdaptiveAvgPool2d,
    feature_dim: usize,
}

impl ResNetConfig {
    /// Initialize a ResNet with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let widths = [1, 2, 4, 8].map(|m| m * self.base_width);
        let strides = [1, 2, 2, 2];

        let mut blocks = Vec::new();
        let mut d_in = self.base_width;
        for ((count, width), stride) in self
            .backbone
            .block_counts()
            .into_iter()
            .zip(widths)
            .zip(strides)
        {
            for i in 0..count {
                let s = if i == 0 { stride } else { 1 };
                blocks.push(BasicBlock::new(d_in, width, s, device));
                d_in = width;
            }
        }

        ResNet {
            stem_conv: conv3x3(self.in_channels, self.base_width, 1, device),
            stem_bn: BatchNormConfig::new(self.base_width).init(device),
            blocks,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            feature_dim: d_in,
        }
    }
}

impl<B: Backend> ResNet<B> {
    /// Input shape: `(batch, c, h, w)`. Output shape: `(batch, feature_dim)`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = relu(self.stem_bn.forward(self.stem_conv.forward(x)));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let [batch, channels, _, _] = x.dims();
        self.pool.forward(x).reshape([batch, channels])
    }

    /// Width of the pooled feature vector.
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_backbone_parse() {
        assert_eq!("resnet18".parse::<Backbone>().unwrap(), Backbone::Resnet18);
        assert_eq!("ResNet34".parse::<Backbone>().unwrap(), Backbone::Resnet34);
        let err = "resnet50".parse::<Backbone>().unwrap_err();
        assert!(err.to_string().contains("resnet50"));
        assert_eq!(Backbone::Resnet34.to_string(), "resnet34");
    }

    #[test]
    fn test_block_layout() {
        let device = Default::default();
        let r18 = ResNetConfig::new().with_base_width(4).init::<TestBackend>(&device);
        let r34 = ResNetConfig::new()
            .with_backbone(Backbone::Resnet34)
            .with_base_width(4)
            .init::<TestBackend>(&device);
        assert_eq!(r18.num_blocks(), 8);
        assert_eq!(r34.num_blocks(), 16);
        assert_eq!(r18.feature_dim(), 32);
        assert_eq!(r34.feature_dim(), 32);
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = ResNetConfig::new().with_base_width(4).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [2, 3, 32, 32],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let features = model.forward(input);
        assert_eq!(features.dims(), [2, 32]);
    }
}
