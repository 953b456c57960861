//! TOML config loading for the SimCLR CLI.
//!
//! Deserializes `configs/simclr.toml` which has `[train]` and `[disentangler]`
//! sections, every field defaulted, then merges with CLI overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use simclr::{Backbone, DisentanglerConfig, DisentanglerFitConfig, SimClrTrainingConfig};

/// Top-level structure matching `configs/simclr.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct SimClrToml {
    /// Contrastive training options.
    #[serde(default)]
    pub train: TrainSection,
    /// Disentangler pretraining options.
    #[serde(default)]
    pub disentangler: DisentanglerSection,
}

/// `[train]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainSection {
    /// Backbone name, `resnet18` or `resnet34`. Parsed during validation.
    pub backbone: String,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub temperature: f64,
    pub projection_dim: usize,
    /// Data loader worker threads (0 loads on the main thread).
    pub workers: usize,
    /// Epochs between checkpoints.
    pub log_interval: usize,
    /// Dataset root; relative paths resolve against the working directory.
    pub data_dir: PathBuf,
    /// Checkpoint directory.
    pub output_dir: PathBuf,
    pub seed: u64,
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            backbone: "resnet18".to_string(),
            batch_size: 512,
            epochs: 1000,
            learning_rate: 0.6,
            momentum: 0.9,
            weight_decay: 1e-6,
            temperature: 0.5,
            projection_dim: 128,
            workers: 16,
            log_interval: 50,
            data_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("."),
            seed: 0,
        }
    }
}

/// `[disentangler]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisentanglerSection {
    pub iterations: usize,
    pub adversarial_ratio: f64,
    pub predictor_iters: usize,
    pub learning_rate: f64,
    pub batch_size: usize,
    pub z_dim: usize,
}

impl Default for DisentanglerSection {
    fn default() -> Self {
        Self {
            iterations: 100,
            adversarial_ratio: 0.1,
            predictor_iters: 5,
            learning_rate: 1e-3,
            batch_size: 100,
            z_dim: 32,
        }
    }
}

impl DisentanglerSection {
    pub fn model_config(&self) -> DisentanglerConfig {
        DisentanglerConfig::new().with_z_dim(self.z_dim)
    }

    /// Fit config; sampling is seeded with 0 so the bottleneck is reproducible.
    pub fn fit_config(&self) -> DisentanglerFitConfig {
        DisentanglerFitConfig::new()
            .with_iterations(self.iterations)
            .with_adversarial_ratio(self.adversarial_ratio)
            .with_predictor_iters(self.predictor_iters)
            .with_learning_rate(self.learning_rate)
            .with_batch_size(self.batch_size)
            .with_seed(0)
    }
}

/// CLI flags that override `[train]` values.
#[derive(Debug, Default, Clone)]
pub struct TrainOverrides {
    pub backbone: Option<String>,
    pub batch_size: Option<usize>,
    pub epochs: Option<usize>,
    pub learning_rate: Option<f64>,
    pub momentum: Option<f64>,
    pub weight_decay: Option<f64>,
    pub temperature: Option<f64>,
    pub projection_dim: Option<usize>,
    pub workers: Option<usize>,
    pub log_interval: Option<usize>,
    pub data_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub seed: Option<u64>,
}

impl TrainSection {
    /// Apply CLI overrides. Priority chain: defaults < TOML values < CLI flags.
    pub fn apply(&mut self, o: &TrainOverrides) {
        if let Some(v) = &o.backbone {
            self.backbone = v.clone();
        }
        if let Some(v) = o.batch_size {
            self.batch_size = v;
        }
        if let Some(v) = o.epochs {
            self.epochs = v;
        }
        if let Some(v) = o.learning_rate {
            self.learning_rate = v;
        }
        if let Some(v) = o.momentum {
            self.momentum = v;
        }
        if let Some(v) = o.weight_decay {
            self.weight_decay = v;
        }
        if let Some(v) = o.temperature {
            self.temperature = v;
        }
        if let Some(v) = o.projection_dim {
            self.projection_dim = v;
        }
        if let Some(v) = o.workers {
            self.workers = v;
        }
        if let Some(v) = o.log_interval {
            self.log_interval = v;
        }
        if let Some(v) = &o.data_dir {
            self.data_dir = v.clone();
        }
        if let Some(v) = &o.output_dir {
            self.output_dir = v.clone();
        }
        if let Some(v) = o.seed {
            self.seed = v;
        }
    }

    /// Check options before any expensive work. Returns the parsed backbone.
    pub fn validate(&self) -> anyhow::Result<Backbone> {
        let backbone: Backbone = self.backbone.parse()?;
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.epochs == 0 {
            anyhow::bail!("epochs must be positive");
        }
        if self.temperature.is_nan() || self.temperature <= 0.0 {
            anyhow::bail!("temperature must be positive, got {}", self.temperature);
        }
        if self.projection_dim == 0 {
            anyhow::bail!("projection_dim must be positive");
        }
        Ok(backbone)
    }

    pub fn training_config(&self, backbone: Backbone) -> SimClrTrainingConfig {
        SimClrTrainingConfig::new()
            .with_backbone(backbone)
            .with_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.learning_rate)
            .with_momentum(self.momentum)
            .with_weight_decay(self.weight_decay)
            .with_temperature(self.temperature)
            .with_log_interval(self.log_interval)
    }

    /// `data_dir` as an absolute path.
    pub fn resolved_data_dir(&self) -> anyhow::Result<PathBuf> {
        if self.data_dir.is_absolute() {
            Ok(self.data_dir.clone())
        } else {
            Ok(std::env::current_dir()?.join(&self.data_dir))
        }
    }
}

/// Load and deserialize a `SimClrToml` from a TOML file.
pub fn load_simclr_toml(path: &Path) -> anyhow::Result<SimClrToml> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
    let config: SimClrToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded SimCLR config");
    Ok(config)
}
