//! Checkpoint persistence.
//!
//! The training loop only sees [`CheckpointSink`]; [`FileCheckpointSink`] is
//! the filesystem implementation used by the CLI.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use crate::model::resnet::Backbone;
use crate::model::simclr::{SimClr, SimClrConfig};

/// File name of the model config written next to checkpoints.
pub const CONFIG_FILE: &str = "simclr_config.json";

/// Metadata saved alongside each checkpoint.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Epoch just completed (1-based).
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub step: usize,
    pub backbone: Backbone,
    /// Average training loss over the epoch.
    pub loss: f64,
}

/// Destination for periodic model snapshots.
pub trait CheckpointSink<B: Backend> {
    fn save(&mut self, model: &SimClr<B>, meta: &CheckpointMeta) -> anyhow::Result<()>;
}

/// Writes `simclr_{backbone}_epoch{epoch}.mpk` and a matching `.json` meta file.
#[derive(Debug, Clone)]
pub struct FileCheckpointSink {
    dir: PathBuf,
}

impl FileCheckpointSink {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| {
                anyhow::anyhow!("Failed to create checkpoint dir {}: {e}", dir.display())
            })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path stem (no extension) of the checkpoint for `backbone` at `epoch`.
    pub fn checkpoint_stem(&self, backbone: Backbone, epoch: usize) -> PathBuf {
        self.dir.join(format!("simclr_{backbone}_epoch{epoch}"))
    }

    /// Write the model config so checkpoints in this directory can be reloaded.
    pub fn write_config(&self, config: &SimClrConfig) -> anyhow::Result<PathBuf> {
        let path = self.dir.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;
        Ok(path)
    }
}

impl<B: Backend> CheckpointSink<B> for FileCheckpointSink {
    fn save(&mut self, model: &SimClr<B>, meta: &CheckpointMeta) -> anyhow::Result<()> {
        let stem = self.checkpoint_stem(meta.backbone, meta.epoch);
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(stem.clone(), &recorder)
            .map_err(|e| anyhow::anyhow!("Failed to save model at epoch {}: {e}", meta.epoch))?;

        let meta_path = stem.with_extension("json");
        serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, meta)?;

        tracing::debug!(path = %stem.display(), "Checkpoint written");
        Ok(())
    }
}

/// Read a config written by [`FileCheckpointSink::write_config`].
pub fn load_config(dir: &Path) -> anyhow::Result<SimClrConfig> {
    let path = dir.join(CONFIG_FILE);
    let file = std::fs::File::open(&path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
    let config: SimClrConfig = serde_json::from_reader(file)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))?;
    Ok(config)
}

/// Load a [`SimClr`] model from a checkpoint file.
///
/// Creates a fresh model from config, then loads saved weights on top.
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    config: &SimClrConfig,
    device: &B::Device,
) -> anyhow::Result<SimClr<B>> {
    let model = config
        .init::<B>(device)
        .load_file(
            path.to_path_buf(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
            device,
        )
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", path.display()))?;
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::disentangler::DisentanglerConfig;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn tiny_config() -> SimClrConfig {
        SimClrConfig::new()
            .with_base_width(2)
            .with_projection_hidden(8)
            .with_projection_dim(4)
            .with_disentangler(DisentanglerConfig::new().with_z_dim(3).with_base_channels(2))
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let tmp = TempDir::new().unwrap();
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);

        let mut sink = FileCheckpointSink::new(tmp.path().join("ckpt")).unwrap();
        sink.write_config(&config).unwrap();
        let meta = CheckpointMeta {
            epoch: 3,
            step: 12,
            backbone: Backbone::Resnet18,
            loss: 1.25,
        };
        CheckpointSink::<TestBackend>::save(&mut sink, &model, &meta).unwrap();

        let stem = sink.checkpoint_stem(Backbone::Resnet18, 3);
        assert!(stem.ends_with("simclr_resnet18_epoch3"));
        assert!(stem.with_extension("mpk").exists());
        let saved_meta: CheckpointMeta =
            serde_json::from_reader(std::fs::File::open(stem.with_extension("json")).unwrap())
                .unwrap();
        assert_eq!(saved_meta, meta);

        let loaded_config = load_config(sink.dir()).unwrap();
        assert_eq!(loaded_config.projection_dim, 4);
        let restored =
            load_checkpoint::<TestBackend>(&stem.with_extension("mpk"), &loaded_config, &device)
                .unwrap();

        let x = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);
        let (_, expected) = model.forward(x.clone());
        let (_, actual) = restored.forward(x);
        let diff: f32 = (expected - actual).abs().max().into_scalar().elem();
        assert!(diff < 1e-5, "restored model diverges by {diff}");
    }

    #[test]
    fn test_load_missing_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let result = load_checkpoint::<TestBackend>(
            &tmp.path().join("missing.mpk"),
            &tiny_config(),
            &Default::default(),
        );
        assert!(result.is_err());
        assert!(load_config(tmp.path()).is_err());
    }
}
