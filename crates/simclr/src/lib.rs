//! SimCLR contrastive pretraining with a predictability-minimization
//! disentangler.
//!
//! A ResNet backbone and a pretrained disentangler bottleneck feed a projection
//! head trained with the NT-Xent loss on pairs of augmented CIFAR-10 views.
//! Everything is generic over the burn `Backend`.

pub mod data;
pub mod model;
pub mod training;

pub use data::augment::{AugmentConfig, Augmenter};
pub use data::cifar::{Cifar10Dataset, CifarImage, DataError, Split};
pub use data::pair::{pair_loader, EpochCounter, PairBatch, PairBatcher, PairBatches, PairDataset};
pub use model::disentangler::{Disentangler, DisentanglerConfig, LatentPredictor};
pub use model::resnet::{Backbone, UnknownBackbone};
pub use model::simclr::{SimClr, SimClrConfig};
pub use training::checkpoint::{
    load_checkpoint, load_config, CheckpointMeta, CheckpointSink, FileCheckpointSink,
};
pub use training::loss::nt_xent_loss;
pub use training::pretrain::{fit_disentangler, DisentanglerFitConfig, DisentanglerFitReport};
pub use training::trainer::{
    cosine_lr, train, SimClrTrainingConfig, TrainingContext, TrainingSummary,
};
